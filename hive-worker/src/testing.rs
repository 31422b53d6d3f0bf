//! Test doubles shared by the unit tests

use async_trait::async_trait;
use hive_client::{ClientError, PollReply};
use hive_core::domain::log::LogLine;
use hive_core::domain::task::{TaskAction, TrainingTask};
use hive_core::dto::task::TaskReply;
use hive_core::dto::worker::EnrollResponse;
use std::collections::VecDeque;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::repository::{LogSink, MasterApi};

type ApiResult<T> = Result<T, ClientError>;

/// Master whose replies are queued up front
///
/// An empty queue answers like an idle master: no task on poll, `continue`
/// on progress and an acknowledgment on final reports.
#[derive(Default)]
pub struct ScriptedMaster {
    pub enroll_replies: Mutex<VecDeque<ApiResult<EnrollResponse>>>,
    pub poll_replies: Mutex<VecDeque<ApiResult<PollReply>>>,
    pub task_replies: Mutex<VecDeque<ApiResult<TaskReply>>>,
    pub reports: Mutex<Vec<(String, TaskAction)>>,
    pub logs: Mutex<Vec<LogLine>>,
    pub tensorboards: Mutex<Vec<String>>,
}

impl ScriptedMaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_enroll(&self, reply: ApiResult<EnrollResponse>) {
        self.enroll_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_poll(&self, reply: ApiResult<PollReply>) {
        self.poll_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_task(&self, reply: ApiResult<TaskReply>) {
        self.task_replies.lock().unwrap().push_back(reply);
    }

    pub fn reports(&self) -> Vec<(String, TaskAction)> {
        self.reports.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<TaskAction> {
        self.reports().into_iter().map(|(_, action)| action).collect()
    }

    pub fn log_text(&self) -> String {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .map(|l| l.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Interpreter stand-in
///
/// `-m venv DIR` links itself as `DIR/bin/python`, `-m pip ...` records the
/// call in `venv/pip.log` and `-u SCRIPT` runs SCRIPT with `sh`.
pub fn fake_python(dir: &Path) -> PathBuf {
    let path = dir.join("fake-python");
    std::fs::write(
        &path,
        r#"#!/bin/sh
case "$1 $2" in
  "-m venv")
    mkdir -p "$3/bin"
    ln -sf "$0" "$3/bin/python"
    exit 0
    ;;
  "-m pip")
    echo "$@" >> "$(dirname "$0")/../pip.log"
    exit 0
    ;;
esac
if [ "$1" = "-u" ]; then
  shift
  exec sh "$@"
fi
exit 2
"#,
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Poll `config` of a worker-role task with a zero keep-alive interval
pub fn task_config(task_uuid: &str) -> serde_json::Value {
    serde_json::json!({
        "task_uuid": task_uuid,
        "job_uuid": "job-1",
        "task_role": "worker",
        "task_index": 0,
        "cluster_spec": {"worker": ["127.0.0.1:7000"]},
        "keep_alive_interval": 0,
        "signal_finish": true
    })
}

pub fn sample_task(task_uuid: &str, keep_alive: u64) -> TrainingTask {
    let mut task = TrainingTask::from_config(&task_config(task_uuid)).unwrap();
    task.keep_alive_interval = keep_alive;
    task
}

/// Gzip'd tarball holding `(path, content)` files
pub fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
        Vec::new(),
        flate2::Compression::default(),
    ));
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn reply(result: &str) -> TaskReply {
    TaskReply {
        result: result.to_string(),
        ..Default::default()
    }
}

pub fn parse_error() -> ClientError {
    ClientError::ParseError("truncated body".to_string())
}

#[async_trait]
impl MasterApi for ScriptedMaster {
    async fn enroll(&self, _uuid: &str, _passcode: &str) -> ApiResult<EnrollResponse> {
        self.enroll_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(EnrollResponse {
                    auth_token: Some("token".to_string()),
                })
            })
    }

    async fn poll(&self, _token: &str, _port: u16) -> ApiResult<PollReply> {
        self.poll_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(PollReply::NoTask))
    }

    async fn report_task(
        &self,
        _token: &str,
        task_uuid: &str,
        action: TaskAction,
    ) -> ApiResult<TaskReply> {
        self.reports
            .lock()
            .unwrap()
            .push((task_uuid.to_string(), action));

        let scripted = self.task_replies.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(match action {
                TaskAction::Progress => reply("continue"),
                _ => reply("stop"),
            })
        })
    }

    async fn mark_tensorboard_created(&self, _token: &str, task_uuid: &str) -> ApiResult<String> {
        self.tensorboards
            .lock()
            .unwrap()
            .push(task_uuid.to_string());
        Ok(format!("http://tensorboard/{}", task_uuid))
    }

    async fn send_logs(&self, _token: &str, _task_uuid: &str, lines: Vec<LogLine>) -> ApiResult<()> {
        self.logs.lock().unwrap().extend(lines);
        Ok(())
    }
}

/// Sink collecting lines in memory, optionally failing every send
#[derive(Default)]
pub struct MemorySink {
    pub lines: Mutex<Vec<String>>,
    pub fail: bool,
}

impl MemorySink {
    pub fn failing() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogSink for MemorySink {
    async fn send(&self, lines: Vec<LogLine>) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("sink unavailable");
        }
        self.lines
            .lock()
            .unwrap()
            .extend(lines.into_iter().map(|l| l.line));
        Ok(())
    }
}
