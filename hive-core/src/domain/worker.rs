//! Worker domain model

use serde::{Deserialize, Serialize};

/// Hardware class a worker advertises to the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    #[default]
    Cpu,
    Gpu,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Cpu => "cpu",
            WorkerKind::Gpu => "gpu",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(WorkerKind::Cpu),
            "gpu" => Ok(WorkerKind::Gpu),
            other => Err(format!("unknown worker kind '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_kind_parse() {
        assert_eq!("GPU".parse::<WorkerKind>(), Ok(WorkerKind::Gpu));
        assert_eq!("cpu".parse::<WorkerKind>(), Ok(WorkerKind::Cpu));
        assert!("tpu".parse::<WorkerKind>().is_err());
    }
}
