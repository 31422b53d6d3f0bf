//! Hive Core
//!
//! Core types shared by the Hive worker agent and its master client.
//!
//! This crate contains:
//! - Domain types: training tasks, worker kinds, task roles and log lines
//! - DTOs: request and response bodies of the master's worker API

pub mod domain;
pub mod dto;
