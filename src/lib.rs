//! Batch Job Supervisor Library
//!
//! Accepts CSV uploads of target URLs, runs one external worker process per
//! upload, and tracks those runs in memory with a per-job directory on disk
//! as the durable fallback.
//!
//! ## Module Overview
//!
//! - `job`: Job models, config parsing and the status state machine
//! - `store`: Per-job directory persistence (snapshot, log, progress)
//! - `registry`: In-memory job registry
//! - `launcher`: Worker process spawning, output capture, termination
//! - `supervisor`: The start/status/list/stop/logs/cleanup operations
//! - `api`: Axum HTTP facade
//! - `config`: Environment-based configuration
//! - `telemetry`: OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use batch_supervisor::{
//!     config::SupervisorConfig,
//!     supervisor::{BatchSupervisor, CsvUpload},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let supervisor = Arc::new(BatchSupervisor::new(&SupervisorConfig::from_env()));
//!
//!     let started = supervisor
//!         .start(CsvUpload {
//!             content: b"https://www.realtor.com/realestateagents/jane-doe\n".to_vec(),
//!             tags: Some("buyer,hot".to_string()),
//!             ..Default::default()
//!         })
//!         .unwrap();
//!
//!     let job = supervisor.status(&started.job_id).unwrap();
//!     println!("{} is {}", job.job_id, job.status);
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod job;
pub mod launcher;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod telemetry;
