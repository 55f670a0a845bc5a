//! Service configuration, read from environment variables.
//!
//! - `BIND_ADDR`: listen address (default: 0.0.0.0:5001)
//! - `JOBS_DIR`: root of the per-job directories (default: ./batch_jobs)
//! - `WORKER_PROGRAM`: interpreter for the worker script (default: python3,
//!   empty to execute the script directly)
//! - `WORKER_SCRIPT`: worker script path (default: ./batch_processor.py)
//! - `URL_MARKER`: substring a CSV line must contain to be processed
//!   (default: realtor.com)
//! - `STOP_GRACE_MS`: delay between SIGTERM and the forced kill (default: 5000)
//! - `MAX_UPLOAD_BYTES`: upload body limit (default: 10 MiB)
//! - `HEARTBEAT_SECS`: supervisor heartbeat interval (default: 60)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub bind_addr: SocketAddr,
    pub jobs_dir: PathBuf,
    pub worker_program: Option<PathBuf>,
    pub worker_script: PathBuf,
    pub url_marker: String,
    pub stop_grace: Duration,
    pub max_upload_bytes: usize,
    pub heartbeat_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5001)),
            jobs_dir: PathBuf::from("./batch_jobs"),
            worker_program: Some(PathBuf::from("python3")),
            worker_script: PathBuf::from("./batch_processor.py"),
            url_marker: "realtor.com".to_string(),
            stop_grace: Duration::from_millis(5000),
            max_upload_bytes: 10 * 1024 * 1024,
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup, falling back to the
    /// default for anything missing or invalid.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let worker_program = match lookup("WORKER_PROGRAM") {
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(PathBuf::from(v)),
            None => defaults.worker_program,
        };

        Self {
            bind_addr: parsed(&lookup, "BIND_ADDR").unwrap_or(defaults.bind_addr),
            jobs_dir: lookup("JOBS_DIR").map(PathBuf::from).unwrap_or(defaults.jobs_dir),
            worker_program,
            worker_script: lookup("WORKER_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or(defaults.worker_script),
            url_marker: lookup("URL_MARKER")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.url_marker),
            stop_grace: parsed(&lookup, "STOP_GRACE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.stop_grace),
            max_upload_bytes: parsed(&lookup, "MAX_UPLOAD_BYTES")
                .unwrap_or(defaults.max_upload_bytes),
            heartbeat_interval: parsed(&lookup, "HEARTBEAT_SECS")
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
        }
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}, using default", key, raw);
            None
        }
    }
}
