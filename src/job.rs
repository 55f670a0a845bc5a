//! Job models and state management for batch URL runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

pub const DEFAULT_BATCH_SIZE: u32 = 5;
pub const DEFAULT_TAB_DELAY: f64 = 3.0;
pub const DEFAULT_BATCH_DELAY: f64 = 15.0;

const MAX_BATCH_SIZE: u32 = 100;
const MAX_TAB_DELAY: f64 = 300.0;
const MAX_BATCH_DELAY: f64 = 3600.0;

/// Generates a job identifier: `batch_<unix millis>_<9 hex chars>`.
pub fn generate_job_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("batch_{}_{}", Utc::now().timestamp_millis(), &suffix[..9])
}

/// Job ids double as directory names, so only `[A-Za-z0-9_-]` is accepted.
pub fn is_valid_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id.len() <= 128
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parameters a job is started with. Immutable once the job exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub batch_size: u32,
    /// Seconds between items.
    pub tab_delay: f64,
    /// Seconds between chunks.
    pub batch_delay: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            tab_delay: DEFAULT_TAB_DELAY,
            batch_delay: DEFAULT_BATCH_DELAY,
            tags: Vec::new(),
        }
    }
}

impl JobConfig {
    /// Builds a config from raw form values.
    ///
    /// Values that are absent or do not parse fall back to the defaults;
    /// values that parse but are out of range are clamped.
    pub fn from_form(
        batch_size: Option<&str>,
        tab_delay: Option<&str>,
        batch_delay: Option<&str>,
        tags: Option<&str>,
    ) -> Self {
        let batch_size = batch_size
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|v| v.clamp(1, MAX_BATCH_SIZE as i64) as u32)
            .unwrap_or(DEFAULT_BATCH_SIZE);

        Self {
            batch_size,
            tab_delay: parse_delay(tab_delay, DEFAULT_TAB_DELAY, MAX_TAB_DELAY),
            batch_delay: parse_delay(batch_delay, DEFAULT_BATCH_DELAY, MAX_BATCH_DELAY),
            tags: tags.map(parse_tags).unwrap_or_default(),
        }
    }
}

fn parse_delay(raw: Option<&str>, default: f64, max: f64) -> f64 {
    raw.and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, max))
        .unwrap_or(default)
}

/// Splits a comma list into trimmed, non-empty tags.
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Returns the lines of an uploaded CSV that the worker should process:
/// non-blank lines containing `marker`, trimmed.
pub fn qualifying_lines<'a>(content: &'a str, marker: &str) -> Vec<&'a str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && line.contains(marker))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Starting => write!(f, "starting"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Counters reported by the worker through `progress.json`.
///
/// Advisory only: the supervisor never updates these itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProgress {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub successful: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default, alias = "last_update", skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

/// Paths of the files that make up a job directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFiles {
    pub csv_path: PathBuf,
    pub log_path: PathBuf,
    pub progress_path: PathBuf,
    pub config_path: PathBuf,
}

/// Serializable projection of a job. This is what `config.json` holds and
/// what the HTTP layer returns; the live process handle never appears here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub config: JobConfig,
    pub total_urls: usize,
    /// `None` until the worker reports; never defaulted to zeros.
    #[serde(default)]
    pub progress: Option<WorkerProgress>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub files: JobFiles,
}

impl JobSnapshot {
    pub fn new(job_id: String, config: JobConfig, total_urls: usize, files: JobFiles) -> Self {
        Self {
            job_id,
            status: JobStatus::Starting,
            config,
            total_urls,
            progress: None,
            start_time: Utc::now(),
            end_time: None,
            exit_code: None,
            error: None,
            files,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
    }

    /// Moves the job into `status` if it is not terminal yet.
    ///
    /// Returns `false` (and changes nothing) when a terminal state was
    /// already recorded.
    pub fn finish(&mut self, status: JobStatus) -> bool {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.end_time = Some(Utc::now());
        true
    }

    pub fn mark_failed(&mut self, error: String) -> bool {
        let changed = self.finish(JobStatus::Failed);
        if changed {
            self.error = Some(error);
        }
        changed
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| end.signed_duration_since(self.start_time).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn files() -> JobFiles {
        JobFiles {
            csv_path: "/tmp/j/urls.csv".into(),
            log_path: "/tmp/j/batch.log".into(),
            progress_path: "/tmp/j/progress.json".into(),
            config_path: "/tmp/j/config.json".into(),
        }
    }

    #[test]
    fn test_job_id_format() {
        let id = generate_job_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "batch");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert_ne!(id, generate_job_id());
    }

    #[test]
    fn test_config_from_form() {
        let config = JobConfig::from_form(Some("5"), Some("3"), Some("15"), Some("buyer, hot,,"));
        assert_eq!(
            config,
            JobConfig {
                batch_size: 5,
                tab_delay: 3.0,
                batch_delay: 15.0,
                tags: vec!["buyer".to_string(), "hot".to_string()],
            }
        );
    }

    #[test]
    fn test_config_defaults_and_clamping() {
        let config = JobConfig::from_form(Some("abc"), None, Some("NaN"), None);
        assert_eq!(config, JobConfig::default());

        let config = JobConfig::from_form(Some("0"), Some("-4"), Some("99999"), Some(""));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.tab_delay, 0.0);
        assert_eq!(config.batch_delay, 3600.0);
        assert!(config.tags.is_empty());

        let config = JobConfig::from_form(Some("1000"), None, None, None);
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_qualifying_lines() {
        let csv = "url\nhttps://www.realtor.com/realestateagents/a\n\n  \nhttps://example.com/x\n https://www.realtor.com/realestateagents/b \n";
        assert_eq!(
            qualifying_lines(csv, "realtor.com"),
            vec![
                "https://www.realtor.com/realestateagents/a",
                "https://www.realtor.com/realestateagents/b",
            ]
        );
    }

    #[test]
    fn test_state_transitions() {
        let mut job = JobSnapshot::new("batch_1_abc".into(), JobConfig::default(), 3, files());
        assert_eq!(job.status, JobStatus::Starting);
        assert!(job.end_time.is_none());

        job.mark_running();
        assert_eq!(job.status, JobStatus::Running);
        assert!(!job.status.is_terminal());

        assert!(job.finish(JobStatus::Stopped));
        assert_eq!(job.status, JobStatus::Stopped);
        assert!(job.duration_ms().is_some());

        // Exit arriving after a stop does not overwrite it.
        assert!(!job.finish(JobStatus::Completed));
        assert!(!job.mark_failed("late".into()));
        assert_eq!(job.status, JobStatus::Stopped);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_status_display_matches_serde() {
        for status in [
            JobStatus::Starting,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Stopped,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
    }
}
