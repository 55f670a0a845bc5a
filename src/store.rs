//! Filesystem persistence for batch jobs.
//!
//! Every job owns a directory under the jobs root named by its id:
//!
//! - `urls.csv`: the qualifying lines of the upload, one per line
//! - `config.json`: the latest [`JobSnapshot`]
//! - `progress.json`: written by the worker, read here opportunistically
//! - `batch.log`: append-only, timestamped output of the worker

use crate::error::StoreError;
use crate::job::{JobFiles, JobSnapshot, WorkerProgress};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const URLS_FILE: &str = "urls.csv";
const CONFIG_FILE: &str = "config.json";
const PROGRESS_FILE: &str = "progress.json";
const LOG_FILE: &str = "batch.log";

/// The tail end of a job log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogTail {
    pub lines: Vec<String>,
    /// Number of lines in the whole log, not just the tail.
    pub total_lines: usize,
}

/// `progress.json` comes in two shapes: the flat counters, or the
/// `{ "stats": {...}, "last_update": ... }` document the Python worker writes.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProgressFile {
    Nested {
        stats: WorkerProgress,
        #[serde(default)]
        last_update: Option<String>,
    },
    Flat(WorkerProgress),
}

impl From<ProgressFile> for WorkerProgress {
    fn from(file: ProgressFile) -> Self {
        match file {
            ProgressFile::Nested { mut stats, last_update } => {
                if stats.last_update.is_none() {
                    stats.last_update = last_update;
                }
                stats
            }
            ProgressFile::Flat(progress) => progress,
        }
    }
}

/// Directory-per-job store rooted at a single jobs directory.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    pub fn files_for(&self, job_id: &str) -> JobFiles {
        let dir = self.job_dir(job_id);
        JobFiles {
            csv_path: dir.join(URLS_FILE),
            log_path: dir.join(LOG_FILE),
            progress_path: dir.join(PROGRESS_FILE),
            config_path: dir.join(CONFIG_FILE),
        }
    }

    pub fn job_dir_exists(&self, job_id: &str) -> bool {
        self.job_dir(job_id).is_dir()
    }

    /// Creates the job directory and writes the worker's input file.
    pub fn prepare_job(&self, job_id: &str, urls: &[&str]) -> Result<PathBuf, StoreError> {
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDirectory {
            path: dir.clone(),
            source,
        })?;

        let csv_path = dir.join(URLS_FILE);
        let mut content = urls.join("\n");
        content.push('\n');
        fs::write(&csv_path, content).map_err(|source| StoreError::WriteFile {
            path: csv_path.clone(),
            source,
        })?;

        debug!(job_id = %job_id, urls = urls.len(), "Prepared job directory");
        Ok(csv_path)
    }

    /// Replaces `config.json` with the given snapshot.
    ///
    /// The snapshot is written to a temporary file in the job directory and
    /// renamed into place, so readers never observe a half-written file.
    pub fn write_config(&self, snapshot: &JobSnapshot) -> Result<(), StoreError> {
        let dir = self.job_dir(&snapshot.job_id);
        let path = dir.join(CONFIG_FILE);
        let write_err = |source| StoreError::WriteFile {
            path: path.clone(),
            source,
        };

        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| write_err(std::io::Error::new(ErrorKind::InvalidData, e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(&json).map_err(write_err)?;
        tmp.persist(&path).map_err(|e| write_err(e.error))?;

        debug!(job_id = %snapshot.job_id, status = %snapshot.status, "Wrote config snapshot");
        Ok(())
    }

    /// Reads `config.json` back. A missing or malformed file is reported as
    /// [`StoreError::CorruptConfig`].
    pub fn read_config(&self, job_id: &str) -> Result<JobSnapshot, StoreError> {
        let path = self.job_dir(job_id).join(CONFIG_FILE);
        let bytes = fs::read(&path).map_err(|e| StoreError::CorruptConfig {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::CorruptConfig {
            path,
            reason: e.to_string(),
        })
    }

    /// Appends one timestamped line to `batch.log`, creating it if needed.
    pub fn append_log(&self, job_id: &str, line: &str) -> Result<(), StoreError> {
        let path = self.job_dir(job_id).join(LOG_FILE);
        let entry = format!(
            "[{}] {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            line.trim_end()
        );

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(entry.as_bytes()))
            .map_err(|source| StoreError::WriteFile { path, source })
    }

    /// Returns at most the last `max_lines` non-empty log lines.
    pub fn read_log(&self, job_id: &str, max_lines: usize) -> Result<LogTail, StoreError> {
        let path = self.job_dir(job_id).join(LOG_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LogTail::default()),
            Err(source) => return Err(StoreError::ReadFile { path, source }),
        };

        let all: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let skip = all.len().saturating_sub(max_lines);
        Ok(LogTail {
            lines: all[skip..].iter().map(|l| l.to_string()).collect(),
            total_lines: all.len(),
        })
    }

    /// Reads the worker's progress file. Absent or unreadable means unknown.
    pub fn read_progress(&self, job_id: &str) -> Option<WorkerProgress> {
        let path = self.job_dir(job_id).join(PROGRESS_FILE);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice::<ProgressFile>(&bytes) {
            Ok(file) => Some(file.into()),
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "Ignoring unparsable progress file");
                None
            }
        }
    }

    /// Names of all job directories under the root.
    pub fn list_job_dirs(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::ReadFile {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn delete_job_dir(&self, job_id: &str) -> Result<(), StoreError> {
        let path = self.job_dir(job_id);
        fs::remove_dir_all(&path).map_err(|source| StoreError::RemoveDirectory { path, source })
    }

    /// When the job was created: the snapshot's start time, or the
    /// directory's modification time if the snapshot is unusable.
    pub fn created_at(&self, job_id: &str) -> Option<DateTime<Utc>> {
        if let Ok(snapshot) = self.read_config(job_id) {
            return Some(snapshot.start_time);
        }
        fs::metadata(self.job_dir(job_id))
            .and_then(|meta| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from)
    }
}
