//! The batch job supervisor.
//!
//! Owns the registry, the store and the launcher and implements the six
//! operations the HTTP layer exposes. Persistence failures on the way are
//! logged and swallowed; only validation, unknown ids, spawn failures and a
//! job directory that cannot be created reach the caller.

use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::job::{is_valid_job_id, qualifying_lines, JobConfig, JobSnapshot, JobStatus};
use crate::launcher::{LaunchRequest, ProcessLauncher, WorkerExit};
use crate::registry::{JobRegistry, Transition};
use crate::store::{JobStore, LogTail};
use crate::telemetry;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Cleanup thresholds beyond this many days are treated as this many.
const MAX_CLEANUP_DAYS: u64 = 36_500;

/// An accepted upload plus the raw form fields that came with it.
#[derive(Debug, Clone, Default)]
pub struct CsvUpload {
    pub filename: Option<String>,
    pub content: Vec<u8>,
    pub batch_size: Option<String>,
    pub tab_delay: Option<String>,
    pub batch_delay: Option<String>,
    pub tags: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartedJob {
    pub job_id: String,
    pub config: JobConfig,
    pub total_urls: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// The job was live; it is now `stopped` and its worker has been signalled.
    Stopped(JobSnapshot),
    /// Nothing to stop. `status` is the last known status, which for a job
    /// only known from disk may be a stale `running`.
    NotRunning { status: JobStatus },
}

pub struct BatchSupervisor {
    registry: JobRegistry,
    store: Arc<JobStore>,
    launcher: ProcessLauncher,
    url_marker: String,
    stop_grace: Duration,
}

impl BatchSupervisor {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self::with_parts(
            JobRegistry::new(),
            JobStore::new(&config.jobs_dir),
            ProcessLauncher::new(config.worker_program.clone(), config.worker_script.clone()),
            config.url_marker.clone(),
            config.stop_grace,
        )
    }

    pub fn with_parts(
        registry: JobRegistry,
        store: JobStore,
        launcher: ProcessLauncher,
        url_marker: String,
        stop_grace: Duration,
    ) -> Self {
        Self {
            registry,
            store: Arc::new(store),
            launcher,
            url_marker,
            stop_grace,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Validates the upload, creates the job and spawns its worker.
    ///
    /// If anything after job creation fails, the job is marked `failed`
    /// before the error is returned; no job is left in `starting`.
    pub fn start(self: &Arc<Self>, upload: CsvUpload) -> Result<StartedJob> {
        if upload.content.is_empty() {
            return Err(SupervisorError::Validation(
                "No CSV file uploaded".to_string(),
            ));
        }

        let text = String::from_utf8_lossy(&upload.content);
        let urls = qualifying_lines(&text, &self.url_marker);
        if urls.is_empty() {
            return Err(SupervisorError::Validation(format!(
                "No valid URLs found in CSV (lines must contain '{}')",
                self.url_marker
            )));
        }

        let config = JobConfig::from_form(
            upload.batch_size.as_deref(),
            upload.tab_delay.as_deref(),
            upload.batch_delay.as_deref(),
            upload.tags.as_deref(),
        );
        let snapshot = self
            .registry
            .create(config, urls.len(), |id| self.store.files_for(id));
        let job_id = snapshot.job_id.clone();

        if let Err(e) = self.store.prepare_job(&job_id, &urls) {
            error!(job_id = %job_id, error = %e, "Failed to prepare job directory");
            self.fail_job(&job_id, e.to_string());
            return Err(e.into());
        }
        self.persist(&snapshot);
        self.log(
            &job_id,
            &format!(
                "Batch job created from {}: {} URLs, batch size {}, tab delay {}s, batch delay {}s, tags [{}]",
                upload.filename.as_deref().unwrap_or("upload"),
                snapshot.total_urls,
                snapshot.config.batch_size,
                snapshot.config.tab_delay,
                snapshot.config.batch_delay,
                snapshot.config.tags.join(", "),
            ),
        );

        let request = LaunchRequest {
            job_id: job_id.clone(),
            job_dir: self.store.job_dir(&job_id),
            csv_path: snapshot.files.csv_path.clone(),
            progress_path: snapshot.files.progress_path.clone(),
            config: snapshot.config.clone(),
        };

        let worker = match self.launcher.launch(&request, self.store.clone()) {
            Ok(worker) => worker,
            Err(source) => {
                error!(job_id = %job_id, error = %source, "Failed to spawn batch worker");
                self.fail_job(&job_id, format!("Failed to spawn worker: {}", source));
                return Err(SupervisorError::Spawn { job_id, source });
            }
        };

        if self.registry.attach_process(&job_id, worker.handle.clone()) {
            if let Some(running) = self.registry.get(&job_id) {
                self.persist(&running);
            }
            self.log(
                &job_id,
                &format!(
                    "Worker started (pid {})",
                    worker
                        .handle
                        .pid
                        .map_or_else(|| "unknown".to_string(), |p| p.to_string())
                ),
            );
        } else {
            // Stopped between creation and spawn.
            warn!(job_id = %job_id, "Job left starting before its worker attached");
            self.launcher.terminate(&worker.handle, self.stop_grace);
        }

        let this = Arc::clone(self);
        let watched_id = job_id.clone();
        tokio::spawn(async move {
            let exit = worker.exited.await.unwrap_or_else(|_| WorkerExit {
                code: None,
                signal: None,
                error: Some("exit watcher ended without reporting".to_string()),
            });
            this.on_worker_exit(&watched_id, &exit);

            // Output can trail the exit; the exit line goes after it.
            if let Err(e) = worker.drained.await {
                warn!(job_id = %watched_id, error = %e, "Worker output task failed");
            }
            this.log(&watched_id, &exit.describe());
        });

        info!(
            job_id = %job_id,
            total_urls = snapshot.total_urls,
            batch_size = snapshot.config.batch_size,
            "Batch job started"
        );

        Ok(StartedJob {
            job_id,
            config: snapshot.config,
            total_urls: snapshot.total_urls,
        })
    }

    /// Current state of a job: the registry if it is tracked, otherwise its
    /// `config.json`. Progress is re-read from the worker's file.
    pub fn status(&self, job_id: &str) -> Result<JobSnapshot> {
        let mut snapshot = self.lookup(job_id)?;
        if let Some(progress) = self.store.read_progress(job_id) {
            snapshot.progress = Some(progress);
        }
        Ok(snapshot)
    }

    /// All jobs, in memory and on disk, newest first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let mut seen = HashSet::new();
        let mut jobs: Vec<JobSnapshot> = self
            .registry
            .list()
            .into_iter()
            .filter(|job| seen.insert(job.job_id.clone()))
            .collect();

        match self.store.list_job_dirs() {
            Ok(dirs) => {
                for dir in &dirs {
                    if seen.contains(dir) {
                        continue;
                    }
                    match self.store.read_config(dir) {
                        Ok(snapshot) if seen.insert(snapshot.job_id.clone()) => {
                            jobs.push(snapshot)
                        }
                        Ok(_) => {}
                        Err(e) => debug!(dir = %dir, error = %e, "Skipping job directory"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to enumerate job directories"),
        }

        for job in jobs.iter_mut().filter(|job| !job.status.is_terminal()) {
            if let Some(progress) = self.store.read_progress(&job.job_id) {
                job.progress = Some(progress);
            }
        }

        jobs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        jobs
    }

    /// Stops a live job: marks it `stopped`, then signals its worker without
    /// waiting. Safe to call repeatedly.
    pub fn stop(&self, job_id: &str) -> Result<StopOutcome> {
        if !is_valid_job_id(job_id) {
            return Err(SupervisorError::NotFound(job_id.to_string()));
        }

        match self.registry.mark_terminal(job_id, JobStatus::Stopped, None) {
            Transition::Applied { snapshot, process } => {
                self.log(job_id, "Stop requested, sending termination signal");
                self.persist(&snapshot);
                if let Some(handle) = process {
                    self.launcher.terminate(&handle, self.stop_grace);
                }
                info!(job_id = %job_id, "Batch job stopped");
                telemetry::record_job_telemetry(&snapshot);
                Ok(StopOutcome::Stopped(snapshot))
            }
            Transition::AlreadyFinished(status) => Ok(StopOutcome::NotRunning { status }),
            Transition::NotTracked => match self.store.read_config(job_id) {
                Ok(snapshot) => Ok(StopOutcome::NotRunning {
                    status: snapshot.status,
                }),
                Err(_) => Err(SupervisorError::NotFound(job_id.to_string())),
            },
        }
    }

    /// The last `lines` lines of a job's log.
    pub fn logs(&self, job_id: &str, lines: usize) -> Result<LogTail> {
        if !is_valid_job_id(job_id)
            || !(self.registry.contains(job_id) || self.store.job_dir_exists(job_id))
        {
            return Err(SupervisorError::NotFound(job_id.to_string()));
        }
        Ok(self.store.read_log(job_id, lines)?)
    }

    /// Deletes job directories whose start time is strictly older than
    /// `older_than_days` days ago. Jobs in the registry are never deleted.
    ///
    /// Terminal registry entries past the threshold whose directory has
    /// already disappeared are evicted. Returns the number of directories
    /// removed.
    pub fn cleanup(&self, older_than_days: u64) -> Result<usize> {
        let days = older_than_days.min(MAX_CLEANUP_DAYS) as i64;
        let cutoff = Utc::now() - chrono::Duration::days(days);

        let mut deleted = 0;
        for job_id in self.store.list_job_dirs()? {
            if self.registry.contains(&job_id) {
                debug!(job_id = %job_id, "Cleanup skipping tracked job");
                continue;
            }
            match self.store.created_at(&job_id) {
                Some(created) if created < cutoff => match self.store.delete_job_dir(&job_id) {
                    Ok(()) => {
                        debug!(job_id = %job_id, "Deleted job directory");
                        deleted += 1;
                    }
                    Err(e) => warn!(job_id = %job_id, error = %e, "Failed to delete job directory"),
                },
                _ => {}
            }
        }

        for job in self.registry.list() {
            if job.status.is_terminal()
                && job.start_time < cutoff
                && !self.store.job_dir_exists(&job.job_id)
            {
                self.registry.remove(&job.job_id);
                debug!(job_id = %job.job_id, "Evicted orphaned registry entry");
            }
        }

        info!(deleted = deleted, older_than_days = days, "Cleanup finished");
        Ok(deleted)
    }

    fn lookup(&self, job_id: &str) -> Result<JobSnapshot> {
        if !is_valid_job_id(job_id) {
            return Err(SupervisorError::NotFound(job_id.to_string()));
        }
        if let Some(snapshot) = self.registry.get(job_id) {
            return Ok(snapshot);
        }
        self.store.read_config(job_id).map_err(|e| {
            debug!(job_id = %job_id, error = %e, "No usable snapshot on disk");
            SupervisorError::NotFound(job_id.to_string())
        })
    }

    /// Records a reaped worker: releases its handle and settles the job.
    fn on_worker_exit(&self, job_id: &str, exit: &WorkerExit) {
        let progress = self.store.read_progress(job_id);
        match self.registry.release_process(job_id, exit, progress) {
            Some((snapshot, decided)) => {
                self.persist(&snapshot);
                if decided {
                    telemetry::record_job_telemetry(&snapshot);
                } else {
                    debug!(job_id = %job_id, status = %snapshot.status, "Worker exited after terminal state");
                }
            }
            None => debug!(job_id = %job_id, "Worker exited for an evicted job"),
        }
    }

    fn fail_job(&self, job_id: &str, reason: String) {
        if let Some(snapshot) = self.registry.mark_failed(job_id, reason.clone()) {
            self.log(job_id, &format!("Job failed: {}", reason));
            self.persist(&snapshot);
            telemetry::record_job_telemetry(&snapshot);
        }
    }

    fn persist(&self, snapshot: &JobSnapshot) {
        if let Err(e) = self.store.write_config(snapshot) {
            warn!(job_id = %snapshot.job_id, error = %e, "Failed to write job snapshot");
        }
    }

    fn log(&self, job_id: &str, line: &str) {
        if let Err(e) = self.store.append_log(job_id, line) {
            warn!(job_id = %job_id, error = %e, "Failed to append to job log");
        }
    }
}
