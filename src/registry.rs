//! In-memory registry of jobs known to this process.
//!
//! The registry is an ordinary value owned by the supervisor, so tests can
//! build as many isolated registries as they like. Records here are
//! authoritative while present; once evicted (restart or cleanup) the
//! on-disk snapshot takes over.

use crate::job::{generate_job_id, JobConfig, JobFiles, JobSnapshot, JobStatus, WorkerProgress};
use crate::launcher::{WorkerExit, WorkerHandle};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

/// A tracked job: its data plus the handle of the process running it.
#[derive(Debug)]
struct TrackedJob {
    snapshot: JobSnapshot,
    process: Option<WorkerHandle>,
}

/// Outcome of a terminal transition, decided under the registry lock.
#[derive(Debug)]
pub enum Transition {
    /// This call moved the job into the terminal state. `process` is the
    /// worker still attached to it, if any.
    Applied {
        snapshot: JobSnapshot,
        process: Option<WorkerHandle>,
    },
    /// The job had already reached this terminal state.
    AlreadyFinished(JobStatus),
    NotTracked,
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, TrackedJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TrackedJob>> {
        match self.jobs.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Job registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TrackedJob>> {
        match self.jobs.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Job registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Allocates a job id and records the job as `starting`.
    ///
    /// `files` maps the new id to its on-disk file locations.
    pub fn create<F>(&self, config: JobConfig, total_urls: usize, files: F) -> JobSnapshot
    where
        F: FnOnce(&str) -> JobFiles,
    {
        let job_id = generate_job_id();
        let snapshot = JobSnapshot::new(job_id.clone(), config, total_urls, files(&job_id));
        self.write().insert(
            job_id,
            TrackedJob {
                snapshot: snapshot.clone(),
                process: None,
            },
        );
        snapshot
    }

    pub fn get(&self, job_id: &str) -> Option<JobSnapshot> {
        self.read().get(job_id).map(|job| job.snapshot.clone())
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.read().contains_key(job_id)
    }

    pub fn list(&self) -> Vec<JobSnapshot> {
        self.read().values().map(|job| job.snapshot.clone()).collect()
    }

    /// Number of jobs whose status is not terminal.
    pub fn active_count(&self) -> usize {
        self.read()
            .values()
            .filter(|job| !job.snapshot.status.is_terminal())
            .count()
    }

    /// `starting -> running`, remembering the process handle.
    ///
    /// Returns `false` if the job is unknown or already past `starting`.
    pub fn attach_process(&self, job_id: &str, handle: WorkerHandle) -> bool {
        let mut jobs = self.write();
        match jobs.get_mut(job_id) {
            Some(job) if job.snapshot.status == JobStatus::Starting => {
                job.snapshot.mark_running();
                job.process = Some(handle);
                true
            }
            _ => false,
        }
    }

    /// Moves a job into a terminal state unless it is already in one.
    ///
    /// A stop is `mark_terminal(id, Stopped, None)`: the returned process, if
    /// any, is the worker to signal.
    pub fn mark_terminal(
        &self,
        job_id: &str,
        status: JobStatus,
        exit_code: Option<i32>,
    ) -> Transition {
        match self.write().get_mut(job_id) {
            Some(job) => apply_terminal(job, status, exit_code),
            None => Transition::NotTracked,
        }
    }

    /// Marks a job `failed` with a reason, e.g. when its worker never started.
    pub fn mark_failed(&self, job_id: &str, error: String) -> Option<JobSnapshot> {
        let mut jobs = self.write();
        let job = jobs.get_mut(job_id)?;
        job.process = None;
        if job.snapshot.mark_failed(error) {
            Some(job.snapshot.clone())
        } else {
            None
        }
    }

    /// Records a process exit: drops the handle, keeps the exit code and the
    /// last progress the worker reported, and applies `completed`/`failed`
    /// unless the job was already stopped.
    ///
    /// Always returns the resulting snapshot (if the job is tracked) together
    /// with whether this exit decided the terminal state.
    pub fn release_process(
        &self,
        job_id: &str,
        exit: &WorkerExit,
        progress: Option<WorkerProgress>,
    ) -> Option<(JobSnapshot, bool)> {
        let mut jobs = self.write();
        let job = jobs.get_mut(job_id)?;
        job.process = None;
        job.snapshot.exit_code = exit.code;
        if progress.is_some() {
            job.snapshot.progress = progress;
        }

        let status = if exit.success() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        let decided = matches!(
            apply_terminal(job, status, exit.code),
            Transition::Applied { .. }
        );
        if decided && !exit.success() {
            job.snapshot.error = Some(exit.describe());
        }
        Some((job.snapshot.clone(), decided))
    }

    pub fn remove(&self, job_id: &str) -> Option<JobSnapshot> {
        self.write().remove(job_id).map(|job| job.snapshot)
    }
}

fn apply_terminal(
    job: &mut TrackedJob,
    status: JobStatus,
    exit_code: Option<i32>,
) -> Transition {
    if !job.snapshot.finish(status) {
        return Transition::AlreadyFinished(job.snapshot.status);
    }
    if exit_code.is_some() {
        job.snapshot.exit_code = exit_code;
    }
    Transition::Applied {
        snapshot: job.snapshot.clone(),
        process: job.process.clone(),
    }
}
