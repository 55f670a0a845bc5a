//! Spawns the external batch worker and wires its output into the job log.

use crate::job::JobConfig;
use crate::store::JobStore;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long the exit watcher waits for the output readers to drain after the
/// child has exited. Grandchildren can keep the pipes open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything the worker needs to run one job.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub job_id: String,
    pub job_dir: PathBuf,
    pub csv_path: PathBuf,
    pub progress_path: PathBuf,
    pub config: JobConfig,
}

/// Requests the exit watcher delivers to its child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerSignal {
    Terminate,
    Kill,
}

/// Handle to a live worker, kept in the registry while the process runs.
///
/// Signals go through the task that owns the child, which only delivers them
/// while the child has not been reaped. Requests made after exit are dropped.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub pid: Option<u32>,
    signals: mpsc::UnboundedSender<WorkerSignal>,
}

impl WorkerHandle {
    /// Asks the worker to shut down gracefully.
    pub fn request_terminate(&self) {
        let _ = self.signals.send(WorkerSignal::Terminate);
    }

    /// Asks the exit watcher to force-kill the child.
    pub fn force_kill(&self) {
        let _ = self.signals.send(WorkerSignal::Kill);
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Set when waiting on the child itself failed.
    pub error: Option<String>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            error: None,
        }
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal, &self.error) {
            (_, _, Some(error)) => format!("Process wait failed: {}", error),
            (Some(code), _, _) => format!("Process exited with code {}", code),
            (None, Some(signal), _) => format!("Process terminated by signal {}", signal),
            (None, None, None) => "Process exited".to_string(),
        }
    }
}

/// A freshly spawned worker.
pub struct RunningWorker {
    pub handle: WorkerHandle,
    /// Resolves as soon as the child has been reaped.
    pub exited: oneshot::Receiver<WorkerExit>,
    /// Finishes once the output readers have drained after exit.
    pub drained: JoinHandle<()>,
}

/// Launches the worker script, one child process per job.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: Option<PathBuf>,
    script: PathBuf,
}

impl ProcessLauncher {
    /// `program` is the interpreter (e.g. `python3`); when `None` the script
    /// is executed directly.
    pub fn new(program: Option<PathBuf>, script: PathBuf) -> Self {
        Self { program, script }
    }

    /// The directory the worker runs in: the script's own directory, so its
    /// relative resource paths resolve regardless of where we were started.
    pub fn working_dir(&self) -> PathBuf {
        match self.script.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = match &self.program {
            Some(program) => {
                let mut cmd = Command::new(program);
                cmd.arg(absolute(&self.script));
                cmd
            }
            None => Command::new(absolute(&self.script)),
        };

        cmd.arg("--batch-size")
            .arg(request.config.batch_size.to_string())
            .arg("--tab-delay")
            .arg(request.config.tab_delay.to_string())
            .arg("--batch-delay")
            .arg(request.config.batch_delay.to_string())
            .arg(absolute(&request.csv_path))
            .current_dir(self.working_dir())
            .env("BATCH_JOB_ID", &request.job_id)
            .env("BATCH_TAGS", request.config.tags.join(","))
            .env("BATCH_JOB_DIR", absolute(&request.job_dir))
            .env("BATCH_PROGRESS_FILE", absolute(&request.progress_path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Spawns the worker. Returns as soon as the process exists; output
    /// streaming and exit tracking continue on background tasks.
    pub fn launch(
        &self,
        request: &LaunchRequest,
        store: Arc<JobStore>,
    ) -> std::io::Result<RunningWorker> {
        let mut child = self.command(request).spawn()?;
        let pid = child.id();

        info!(job_id = %request.job_id, pid = ?pid, "Spawned batch worker");

        let stdout = child
            .stdout
            .take()
            .map(|out| spawn_reader(out, request.job_id.clone(), store.clone(), ""));
        let stderr = child
            .stderr
            .take()
            .map(|err| spawn_reader(err, request.job_id.clone(), store, "ERROR: "));

        let (signal_tx, mut signals) = mpsc::unbounded_channel();
        let handle = WorkerHandle {
            pid,
            signals: signal_tx,
        };
        let (exit_tx, exited) = oneshot::channel();

        let job_id = request.job_id.clone();
        let drained = tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(signal) = signals.recv() => deliver(&mut child, signal, &job_id),
                }
            };
            drop(signals);

            let exit = match status {
                Ok(status) => WorkerExit::from_status(status),
                Err(e) => WorkerExit {
                    code: None,
                    signal: None,
                    error: Some(e.to_string()),
                },
            };
            if exit_tx.send(exit).is_err() {
                debug!(job_id = %job_id, "Nobody waiting on worker exit");
            }

            for reader in [stdout, stderr].into_iter().flatten() {
                if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                    debug!(job_id = %job_id, "Output reader still open after exit");
                }
            }
        });

        Ok(RunningWorker {
            handle,
            exited,
            drained,
        })
    }

    /// Requests a graceful shutdown and schedules one forced kill after
    /// `grace`. Does not wait for the process to exit.
    pub fn terminate(&self, handle: &WorkerHandle, grace: Duration) {
        handle.request_terminate();
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            handle.force_kill();
        });
    }
}

/// Delivers `signal` to a child that is still running. A child that has
/// already exited is left alone: once reaped its pid may belong to anyone.
fn deliver(child: &mut Child, signal: WorkerSignal, job_id: &str) {
    match child.try_wait() {
        Ok(None) => {}
        Ok(Some(_)) => {
            debug!(job_id = %job_id, ?signal, "Worker already exited, not signalling");
            return;
        }
        Err(e) => {
            debug!(job_id = %job_id, error = %e, "Could not poll worker before signalling");
            return;
        }
    }

    match signal {
        WorkerSignal::Terminate => send_terminate(child, job_id),
        WorkerSignal::Kill => {
            warn!(job_id = %job_id, "Force-killing batch worker");
            if let Err(e) = child.start_kill() {
                debug!(job_id = %job_id, error = %e, "Kill failed, process likely gone");
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child, job_id: &str) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions. The child has not
    // been reaped, so `pid` still names it.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(job_id = %job_id, pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, job_id: &str) {
    if let Err(e) = child.start_kill() {
        debug!(job_id = %job_id, error = %e, "Kill failed, process likely gone");
    }
}

fn spawn_reader<R>(
    stream: R,
    job_id: String,
    store: Arc<JobStore>,
    prefix: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Err(e) = store.append_log(&job_id, &format!("{}{}", prefix, line)) {
                        warn!(job_id = %job_id, error = %e, "Failed to append worker output");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(job_id = %job_id, error = %e, "Worker output stream closed");
                    break;
                }
            }
        }
    })
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
