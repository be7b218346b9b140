use std::fmt;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_stream::wrappers::SplitStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::Owner;
use crate::config::JobConfig;
use crate::error::{Result, WorkerError};
use crate::job::loghub::{LogHub, Subscription};

pub type JobId = Uuid;

/// Line published when a user stops a running job.
pub const STOPPED_BY_USER_LINE: &str = "Job has been stopped by user";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Stopped,
    Exited(i32),
    Failed(String),
}

impl JobStatus {
    /// Stopped, Exited and Failed are final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Stopped | JobStatus::Exited(_) | JobStatus::Failed(_)
        )
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            JobStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Exited(code) => write!(f, "exited({})", code),
            JobStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    finished_at: Option<DateTime<Utc>>,
}

/// One tracked execution of a user-submitted command.
///
/// The job owns its child process through a capture task spawned by
/// [`Job::start`]. That task and [`Job::stop`] are the only writers of the
/// status; whichever reaches a terminal status first wins and the other
/// becomes a no-op. The status lock is always taken before the hub's lock.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    owner: Owner,
    command: Vec<String>,
    created_at: DateTime<Utc>,
    kill_grace_period: Duration,
    state: Mutex<JobState>,
    cancel: CancellationToken,
    hub: LogHub,
}

type OutputLines = Pin<Box<dyn Stream<Item = std::io::Result<String>> + Send>>;

enum CaptureEnd {
    Eof,
    Cancelled,
    ReadError(std::io::Error),
}

impl Job {
    /// Create a pending job. Fails with `InvalidCommand` if `command` is
    /// empty or names a blank program.
    pub fn new(owner: Owner, command: Vec<String>, config: &JobConfig) -> Result<Arc<Self>> {
        match command.first() {
            Some(program) if !program.trim().is_empty() => {}
            _ => return Err(WorkerError::InvalidCommand),
        }

        Ok(Arc::new(Self {
            id: Uuid::new_v4(),
            owner,
            command,
            created_at: Utc::now(),
            kill_grace_period: config.kill_grace_period(),
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                finished_at: None,
            }),
            cancel: CancellationToken::new(),
            hub: LogHub::new(),
        }))
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state().finished_at
    }

    pub fn status(&self) -> JobStatus {
        self.state().status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state().status == JobStatus::Running
    }

    /// Open a reader over this job's output: full replay, then live lines.
    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// Output recorded so far.
    pub fn history(&self) -> Vec<String> {
        self.hub.history()
    }

    pub fn log_hub(&self) -> &LogHub {
        &self.hub
    }

    /// Launch the process and return without waiting for it.
    ///
    /// A process that cannot be launched leaves the job `Failed`; that is
    /// not an error for the caller. Only a second call fails.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state();
        if state.status != JobStatus::Pending {
            return Err(WorkerError::AlreadyStarted(self.id));
        }

        let child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = WorkerError::ProcessSpawnFailed(e.to_string());
                tracing::warn!(job_id = %self.id, owner = %self.owner, error = %err, "Job failed to start");
                state.status = JobStatus::Failed(err.to_string());
                state.finished_at = Some(Utc::now());
                self.hub.close();
                return Ok(());
            }
        };

        state.status = JobStatus::Running;
        drop(state);

        tracing::info!(
            job_id = %self.id,
            owner = %self.owner,
            command = ?self.command,
            pid = ?child.id(),
            "Job started"
        );

        let job = Arc::clone(self);
        tokio::spawn(async move {
            job.capture(child).await;
        });
        Ok(())
    }

    /// Stop a running job: terminate its process group, mark it `Stopped`
    /// and publish [`STOPPED_BY_USER_LINE`] as the final output line.
    ///
    /// Returns `false` without touching anything if the job is not running.
    pub fn stop(&self) -> bool {
        let mut state = self.state();
        if state.status != JobStatus::Running {
            return false;
        }
        state.status = JobStatus::Stopped;
        state.finished_at = Some(Utc::now());
        self.cancel.cancel();
        self.hub.close_with(STOPPED_BY_USER_LINE);
        drop(state);

        tracing::info!(job_id = %self.id, owner = %self.owner, "Job stopped by user");
        true
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so a stop reaches everything the job forked.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn()
    }

    /// Record the final status unless `stop` got there first.
    fn finish(&self, status: JobStatus) -> bool {
        let mut state = self.state();
        if state.status.is_terminal() {
            return false;
        }
        tracing::info!(job_id = %self.id, owner = %self.owner, status = %status, "Job finished");
        state.status = status;
        state.finished_at = Some(Utc::now());
        self.hub.close();
        true
    }

    async fn capture(self: Arc<Self>, mut child: Child) {
        let mut output = output_lines(&mut child);

        let end = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break CaptureEnd::Cancelled,
                next = output.next() => match next {
                    Some(Ok(line)) => {
                        if !self.hub.publish(line) {
                            break CaptureEnd::Cancelled;
                        }
                    }
                    Some(Err(e)) => break CaptureEnd::ReadError(e),
                    None => break CaptureEnd::Eof,
                },
            }
        };
        drop(output);

        let status = match end {
            CaptureEnd::Eof => {
                // Output closed; the process may still be running.
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        self.terminate(&mut child).await;
                        return;
                    }
                    result = child.wait() => exit_status_to_job_status(result),
                }
            }
            CaptureEnd::Cancelled => {
                self.terminate(&mut child).await;
                return;
            }
            CaptureEnd::ReadError(e) => {
                tracing::warn!(job_id = %self.id, error = %e, "Output capture failed");
                self.terminate(&mut child).await;
                JobStatus::Failed(format!("output capture failed: {}", e))
            }
        };

        self.finish(status);
    }

    async fn terminate(&self, child: &mut Child) {
        if let Err(e) = graceful_kill(child, self.kill_grace_period).await {
            tracing::debug!(job_id = %self.id, error = %e, "Failed to kill job process");
        }
    }
}

/// SIGTERM the child's process group, give the leader up to `grace` to exit,
/// then SIGKILL whatever is left of the group.
#[cfg(unix)]
async fn graceful_kill(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let pgid = Pid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGTERM);

        let exited = tokio::time::timeout(grace, child.wait()).await;

        // The leader exiting says nothing about the rest of the group.
        let _ = killpg(pgid, Signal::SIGKILL);

        if let Ok(result) = exited {
            return result.map(|_| ());
        }
    }

    child.kill().await
}

#[cfg(not(unix))]
async fn graceful_kill(child: &mut Child, _grace: Duration) -> std::io::Result<()> {
    child.kill().await
}

fn exit_status_to_job_status(result: std::io::Result<ExitStatus>) -> JobStatus {
    match result {
        Ok(status) => match status.code() {
            Some(code) => JobStatus::Exited(code),
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(signal) = status.signal() {
                        return JobStatus::Failed(format!("terminated by signal {}", signal));
                    }
                }
                JobStatus::Failed("terminated without exit code".to_string())
            }
        },
        Err(e) => JobStatus::Failed(format!("failed to wait for process: {}", e)),
    }
}

/// Merge stdout and stderr into one stream of lines. Each pipe keeps its own
/// order; invalid UTF-8 is replaced rather than aborting capture.
fn output_lines(child: &mut Child) -> OutputLines {
    let stdout = child.stdout.take().map(pipe_lines);
    let stderr = child.stderr.take().map(pipe_lines);

    match (stdout, stderr) {
        (Some(out), Some(err)) => Box::pin(out.merge(err)),
        (Some(only), None) | (None, Some(only)) => only,
        (None, None) => Box::pin(tokio_stream::empty()),
    }
}

fn pipe_lines<R>(pipe: R) -> OutputLines
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let segments = SplitStream::new(BufReader::new(pipe).split(b'\n'));
    Box::pin(segments.map(|segment| {
        segment.map(|mut bytes| {
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
            String::from_utf8_lossy(&bytes).into_owned()
        })
    }))
}
