//! Runs the bundling worker in a child process under a hard deadline
//!
//! The worker gets `<args..> <project-dir> <entry-file>` and answers with one
//! [`WorkerReport`] on stdout. If it has not exited when the timeout elapses
//! it is asked to terminate (SIGTERM to its process group), and killed once
//! the grace period runs out as well. Worker output is drained against the
//! same deadline, so a timed-out run resolves within `timeout + grace_period`.

use std::{
    ffi::OsString,
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use anyhow::{Context, Result};
use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    runtime::Runtime,
    task::JoinHandle,
    time::Instant,
};

use crate::{bundle::BundleOutput, config::WorkerConfig, protocol::WorkerReport};

/// Upper bound on worker output echoed back in diagnostics
const DIAGNOSTIC_LIMIT: usize = 4096;

/// Time left to collect output that is already buffered once the deadline has passed
const MIN_DRAIN: Duration = Duration::from_millis(50);

/// Program and leading arguments of the worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Extra environment for the worker process
    pub envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// This executable's hidden `worker` subcommand
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate the moonpack executable")?;
        Ok(Self::new(exe).arg("worker"))
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        let command = match &config.program {
            Some(program) => Self::new(program),
            None => Self::current_exe()?,
        };
        Ok(command.args(&config.args))
    }
}

/// Outcome of one bundling run. Exactly one is produced per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleResult {
    Success { output: BundleOutput },
    /// The worker overran the deadline and was terminated
    TimedOut {
        timeout: Duration,
        /// Worker stderr collected before termination
        captured: String,
    },
    Failed { message: String },
}

#[derive(Debug)]
enum WorkerExit {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct BundleOrchestrator {
    worker: WorkerCommand,
    timeout: Duration,
    grace_period: Duration,
}

impl BundleOrchestrator {
    pub fn new(worker: WorkerCommand, timeout: Duration, grace_period: Duration) -> Self {
        Self {
            worker,
            timeout,
            grace_period,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Run the worker on a dedicated single-threaded runtime
    pub fn run_blocking(&self, project_dir: &Path, entry_file: &str) -> Result<BundleResult> {
        Ok(current_thread_runtime()?.block_on(self.run(project_dir, entry_file)))
    }

    pub async fn run(&self, project_dir: &Path, entry_file: &str) -> BundleResult {
        let started = Instant::now();
        let mut command = Command::new(&self.worker.program);
        command
            .args(&self.worker.args)
            .envs(self.worker.envs.iter().map(|(key, value)| (key, value)))
            .arg(project_dir)
            .arg(entry_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so termination reaches anything the worker spawned
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return BundleResult::Failed {
                    message: format!(
                        "failed to spawn bundle worker `{}`: {e}",
                        self.worker.program.to_string_lossy()
                    ),
                };
            }
        };
        debug!(
            "Spawned bundle worker (pid {:?}) for {} in {}",
            child.id(),
            entry_file,
            project_dir.display()
        );

        let stdout_task = child.stdout.take().map(spawn_reader);
        let stderr_task = child.stderr.take().map(spawn_reader);

        let exit = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => WorkerExit::Exited(status),
            Ok(Err(e)) => WorkerExit::WaitFailed(e),
            Err(_) => {
                warn!(
                    "Bundle worker exceeded {}ms, terminating",
                    self.timeout.as_millis()
                );
                self.terminate(&mut child).await;
                WorkerExit::TimedOut
            }
        };

        // One deadline for both pipes: a descendant that escaped termination can hold them open
        let drain_deadline = if matches!(exit, WorkerExit::TimedOut) {
            (started + self.timeout + self.grace_period).max(Instant::now() + MIN_DRAIN)
        } else {
            Instant::now() + self.grace_period
        };
        let (stdout, stderr) = tokio::join!(
            join_reader(stdout_task, drain_deadline),
            join_reader(stderr_task, drain_deadline)
        );
        debug!(
            "Bundle worker finished after {}ms: {:?}",
            started.elapsed().as_millis(),
            exit
        );

        self.interpret(exit, &stdout, &stderr)
    }

    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        let pid = child.id();
        #[cfg(unix)]
        if let Some(pid) = pid {
            signal_worker(pid, libc::SIGTERM);
        }

        if tokio::time::timeout(self.grace_period, child.wait())
            .await
            .is_ok()
        {
            return;
        }

        warn!(
            "Bundle worker ignored termination for {}ms, killing it",
            self.grace_period.as_millis()
        );
        #[cfg(unix)]
        if let Some(pid) = pid {
            signal_worker(pid, libc::SIGKILL);
        }
        if let Err(e) = child.kill().await {
            debug!("Kill after grace period: {e}");
        }
    }

    fn interpret(&self, exit: WorkerExit, stdout: &[u8], stderr: &[u8]) -> BundleResult {
        let stderr = String::from_utf8_lossy(stderr);
        let status = match exit {
            WorkerExit::TimedOut => {
                return BundleResult::TimedOut {
                    timeout: self.timeout,
                    captured: stderr.into_owned(),
                };
            }
            WorkerExit::WaitFailed(e) => {
                return BundleResult::Failed {
                    message: format!("failed to wait for bundle worker: {e}"),
                };
            }
            WorkerExit::Exited(status) => status,
        };

        let stdout = String::from_utf8_lossy(stdout);
        match WorkerReport::parse(&stdout) {
            Ok(WorkerReport::Success { bundle }) if status.success() => {
                BundleResult::Success { output: bundle }
            }
            Ok(WorkerReport::Success { .. }) => BundleResult::Failed {
                message: format!("bundle worker reported success but exited with {status}"),
            },
            Ok(WorkerReport::Failure { diagnostic }) => BundleResult::Failed {
                message: diagnostic,
            },
            Err(e) if status.success() => BundleResult::Failed {
                message: format!(
                    "{e:#}; worker wrote: {}",
                    truncate(stdout.trim(), DIAGNOSTIC_LIMIT)
                ),
            },
            Err(_) => {
                let detail = stderr.trim();
                BundleResult::Failed {
                    message: if detail.is_empty() {
                        format!("bundle worker exited with {status}")
                    } else {
                        format!(
                            "bundle worker exited with {status}: {}",
                            truncate(detail, DIAGNOSTIC_LIMIT)
                        )
                    },
                }
            }
        }
    }
}

fn spawn_reader<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buffer).await {
            debug!("Reading worker output: {e}");
        }
        buffer
    })
}

/// Single-threaded runtime for driving child processes from synchronous code
pub(crate) fn current_thread_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the process runtime")
}

/// Collect a reader's output, giving up at `deadline`
async fn join_reader(task: Option<JoinHandle<Vec<u8>>>, deadline: Instant) -> Vec<u8> {
    let Some(mut handle) = task else {
        return Vec::new();
    };
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(buffer)) => buffer,
        Ok(Err(e)) => {
            debug!("Worker output reader failed: {e}");
            Vec::new()
        }
        Err(_) => {
            handle.abort();
            Vec::new()
        }
    }
}

/// Signal the worker's process group, falling back to the worker alone
#[cfg(unix)]
#[allow(unsafe_code)]
fn signal_worker(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) only takes integers; a stale pid yields ESRCH
    unsafe {
        if libc::kill(-pid, signal) != 0 {
            let _ = libc::kill(pid, signal);
        }
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
