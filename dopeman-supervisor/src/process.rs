//! A single spawned child process.
//!
//! The child runs in its own process group so termination reaches anything it
//! forks. Both pipes are read line by line: every line is logged, and lines
//! are forwarded to the readiness channel until its receiver is dropped.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::readiness::{OutputLine, OutputStream, ReadinessDetector, ReadinessOutcome};
use crate::state::ServiceState;

/// Lines buffered for the readiness detector before further lines are dropped.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Time allowed for a force-killed child to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitState {
    /// Exited normally with this code.
    Exited(i32),
    /// Killed by this signal number.
    Signaled(i32),
}

impl ExitState {
    pub fn success(self) -> bool {
        self == ExitState::Exited(0)
    }

    pub fn code(self) -> Option<i32> {
        match self {
            ExitState::Exited(code) => Some(code),
            ExitState::Signaled(_) => None,
        }
    }
}

impl From<std::process::ExitStatus> for ExitState {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => ExitState::Exited(code),
            (None, Some(sig)) => ExitState::Signaled(sig),
            (None, None) => ExitState::Exited(-1),
        }
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitState::Exited(code) => write!(f, "exit code {}", code),
            ExitState::Signaled(sig) => match Signal::try_from(*sig) {
                Ok(signal) => write!(f, "killed by {}", signal),
                Err(_) => write!(f, "killed by signal {}", sig),
            },
        }
    }
}

/// Fully resolved launch parameters for one process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchCommand {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment; these keys win.
    pub env: HashMap<String, String>,
}

/// Handle to one live (or finished) child process.
pub struct ProcessHandle {
    name: String,
    pid: u32,
    state: ServiceState,
    exit_rx: watch::Receiver<Option<ExitState>>,
    output_rx: Option<mpsc::Receiver<OutputLine>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Spawn `command` with piped output.
    ///
    /// A spawn error (missing executable, permissions) is returned immediately;
    /// there is no handle to wait on in that case.
    pub fn spawn(command: &LaunchCommand) -> Result<Self> {
        debug!(
            service = %command.name,
            "Spawning {} {}",
            command.program,
            command.args.join(" ")
        );

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let spawn_failed = |source| Error::SpawnFailed {
            name: command.name.clone(),
            program: command.program.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_failed)?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_failed(std::io::Error::other("process exited during spawn")))?;

        let (line_tx, line_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);

        let mut tasks = Vec::with_capacity(3);
        if let Some(stdout) = child.stdout.take() {
            tasks.push(spawn_line_reader(
                command.name.clone(),
                OutputStream::Stdout,
                stdout,
                line_tx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tasks.push(spawn_line_reader(
                command.name.clone(),
                OutputStream::Stderr,
                stderr,
                line_tx,
            ));
        }

        let name = command.name.clone();
        tasks.push(tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    let exit = ExitState::from(status);
                    if exit.success() {
                        info!(service = %name, pid, "Process exited ({})", exit);
                    } else {
                        warn!(service = %name, pid, "Process exited ({})", exit);
                    }
                    let _ = exit_tx.send(Some(exit));
                }
                Err(e) => warn!(service = %name, pid, "Failed to wait for process: {}", e),
            }
        }));

        info!(service = %command.name, pid, "Process started");

        Ok(Self {
            name: command.name.clone(),
            pid,
            state: ServiceState::Starting,
            exit_rx,
            output_rx: Some(line_rx),
            tasks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Move to `next` if the transition is allowed. Returns whether it applied.
    pub fn transition(&mut self, next: ServiceState) -> bool {
        if self.state.can_transition_to(next) {
            debug!(service = %self.name, "{} -> {}", self.state, next);
            self.state = next;
            true
        } else {
            debug!(service = %self.name, "Ignoring transition {} -> {}", self.state, next);
            false
        }
    }

    /// Take the output line channel. Only the first caller gets it.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<OutputLine>> {
        self.output_rx.take()
    }

    /// Run `detector` against this process's output and exit notification.
    pub async fn await_ready(&mut self, detector: &ReadinessDetector) -> ReadinessOutcome {
        let lines = match self.output_rx.take() {
            Some(lines) => lines,
            // Output already consumed: only exit or the timeout can resolve.
            None => mpsc::channel(1).1,
        };
        detector.wait(lines, self.subscribe_exit()).await
    }

    /// Exit notification: `None` while running, then the final state.
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<ExitState>> {
        self.exit_rx.clone()
    }

    pub fn exit_state(&self) -> Option<ExitState> {
        *self.exit_rx.borrow()
    }

    /// Wait for the process to exit.
    ///
    /// Returns `None` if the exit status could not be observed.
    pub async fn wait(&self) -> Option<ExitState> {
        let mut rx = self.exit_rx.clone();
        rx.wait_for(Option::is_some).await.ok().and_then(|s| *s)
    }

    /// Ask the process to terminate (SIGTERM to its process group).
    ///
    /// The group is signalled even when the leader has already exited, so
    /// anything it left behind is reached. Idempotent: a stopped process is
    /// left alone.
    pub fn terminate(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.transition(ServiceState::Stopped);
        self.signal(Signal::SIGTERM)
    }

    /// Terminate, wait up to `grace` for the whole group to exit, then force-kill.
    pub async fn stop(&mut self, grace: Duration) -> Result<Option<ExitState>> {
        self.terminate()?;
        let deadline = tokio::time::Instant::now() + grace;

        if let Ok(exit) = tokio::time::timeout_at(deadline, self.wait()).await {
            if tokio::time::timeout_at(deadline, self.group_exited())
                .await
                .is_err()
            {
                warn!(
                    service = %self.name,
                    pid = self.pid,
                    "Process group still running {}ms after its leader was stopped, sending SIGKILL",
                    grace.as_millis()
                );
                self.signal(Signal::SIGKILL)?;
            }
            return Ok(exit);
        }

        warn!(
            service = %self.name,
            pid = self.pid,
            "Process did not exit within {}ms, sending SIGKILL",
            grace.as_millis()
        );
        self.signal(Signal::SIGKILL)?;
        Ok(tokio::time::timeout(KILL_REAP_TIMEOUT, self.wait())
            .await
            .ok()
            .flatten())
    }

    /// Resolves once no process is left in the group.
    async fn group_exited(&self) {
        while self.group_alive() {
            tokio::time::sleep(GROUP_POLL_INTERVAL).await;
        }
    }

    fn group_alive(&self) -> bool {
        signal::killpg(self.pgid(), None).is_ok()
    }

    fn pgid(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        match signal::killpg(self.pgid(), signal) {
            Ok(()) => {
                debug!(service = %self.name, pid = self.pid, "Sent {}", signal);
                Ok(())
            }
            // Already gone.
            Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(Error::TerminateFailed {
                name: self.name.clone(),
                pid: self.pid,
                source,
            }),
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("exit", &self.exit_state())
            .finish()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // Aborting the waiter drops the child, which kills it (kill_on_drop).
        for task in &self.tasks {
            task.abort();
        }
        // kill_on_drop only reaches the leader.
        if self.group_alive() {
            let _ = signal::killpg(self.pgid(), Signal::SIGKILL);
        }
    }
}

/// Read `reader` line by line, log each line, and forward it to `tx` until the
/// receiver goes away.
fn spawn_line_reader<R>(
    name: String,
    stream: OutputStream,
    reader: R,
    tx: mpsc::Sender<OutputLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut tx = Some(tx);

        loop {
            match lines.next_line().await {
                Ok(Some(text)) => {
                    info!(
                        target: "dopeman_supervisor::output",
                        service = %name,
                        %stream,
                        "{}",
                        text
                    );
                    if let Some(sender) = &tx {
                        match sender.try_send(OutputLine { stream, text }) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                debug!(service = %name, "Readiness channel full, dropping line");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => tx = None,
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(service = %name, %stream, "Error reading output: {}", e);
                    break;
                }
            }
        }
    })
}
