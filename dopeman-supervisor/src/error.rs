use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::process::ExitState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("invalid port range {start}-{end}")]
    #[diagnostic(
        code(dopeman::ports::invalid_range),
        help("ports must satisfy 1 <= start <= end <= 65535")
    )]
    InvalidPortRange { start: u32, end: u32 },

    #[error("no port available in range {start}-{end}")]
    #[diagnostic(
        code(dopeman::ports::exhausted),
        help("free a port in the range or configure a different `ports` range")
    )]
    NoPortAvailable { start: u16, end: u16 },

    #[error("failed to spawn {name} ({program})")]
    #[diagnostic(code(dopeman::process::spawn_failed))]
    SpawnFailed {
        name: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} exited before becoming ready ({exit})")]
    #[diagnostic(
        code(dopeman::process::exited_before_ready),
        help("check the service output above for the cause")
    )]
    ExitedBeforeReady { name: String, exit: ExitState },

    #[error("{name} did not signal readiness within {}ms", .timeout.as_millis())]
    #[diagnostic(code(dopeman::process::readiness_timeout))]
    ReadinessTimeout { name: String, timeout: Duration },

    #[error("failed to terminate {name} (PID {pid})")]
    #[diagnostic(code(dopeman::process::terminate_failed))]
    TerminateFailed {
        name: String,
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("services are already running")]
    #[diagnostic(code(dopeman::supervisor::already_running))]
    AlreadyRunning,

    #[error("supervisor has been stopped and cannot be started again")]
    #[diagnostic(
        code(dopeman::supervisor::stopped),
        help("construct a new supervisor to start the services again")
    )]
    SupervisorStopped,

    #[error("services have not been started")]
    #[diagnostic(code(dopeman::lifecycle::not_started))]
    NotStarted,

    #[error("task script not found: {}", .path.display())]
    #[diagnostic(code(dopeman::task::not_found))]
    TaskNotFound { path: PathBuf },

    #[error("task {name} is already running")]
    #[diagnostic(code(dopeman::task::already_running))]
    TaskAlreadyRunning { name: String },

    #[error("task {name} failed ({exit})")]
    #[diagnostic(code(dopeman::task::non_zero_exit))]
    NonZeroExit { name: String, exit: ExitState },

    #[error("invalid readiness pattern for {name}")]
    #[diagnostic(code(dopeman::config::invalid_pattern))]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("interpreter `{interpreter}` not found on PATH")]
    #[diagnostic(
        code(dopeman::preflight::interpreter_not_found),
        help("install it or set `interpreter` in dopeman.yaml")
    )]
    InterpreterNotFound {
        interpreter: String,
        #[source]
        source: which::Error,
    },

    #[error("environment check failed: missing packages {}", .missing.join(", "))]
    #[diagnostic(
        code(dopeman::preflight::failed),
        help("install them with: {install_hint}")
    )]
    EnvironmentCheckFailed {
        missing: Vec<String>,
        install_hint: String,
    },

    #[error("failed to parse config {}", .path.display())]
    #[diagnostic(code(dopeman::config::parse))]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(dopeman::io))]
    Io(#[from] std::io::Error),
}
