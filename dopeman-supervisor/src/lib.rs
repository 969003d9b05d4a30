//! Local process supervisor for the dopeman control center
//!
//! Finds free ports, launches the long-running helper servers bound to them,
//! waits for each to report readiness, runs one-shot helper tasks on demand,
//! and shuts everything down again.
//!
//! [`LifecycleController`] is the entry point for a host application. It
//! builds a [`ServiceSupervisor`] per session and exposes the [`HostApi`]
//! surface consumed by the UI.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod ports;
pub mod preflight;
pub mod process;
pub mod readiness;
pub mod state;
pub mod supervisor;
pub mod task;

pub use config::{
    PreflightConfig, ReadyConfig, ServiceConfig, ShutdownConfig, SupervisorConfig, TaskConfig,
};
pub use error::{Error, Result};
pub use lifecycle::{HostApi, LifecycleController};
pub use ports::{
    BindProbe, PortAllocator, PortAssignment, PortProbe, PortRange, PortRole, port_owner,
};
pub use preflight::{EnvironmentReport, PackageStatus, check_environment};
pub use process::{ExitState, LaunchCommand, ProcessHandle};
pub use readiness::{
    LineMatcher, OutputLine, OutputStream, ReadinessDetector, ReadinessOutcome, StreamSelector,
};
pub use state::{ServiceState, SupervisorPhase};
pub use supervisor::{ServiceSpec, ServiceSupervisor};
pub use task::{TaskOutcome, TaskRunner};
