//! The long-running service set.
//!
//! A [`ServiceSupervisor`] owns one [`ProcessHandle`] per [`ServiceSpec`] and
//! is the only thing that mutates them. Services start one at a time in
//! declaration order, each gated on its readiness detector. Any failure rolls
//! back everything started so far, and the supervisor ends up `Stopped`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use futures::future::join_all;
use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use crate::config::{PORT_PLACEHOLDER, SupervisorConfig};
use crate::error::{Error, Result};
use crate::ports::{PortAllocator, PortAssignment, PortRange, PortRole, port_owner};
use crate::process::{LaunchCommand, ProcessHandle};
use crate::readiness::{ReadinessDetector, ReadinessOutcome};
use crate::state::{ServiceState, SupervisorPhase};

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_MAX_PORT_ATTEMPTS: u32 = 3;

/// How to launch one long-running service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub command: String,
    /// May contain `{port}`.
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub readiness: ReadinessDetector,
    /// Fail with [`Error::ReadinessTimeout`] instead of continuing optimistically.
    pub require_ready_signal: bool,
    /// Port of the assignment this service binds, if any.
    pub port: Option<PortRole>,
}

impl ServiceSpec {
    /// Resolve the launch parameters for `port`.
    ///
    /// The port replaces every `{port}` in the args and is exported as `PORT`.
    pub fn launch_command(&self, port: Option<u16>) -> LaunchCommand {
        let mut env = self.env.clone();
        let args = match port {
            Some(port) => {
                let port = port.to_string();
                env.insert("PORT".to_string(), port.clone());
                self.args
                    .iter()
                    .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
                    .collect()
            }
            None => self.args.clone(),
        };

        LaunchCommand {
            name: self.name.clone(),
            program: self.command.clone(),
            args,
            cwd: self.working_dir.clone(),
            env,
        }
    }
}

pub struct ServiceSupervisor {
    specs: Vec<ServiceSpec>,
    handles: IndexMap<String, ProcessHandle>,
    /// Last known state of services without a live handle.
    states: IndexMap<String, ServiceState>,
    phase: SupervisorPhase,
    ports: Option<PortAssignment>,
    allocator: PortAllocator,
    range: PortRange,
    max_port_attempts: u32,
    grace_period: Duration,
}

impl ServiceSupervisor {
    /// Services start in the order given.
    pub fn new(specs: Vec<ServiceSpec>) -> Self {
        let states = specs
            .iter()
            .map(|spec| (spec.name.clone(), ServiceState::NotStarted))
            .collect();
        Self {
            specs,
            handles: IndexMap::new(),
            states,
            phase: SupervisorPhase::Idle,
            ports: None,
            allocator: PortAllocator::new(),
            range: PortRange::default(),
            max_port_attempts: DEFAULT_MAX_PORT_ATTEMPTS,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Result<Self> {
        let range = PortRange::new(config.ports.start.into(), config.ports.end.into())?;
        Ok(Self::new(config.service_specs()?)
            .with_port_range(range)
            .with_max_port_attempts(config.max_port_attempts)
            .with_grace_period(config.grace_period()))
    }

    pub fn with_allocator(mut self, allocator: PortAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    /// Range searched when a service has to move to another port.
    pub fn with_port_range(mut self, range: PortRange) -> Self {
        self.range = range;
        self
    }

    pub fn with_max_port_attempts(mut self, attempts: u32) -> Self {
        self.max_port_attempts = attempts.max(1);
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Start every service in order and wait for each to become ready.
    ///
    /// Returns the ports actually in use, which differ from `ports` when a
    /// service had to move after losing its port. On error every service
    /// started by this call has been stopped and the supervisor is `Stopped`.
    pub async fn start_all(&mut self, ports: PortAssignment) -> Result<PortAssignment> {
        match self.phase {
            SupervisorPhase::Idle => {}
            SupervisorPhase::Starting | SupervisorPhase::Running => {
                return Err(Error::AlreadyRunning);
            }
            SupervisorPhase::Stopped => return Err(Error::SupervisorStopped),
        }
        self.phase = SupervisorPhase::Starting;

        let mut assignment = ports;
        let specs = self.specs.clone();
        for spec in &specs {
            if let Err(e) = self.start_service(spec, &mut assignment).await {
                error!(service = %spec.name, "Failed to start service: {}", e);
                self.rollback().await;
                return Err(e);
            }
        }

        info!(
            http_port = assignment.http_port,
            web_socket_port = assignment.web_socket_port,
            "All services ready"
        );
        self.ports = Some(assignment);
        self.phase = SupervisorPhase::Running;
        Ok(assignment)
    }

    async fn start_service(
        &mut self,
        spec: &ServiceSpec,
        assignment: &mut PortAssignment,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            let port = spec.port.map(|role| assignment.get(role));
            self.states.insert(spec.name.clone(), ServiceState::Starting);

            let handle = match ProcessHandle::spawn(&spec.launch_command(port)) {
                Ok(handle) => handle,
                Err(e) => {
                    self.states.insert(spec.name.clone(), ServiceState::Failed);
                    return Err(e);
                }
            };
            let (index, _) = self.handles.insert_full(spec.name.clone(), handle);
            let handle = &mut self.handles[index];
            let pid = handle.pid();

            match handle.await_ready(&spec.readiness).await {
                ReadinessOutcome::Matched(_) => {
                    handle.transition(ServiceState::Ready);
                    info!(service = %spec.name, pid, port, "Service ready");
                    return Ok(());
                }
                ReadinessOutcome::TimedOut if spec.require_ready_signal => {
                    handle.transition(ServiceState::Failed);
                    return Err(Error::ReadinessTimeout {
                        name: spec.name.clone(),
                        timeout: spec.readiness.timeout(),
                    });
                }
                ReadinessOutcome::TimedOut => {
                    warn!(
                        service = %spec.name,
                        pid,
                        "No readiness signal within {}ms, assuming ready",
                        spec.readiness.timeout().as_millis()
                    );
                    handle.transition(ServiceState::Ready);
                    return Ok(());
                }
                ReadinessOutcome::Exited(exit) => {
                    handle.transition(ServiceState::Failed);

                    let next = match (spec.port, port) {
                        (Some(role), Some(port)) if attempt < self.max_port_attempts => {
                            self.next_port(role, port, assignment)
                        }
                        _ => None,
                    };
                    let (Some(role), Some(next)) = (spec.port, next) else {
                        return Err(Error::ExitedBeforeReady {
                            name: spec.name.clone(),
                            exit,
                        });
                    };

                    warn!(
                        service = %spec.name,
                        "Exited before ready ({}), retrying on port {} (attempt {}/{})",
                        exit,
                        next,
                        attempt + 1,
                        self.max_port_attempts
                    );
                    self.handles.shift_remove(&spec.name);
                    assignment.set(role, next);
                    attempt += 1;
                }
            }
        }
    }

    /// Next free port after `failed`, skipping ports held by other roles.
    ///
    /// `None` unless `failed` is in use now: an exit on a free port is a crash,
    /// not a lost port.
    fn next_port(&self, role: PortRole, failed: u16, assignment: &PortAssignment) -> Option<u16> {
        if self.allocator.is_available(failed) {
            debug!(port = failed, "Port is free, not retrying");
            return None;
        }
        if let Some(owner) = port_owner(failed) {
            debug!(port = failed, "Port is held by {}", owner);
        }
        let range = self.range.after(failed)?;
        match self
            .allocator
            .find_available_port_excluding(range, &assignment.others(role))
        {
            Ok(port) => Some(port),
            Err(e) => {
                debug!("No port to retry on: {}", e);
                None
            }
        }
    }

    async fn rollback(&mut self) {
        if !self.handles.is_empty() {
            warn!("Rolling back {} started service(s)", self.handles.len());
        }
        self.shutdown().await;
    }

    /// Stop every tracked service.
    ///
    /// Services are stopped concurrently with the configured grace period.
    /// Failures are logged, never returned. Calling this again is a no-op.
    pub async fn stop_all(&mut self) {
        if self.phase == SupervisorPhase::Stopped && self.handles.is_empty() {
            debug!("Supervisor already stopped");
            return;
        }
        info!("Stopping {} service(s)", self.handles.len());
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        let grace_period = self.grace_period;
        let stops = self.handles.values_mut().map(|handle| async move {
            match handle.stop(grace_period).await {
                Ok(exit) => debug!(service = %handle.name(), "Stopped ({:?})", exit),
                Err(e) => warn!(service = %handle.name(), "Failed to stop service: {}", e),
            }
        });
        join_all(stops).await;

        self.handles.clear();
        for state in self.states.values_mut() {
            if state.can_transition_to(ServiceState::Stopped) {
                *state = ServiceState::Stopped;
            }
        }
        self.ports = None;
        self.phase = SupervisorPhase::Stopped;
    }

    pub fn phase(&self) -> SupervisorPhase {
        self.phase
    }

    /// Ports in use while running.
    pub fn ports(&self) -> Option<PortAssignment> {
        self.ports
    }

    pub fn service_state(&self, name: &str) -> Option<ServiceState> {
        self.handles
            .get(name)
            .map(ProcessHandle::state)
            .or_else(|| self.states.get(name).copied())
    }

    pub fn pid(&self, name: &str) -> Option<u32> {
        self.handles.get(name).map(ProcessHandle::pid)
    }

    /// Number of process handles currently held.
    pub fn tracked_count(&self) -> usize {
        self.handles.len()
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|spec| spec.name.as_str())
    }
}

impl Drop for ServiceSupervisor {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            warn!(
                "Supervisor dropped with {} live service(s); killing them",
                self.handles.len()
            );
        }
    }
}
