//! The object a host application drives.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::ports::{PortAllocator, PortAssignment, PortRange};
use crate::preflight::{self, EnvironmentReport};
use crate::supervisor::ServiceSupervisor;
use crate::task::{TaskOutcome, TaskRunner};

/// Operations the UI layer may invoke.
#[async_trait]
pub trait HostApi: Send + Sync {
    async fn get_ports(&self) -> Result<PortAssignment>;
    async fn scan_skills(&self) -> Result<TaskOutcome>;
    async fn health_check(&self) -> Result<TaskOutcome>;
}

/// Owns the supervisor for one session and the task runner.
///
/// `stop` discards the supervisor; a later `start` allocates fresh ports and
/// builds a new one.
pub struct LifecycleController {
    config: SupervisorConfig,
    allocator: PortAllocator,
    tasks: TaskRunner,
    supervisor: Mutex<Option<ServiceSupervisor>>,
}

impl LifecycleController {
    pub fn new(config: SupervisorConfig) -> Self {
        let tasks = TaskRunner::from_config(&config);
        Self {
            config,
            allocator: PortAllocator::new(),
            tasks,
            supervisor: Mutex::new(None),
        }
    }

    pub fn with_allocator(mut self, allocator: PortAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run the configured environment check.
    pub async fn preflight(&self) -> Result<EnvironmentReport> {
        let requirements = self
            .config
            .preflight
            .requirements
            .as_ref()
            .map(|path| self.config.commands_dir.join(path));
        let report =
            preflight::check_environment(&self.config.interpreter, requirements.as_deref()).await?;
        report.ensure_complete(requirements.as_deref())?;
        Ok(report)
    }

    /// Allocate ports and start every service.
    ///
    /// The HTTP port is the first free port in the configured range; the
    /// WebSocket port is the first free port after it.
    pub async fn start(&self) -> Result<PortAssignment> {
        let mut slot = self.supervisor.lock().await;
        if slot.is_some() {
            return Err(Error::AlreadyRunning);
        }

        if self.config.preflight.enable {
            self.preflight().await?;
        }

        let range = PortRange::new(self.config.ports.start.into(), self.config.ports.end.into())?;
        let http_port = self.allocator.find_available_port(range)?;
        let web_socket_port = range
            .after(http_port)
            .ok_or(Error::NoPortAvailable {
                start: range.start,
                end: range.end,
            })
            .and_then(|rest| self.allocator.find_available_port(rest))?;
        let ports = PortAssignment {
            http_port,
            web_socket_port,
        };
        info!(http_port, web_socket_port, "Allocated ports");

        let mut supervisor =
            ServiceSupervisor::from_config(&self.config)?.with_allocator(self.allocator.clone());
        let ports = supervisor.start_all(ports).await?;
        *slot = Some(supervisor);
        Ok(ports)
    }

    /// Stop every service. A no-op when nothing is running.
    pub async fn stop(&self) {
        let supervisor = self.supervisor.lock().await.take();
        match supervisor {
            Some(mut supervisor) => supervisor.stop_all().await,
            None => info!("Nothing to stop"),
        }
    }

    /// Ports of the running services.
    pub async fn ports(&self) -> Result<PortAssignment> {
        self.supervisor
            .lock()
            .await
            .as_ref()
            .and_then(ServiceSupervisor::ports)
            .ok_or(Error::NotStarted)
    }

    pub async fn is_running(&self) -> bool {
        self.supervisor.lock().await.is_some()
    }

    pub async fn trigger_scan(&self) -> Result<TaskOutcome> {
        self.tasks.run(&self.config.scan).await
    }

    pub async fn trigger_health_check(&self) -> Result<TaskOutcome> {
        self.tasks.run(&self.config.health_check).await
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        if self.supervisor.get_mut().is_some() {
            warn!("Controller dropped without stop()");
        }
    }
}

#[async_trait]
impl HostApi for LifecycleController {
    async fn get_ports(&self) -> Result<PortAssignment> {
        self.ports().await
    }

    async fn scan_skills(&self) -> Result<TaskOutcome> {
        self.trigger_scan().await
    }

    async fn health_check(&self) -> Result<TaskOutcome> {
        self.trigger_health_check().await
    }
}
