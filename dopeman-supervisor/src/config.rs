//! Configuration types.
//!
//! Every field has a default reproducing the stock control center, so an
//! empty `dopeman.yaml` (or none at all) launches the bundled Python helpers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ports::{PortRange, PortRole};
use crate::readiness::{LineMatcher, ReadinessDetector, StreamSelector};
use crate::supervisor::ServiceSpec;

/// Placeholder in service args replaced with the assigned port.
pub const PORT_PLACEHOLDER: &str = "{port}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Program used to run every helper.
    pub interpreter: String,
    /// Working directory of every helper; task scripts resolve against it.
    pub commands_dir: PathBuf,
    pub ports: PortRange,
    /// Launch attempts per port-bound service before giving up.
    pub max_port_attempts: u32,
    /// Page opened by the dashboard, relative to the HTTP root.
    pub dashboard: String,
    pub http: ServiceConfig,
    pub websocket: ServiceConfig,
    pub scan: TaskConfig,
    pub health_check: TaskConfig,
    pub shutdown: ShutdownConfig,
    pub preflight: PreflightConfig,
    /// Extra variables for every helper.
    pub env: HashMap<String, String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            commands_dir: PathBuf::from("commands"),
            ports: PortRange::default(),
            max_port_attempts: 3,
            dashboard: "control-center-real.html".to_string(),
            http: ServiceConfig::http(),
            websocket: ServiceConfig::websocket(),
            scan: TaskConfig::new("scan", "scan-real-data.py"),
            health_check: TaskConfig::new("health-check", "health-check.py"),
            shutdown: ShutdownConfig::default(),
            preflight: PreflightConfig::default(),
            env: HashMap::new(),
        }
    }
}

impl SupervisorConfig {
    /// Load from a YAML file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents).map_err(|source| Error::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// Managed services in launch order: HTTP first, the dashboard's page load depends on it.
    pub fn service_specs(&self) -> Result<Vec<ServiceSpec>> {
        Ok(vec![
            self.http.to_spec(self, PortRole::Http)?,
            self.websocket.to_spec(self, PortRole::WebSocket)?,
        ])
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_period_ms)
    }
}

/// A long-running service. A section present in the file replaces the
/// built-in one as a whole; an empty `name` falls back to the role name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    /// Arguments after the interpreter; `{port}` is substituted.
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub ready: ReadyConfig,
}

impl ServiceConfig {
    fn http() -> Self {
        Self {
            name: "http".to_string(),
            args: vec![
                "-m".to_string(),
                "http.server".to_string(),
                PORT_PLACEHOLDER.to_string(),
            ],
            env: HashMap::new(),
            ready: ReadyConfig {
                stream: StreamSelector::Stderr,
                contains: vec!["Serving HTTP".to_string()],
                pattern: None,
                timeout_ms: 1000,
                require_signal: false,
            },
        }
    }

    fn websocket() -> Self {
        Self {
            name: "websocket".to_string(),
            args: vec![
                "websocket-server.py".to_string(),
                "--port".to_string(),
                PORT_PLACEHOLDER.to_string(),
            ],
            env: HashMap::new(),
            ready: ReadyConfig {
                stream: StreamSelector::Stdout,
                contains: vec!["WebSocket Server".to_string(), "listening".to_string()],
                pattern: None,
                timeout_ms: 2000,
                require_signal: false,
            },
        }
    }

    fn to_spec(&self, config: &SupervisorConfig, role: PortRole) -> Result<ServiceSpec> {
        let name = if self.name.is_empty() {
            match role {
                PortRole::Http => "http".to_string(),
                PortRole::WebSocket => "websocket".to_string(),
            }
        } else {
            self.name.clone()
        };

        let mut env = config.env.clone();
        env.extend(self.env.clone());

        let matcher = self.ready.matcher().map_err(|source| Error::InvalidPattern {
            name: name.clone(),
            source,
        })?;

        Ok(ServiceSpec {
            name,
            command: config.interpreter.clone(),
            args: self.args.clone(),
            working_dir: Some(config.commands_dir.clone()),
            env,
            readiness: ReadinessDetector::new(matcher, self.ready.timeout()),
            require_ready_signal: self.ready.require_signal,
            port: Some(role),
        })
    }
}

/// How a service announces readiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadyConfig {
    pub stream: StreamSelector,
    /// Ready once a line contains any of these.
    pub contains: Vec<String>,
    /// Regular expression; takes precedence over `contains`.
    pub pattern: Option<String>,
    pub timeout_ms: u64,
    /// Treat the timeout as a failure instead of proceeding optimistically.
    pub require_signal: bool,
}

impl Default for ReadyConfig {
    fn default() -> Self {
        Self {
            stream: StreamSelector::Any,
            contains: Vec::new(),
            pattern: None,
            timeout_ms: 2000,
            require_signal: false,
        }
    }
}

impl ReadyConfig {
    pub fn matcher(&self) -> Result<LineMatcher, regex::Error> {
        match &self.pattern {
            Some(pattern) => Ok(LineMatcher::new(self.stream, Regex::new(pattern)?)),
            None => LineMatcher::contains_any(self.stream, &self.contains),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A one-shot helper script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskConfig {
    pub name: String,
    /// Relative paths resolve against `commands_dir`.
    pub script: PathBuf,
    pub args: Vec<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self::new("task", "")
    }
}

impl TaskConfig {
    pub fn new(name: &str, script: &str) -> Self {
        Self {
            name: name.to_string(),
            script: PathBuf::from(script),
            args: Vec::new(),
        }
    }

    pub fn script_path(&self, commands_dir: &Path) -> PathBuf {
        commands_dir.join(&self.script)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownConfig {
    /// Time between SIGTERM and SIGKILL.
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreflightConfig {
    pub enable: bool,
    /// `requirements.txt`-style file; relative paths resolve against `commands_dir`.
    pub requirements: Option<PathBuf>,
}
