//! One-shot helper tasks.
//!
//! Tasks inherit the host's stdio, so their output is not captured; only the
//! exit state matters. At most one run per script is in flight at a time.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{SupervisorConfig, TaskConfig};
use crate::error::{Error, Result};
use crate::process::ExitState;

/// Result of a finished task. A failing exit is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutcome {
    pub name: String,
    pub exit: ExitState,
    pub elapsed: Duration,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.exit.success()
    }

    /// Turn a non-zero or signalled exit into [`Error::NonZeroExit`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::NonZeroExit {
                name: self.name,
                exit: self.exit,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskRunner {
    interpreter: String,
    commands_dir: PathBuf,
    env: HashMap<String, String>,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
}

impl TaskRunner {
    pub fn new(interpreter: impl Into<String>, commands_dir: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            commands_dir: commands_dir.into(),
            env: HashMap::new(),
            in_flight: Arc::default(),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.interpreter.clone(), config.commands_dir.clone())
            .with_env(config.env.clone())
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Run a configured task.
    pub async fn run(&self, task: &TaskConfig) -> Result<TaskOutcome> {
        self.run_named(&task.name, &task.script, &task.args).await
    }

    /// Run `script` with the interpreter and wait for it to exit.
    ///
    /// Relative paths resolve against the commands directory. A missing script
    /// fails with [`Error::TaskNotFound`] before anything is spawned.
    pub async fn run_task(&self, script: impl AsRef<Path>, args: &[String]) -> Result<TaskOutcome> {
        let script = script.as_ref();
        let name = script
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| script.display().to_string());
        self.run_named(&name, script, args).await
    }

    /// Whether a run of `script` is in flight.
    pub fn is_running(&self, script: impl AsRef<Path>) -> bool {
        let path = self.resolve(script.as_ref());
        self.lock_in_flight().contains(&path)
    }

    async fn run_named(&self, name: &str, script: &Path, args: &[String]) -> Result<TaskOutcome> {
        let path = self.resolve(script);
        if !path.is_file() {
            return Err(Error::TaskNotFound { path });
        }

        let _guard = InFlightGuard::acquire(self, name, path.clone())?;

        info!(task = %name, "Running {}", path.display());
        let started = Instant::now();

        let mut command = tokio::process::Command::new(&self.interpreter);
        command
            .arg(&path)
            .args(args)
            .envs(&self.env)
            .current_dir(&self.commands_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| Error::SpawnFailed {
            name: name.to_string(),
            program: self.interpreter.clone(),
            source,
        })?;
        let exit = ExitState::from(child.wait().await?);

        let outcome = TaskOutcome {
            name: name.to_string(),
            exit,
            elapsed: started.elapsed(),
        };
        if outcome.is_success() {
            info!(task = %name, "Task finished in {:.1?}", outcome.elapsed);
        } else {
            warn!(task = %name, "Task failed ({}) after {:.1?}", exit, outcome.elapsed);
        }
        Ok(outcome)
    }

    /// Absolute path of `script`. The child runs inside the commands
    /// directory, so a path relative to the host's directory would not resolve.
    fn resolve(&self, script: &Path) -> PathBuf {
        let path = self.commands_dir.join(script);
        std::path::absolute(&path).unwrap_or(path)
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks a script as running until dropped.
struct InFlightGuard<'a> {
    runner: &'a TaskRunner,
    path: PathBuf,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(runner: &'a TaskRunner, name: &str, path: PathBuf) -> Result<Self> {
        if !runner.lock_in_flight().insert(path.clone()) {
            return Err(Error::TaskAlreadyRunning {
                name: name.to_string(),
            });
        }
        Ok(Self { runner, path })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.runner.lock_in_flight().remove(&self.path);
    }
}
