//! Shared test utilities for dopeman-supervisor integration tests.

// Each test file compiles separately, so not all helpers are used in each binary
#![allow(dead_code)]

use dopeman_supervisor::{
    PortAllocator, PortProbe, ReadyConfig, StreamSelector, SupervisorConfig,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::fs;

/// Stand-in for `python3 -m http.server`: records its port, announces on stderr.
pub const FAKE_HTTP: &str = r#"#!/bin/sh
echo "$1" > http.port
echo "Serving HTTP on 127.0.0.1 port $1 (http://127.0.0.1:$1/) ..." >&2
exec sleep 60
"#;

/// Stand-in for the WebSocket server. Exits like a failed bind when its port
/// equals `$BLOCKED_PORT`.
pub const FAKE_WEBSOCKET: &str = r#"#!/bin/sh
if [ "$2" = "$BLOCKED_PORT" ]; then
  echo "OSError: [Errno 98] Address already in use" >&2
  exit 1
fi
echo "$2" > ws.port
echo "WebSocket Server listening on ws://127.0.0.1:$2"
exec sleep 60
"#;

/// Test context that manages the temporary commands directory.
pub struct TestContext {
    pub temp_dir: TempDir,
    pub commands_dir: PathBuf,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let commands_dir = temp_dir.path().join("commands");
        std::fs::create_dir_all(&commands_dir).expect("Failed to create commands dir");
        Self {
            temp_dir,
            commands_dir,
        }
    }

    /// Create an executable script in the commands directory
    pub async fn create_script(&self, name: &str, content: &str) -> PathBuf {
        let path = self.commands_dir.join(name);
        fs::write(&path, content)
            .await
            .expect("Failed to write script");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .expect("Failed to set permissions");
        }
        path
    }

    /// Install the fake HTTP and WebSocket servers.
    pub async fn install_fake_services(&self) {
        self.create_script("http.sh", FAKE_HTTP).await;
        self.create_script("ws.sh", FAKE_WEBSOCKET).await;
    }

    /// Configuration running the fake services through `sh`.
    pub fn config(&self) -> SupervisorConfig {
        let mut config = SupervisorConfig {
            interpreter: "sh".to_string(),
            commands_dir: self.commands_dir.clone(),
            ..Default::default()
        };
        config.http.args = vec!["http.sh".to_string(), "{port}".to_string()];
        config.http.ready = ReadyConfig {
            stream: StreamSelector::Stderr,
            contains: vec!["Serving HTTP".to_string()],
            timeout_ms: 5000,
            ..Default::default()
        };
        config.websocket.args = vec![
            "ws.sh".to_string(),
            "--port".to_string(),
            "{port}".to_string(),
        ];
        config.websocket.ready = ReadyConfig {
            stream: StreamSelector::Stdout,
            contains: vec!["WebSocket Server".to_string(), "listening".to_string()],
            timeout_ms: 5000,
            ..Default::default()
        };
        config.shutdown.grace_period_ms = 2000;
        config
    }

    /// Port a fake service recorded, if it got that far.
    pub fn recorded_port(&self, file: &str) -> Option<u16> {
        std::fs::read_to_string(self.commands_dir.join(file))
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

/// Probe that reports every port free.
pub struct AllFree;

impl PortProbe for AllFree {
    fn is_available(&self, _host: IpAddr, _port: u16) -> bool {
        true
    }
}

pub fn all_free_allocator() -> PortAllocator {
    PortAllocator::with_probe(AllFree)
}

/// Probe that reports only the given ports as taken.
pub struct Taken(pub Vec<u16>);

impl PortProbe for Taken {
    fn is_available(&self, _host: IpAddr, port: u16) -> bool {
        !self.0.contains(&port)
    }
}

pub fn taken_allocator(ports: &[u16]) -> PortAllocator {
    PortAllocator::with_probe(Taken(ports.to_vec()))
}

/// Whether a process with `pid` exists and is not a zombie.
pub fn pid_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if kill(Pid::from_raw(pid), None).is_err() {
        return false;
    }
    if !cfg!(target_os = "linux") {
        return true;
    }
    // Reparented children stay zombies until init reaps them.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| !rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

/// Read a pid written by a test script.
pub fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_for_condition<F>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
