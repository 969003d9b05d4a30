//! Port allocation by bind-probing.
//!
//! Probing is a hint, not a reservation: the listener is released before the
//! port number is handed out, so another process can take the port before the
//! service binds it. [`crate::ServiceSupervisor`] recovers from that by moving
//! the service to the next free port when it exits before becoming ready.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default host for probing (loopback only).
pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Inclusive port range, `start <= end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Validate and build a range. Both ends must be in `1..=65535`.
    pub fn new(start: u32, end: u32) -> Result<Self> {
        if start == 0 || start > end || end > u32::from(u16::MAX) {
            return Err(Error::InvalidPortRange { start, end });
        }
        Ok(Self {
            start: start as u16,
            end: end as u16,
        })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Sub-range starting right after `port`, if any ports remain.
    pub fn after(&self, port: u16) -> Option<Self> {
        let start = port.checked_add(1)?.max(self.start);
        (start <= self.end).then_some(Self {
            start,
            end: self.end,
        })
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 8891,
            end: 8999,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Which port of the assignment a service binds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    Http,
    WebSocket,
}

/// Ports handed to the managed services for the lifetime of one supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    pub http_port: u16,
    pub web_socket_port: u16,
}

impl PortAssignment {
    pub fn get(&self, role: PortRole) -> u16 {
        match role {
            PortRole::Http => self.http_port,
            PortRole::WebSocket => self.web_socket_port,
        }
    }

    pub fn set(&mut self, role: PortRole, port: u16) {
        match role {
            PortRole::Http => self.http_port = port,
            PortRole::WebSocket => self.web_socket_port = port,
        }
    }

    /// Ports held by every role except `role`.
    pub fn others(&self, role: PortRole) -> Vec<u16> {
        match role {
            PortRole::Http => vec![self.web_socket_port],
            PortRole::WebSocket => vec![self.http_port],
        }
    }
}

/// Availability test for a single port.
pub trait PortProbe: Send + Sync {
    fn is_available(&self, host: IpAddr, port: u16) -> bool;
}

/// Binds a listener and drops it immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct BindProbe;

impl PortProbe for BindProbe {
    fn is_available(&self, host: IpAddr, port: u16) -> bool {
        match TcpListener::bind(SocketAddr::new(host, port)) {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(e) => {
                debug!(port, "Port probe failed: {}", e);
                false
            }
        }
    }
}

/// Finds unused TCP ports by probing sequentially.
#[derive(Clone)]
pub struct PortAllocator {
    host: IpAddr,
    probe: Arc<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::with_probe(BindProbe)
    }

    pub fn with_probe(probe: impl PortProbe + 'static) -> Self {
        Self {
            host: DEFAULT_HOST,
            probe: Arc::new(probe),
        }
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// First port in `range` that binds, probing from `range.start` upwards.
    pub fn find_available_port(&self, range: PortRange) -> Result<u16> {
        self.find_available_port_excluding(range, &[])
    }

    /// Like [`find_available_port`](Self::find_available_port), but never
    /// returns (or probes) a port listed in `exclude`.
    pub fn find_available_port_excluding(&self, range: PortRange, exclude: &[u16]) -> Result<u16> {
        debug!("Searching for an available port in {}", range);
        for port in range.start..=range.end {
            if exclude.contains(&port) {
                continue;
            }
            if self.probe.is_available(self.host, port) {
                info!(port, "Found available port");
                return Ok(port);
            }
        }
        Err(Error::NoPortAvailable {
            start: range.start,
            end: range.end,
        })
    }

    /// Probe each port independently.
    pub fn check_ports(&self, ports: &[u16]) -> BTreeMap<u16, bool> {
        ports
            .iter()
            .map(|&port| (port, self.is_available(port)))
            .collect()
    }

    pub fn is_available(&self, port: u16) -> bool {
        self.probe.is_available(self.host, port)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortAllocator")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// Describe the process listening on `port`, e.g. `python3 (PID 4242)`.
pub fn port_owner(port: u16) -> Option<String> {
    use netstat2::{AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, get_sockets_info};

    let af_flags = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
    let sockets = get_sockets_info(af_flags, ProtocolFlags::TCP).ok()?;

    sockets.into_iter().find_map(|socket| {
        let local_port = match &socket.protocol_socket_info {
            ProtocolSocketInfo::Tcp(tcp) => tcp.local_port,
            ProtocolSocketInfo::Udp(udp) => udp.local_port,
        };
        if local_port != port {
            return None;
        }
        let pid = *socket.associated_pids.first()?;

        #[cfg(target_os = "linux")]
        if let Ok(name) = std::fs::read_to_string(format!("/proc/{}/comm", pid)) {
            return Some(format!("{} (PID {})", name.trim(), pid));
        }

        Some(format!("PID {}", pid))
    })
}
