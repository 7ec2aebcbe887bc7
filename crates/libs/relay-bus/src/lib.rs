//! Bus Bridge: the local multicast bus bridge. Joins a fixed set of UDP
//! multicast groups on a single named interface and exposes two disjoint
//! port sets — app-egress (feeds the Reliable Sender pipeline) and
//! app-ingress (written to by the Ingress Router so the local
//! application sees exactly one copy of an overlay-delivered packet).

use relay_status::RateLimiter;
use relay_types::AppPort;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bridge interface {0:?} was not found or has no IPv4 address")]
    InterfaceUnavailable(String),
    #[error("invalid bus configuration: {0}")]
    InvalidConfig(String),
    #[error("socket error on {group}:{port}: {source}")]
    Socket { group: Ipv4Addr, port: u16, #[source] source: io::Error },
}

/// One multicast group/port the bridge listens on or sends to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSpec {
    pub group: Ipv4Addr,
    pub port: u16,
}

impl GroupSpec {
    pub fn new(group: Ipv4Addr, port: u16) -> Self {
        GroupSpec { group, port }
    }
}

/// The bridge's group configuration. App-egress and app-ingress ports must
/// be disjoint (enforced in [`BusConfig::validate`]) so the local
/// application can never re-ingest an overlay-delivered copy of its own
/// traffic.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub bridge_iface: String,
    pub egress_groups: Vec<GroupSpec>,
    pub ingress_groups: Vec<GroupSpec>,
}

impl BusConfig {
    pub fn validate(&self) -> Result<(), String> {
        let egress_ports: HashSet<u16> = self.egress_groups.iter().map(|g| g.port).collect();
        let ingress_ports: HashSet<u16> = self.ingress_groups.iter().map(|g| g.port).collect();
        if !egress_ports.is_disjoint(&ingress_ports) {
            return Err("app-egress and app-ingress port sets must be disjoint".to_string());
        }
        Ok(())
    }
}

struct GroupSocket {
    spec: GroupSpec,
    socket: UdpSocket,
}

fn resolve_interface_ipv4(name: &str) -> Result<Ipv4Addr, BusError> {
    let interfaces = if_addrs::get_if_addrs().map_err(|_| BusError::InterfaceUnavailable(name.to_string()))?;
    interfaces
        .into_iter()
        .find(|iface| iface.name == name)
        .and_then(|iface| match iface.ip() {
            std::net::IpAddr::V4(addr) => Some(addr),
            std::net::IpAddr::V6(_) => None,
        })
        .ok_or_else(|| BusError::InterfaceUnavailable(name.to_string()))
}

/// Multicast TTL for every group the bridge sends on. Keeps bus traffic
/// confined to the local segment and its immediate repeaters — it is not
/// meant to cross onto the wide-area overlay path.
const BUS_MULTICAST_TTL: u32 = 2;

fn build_group_socket(group: Ipv4Addr, port: u16, iface_addr: Ipv4Addr) -> Result<GroupSocket, BusError> {
    let wrap = |source: io::Error| BusError::Socket { group, port, source };
    let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(wrap)?;
    raw.set_reuse_address(true).map_err(wrap)?;
    let bind_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into();
    raw.bind(&bind_addr.into()).map_err(wrap)?;
    raw.join_multicast_v4(&group, &iface_addr).map_err(wrap)?;
    raw.set_multicast_ttl_v4(BUS_MULTICAST_TTL).map_err(wrap)?;
    raw.set_multicast_loop_v4(false).map_err(wrap)?;
    raw.set_nonblocking(true).map_err(wrap)?;
    let socket: UdpSocket = raw.into();
    Ok(GroupSocket { spec: GroupSpec::new(group, port), socket })
}

/// The live bridge: resolved interface address plus the egress and
/// ingress socket sets. Owned exclusively by the T-bus task.
pub struct BusBridge {
    config: BusConfig,
    iface_addr: Ipv4Addr,
    egress: Vec<GroupSocket>,
    ingress: Vec<GroupSocket>,
    read_error_limiter: RateLimiter,
}

impl BusBridge {
    /// Resolves the bridge interface and joins every configured group.
    /// Returns [`BusError::InterfaceUnavailable`] if the interface cannot
    /// be resolved yet; the daemon harness retries this past the startup
    /// grace period rather than treating it as fatal immediately.
    pub fn open(config: BusConfig) -> Result<Self, BusError> {
        config.validate().map_err(BusError::InvalidConfig)?;
        let iface_addr = resolve_interface_ipv4(&config.bridge_iface)?;
        let egress = config
            .egress_groups
            .iter()
            .map(|spec| build_group_socket(spec.group, spec.port, iface_addr))
            .collect::<Result<Vec<_>, _>>()?;
        let ingress = config
            .ingress_groups
            .iter()
            .map(|spec| build_group_socket(spec.group, spec.port, iface_addr))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BusBridge { config, iface_addr, egress, ingress, read_error_limiter: RateLimiter::new() })
    }

    /// One non-blocking poll cycle across every egress socket. Returns
    /// every datagram read this cycle, synchronously — the bridge never
    /// buffers. A read error on one socket rebuilds just that socket and
    /// is otherwise swallowed into a log line; the cycle continues.
    pub fn poll_egress(&mut self) -> Vec<(AppPort, Vec<u8>)> {
        let mut received = Vec::new();
        let mut buf = [0u8; 2048];
        for index in 0..self.egress.len() {
            loop {
                match self.egress[index].socket.recv_from(&mut buf) {
                    Ok((len, _source)) => received.push((AppPort(self.egress[index].spec.port), buf[..len].to_vec())),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        let spec = self.egress[index].spec;
                        let remote = format!("{}:{}", spec.group, spec.port);
                        if self.read_error_limiter.allow(&remote, "egress socket read failed") {
                            tracing::warn!(group = %spec.group, port = spec.port, error = %err, "egress socket read failed, rebuilding");
                        }
                        if let Ok(rebuilt) = build_group_socket(spec.group, spec.port, self.iface_addr) {
                            self.egress[index] = rebuilt;
                        }
                        break;
                    }
                }
            }
        }
        received
    }

    /// Injects a decompressed payload onto an app-ingress group so the
    /// local application receives it. Rejects ports outside the
    /// configured ingress set (no loopback onto egress ports) at the API
    /// boundary rather than trusting callers.
    pub fn send_ingress(&self, port: AppPort, bytes: &[u8]) -> Result<(), BusError> {
        let Some(target) = self.ingress.iter().find(|g| g.spec.port == port.0) else {
            return Err(BusError::InvalidConfig(format!("port {} is not an app-ingress port", port.0)));
        };
        let dest: SocketAddr = SocketAddrV4::new(target.spec.group, target.spec.port).into();
        target.socket.send_to(bytes, dest).map_err(|source| BusError::Socket { group: target.spec.group, port: target.spec.port, source })?;
        Ok(())
    }

    pub fn ingress_ports(&self) -> Vec<AppPort> {
        self.config.ingress_groups.iter().map(|g| AppPort(g.port)).collect()
    }

    pub fn egress_ports(&self) -> Vec<AppPort> {
        self.config.egress_groups.iter().map(|g| AppPort(g.port)).collect()
    }

    fn rebuild_all(&mut self) -> Result<(), BusError> {
        let iface_addr = resolve_interface_ipv4(&self.config.bridge_iface)?;
        self.iface_addr = iface_addr;
        self.egress = self
            .config
            .egress_groups
            .iter()
            .map(|spec| build_group_socket(spec.group, spec.port, iface_addr))
            .collect::<Result<Vec<_>, _>>()?;
        self.ingress = self
            .config
            .ingress_groups
            .iter()
            .map(|spec| build_group_socket(spec.group, spec.port, iface_addr))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }
}

/// Background task: polls the bridge interface's presence every 2 s and
/// rebuilds every socket if it disappears and returns, so a flapping
/// interface (radio power cycle, USB NIC re-enumeration) never leaves the
/// bridge stuck on stale sockets.
pub async fn watch_interface(
    bridge: std::sync::Arc<std::sync::Mutex<BusBridge>>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut was_present = true;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                let iface_name = bridge.lock().expect("bus bridge mutex poisoned").config.bridge_iface.clone();
                let present = resolve_interface_ipv4(&iface_name).is_ok();
                if present && !was_present {
                    tracing::info!(interface = %iface_name, "bridge interface returned, rebuilding sockets");
                    if let Err(err) = bridge.lock().expect("bus bridge mutex poisoned").rebuild_all() {
                        tracing::warn!(error = %err, "failed to rebuild sockets after interface returned");
                    }
                }
                was_present = present;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
