//! Network Manager Facade
//!
//! The host-facing surface: discovery and broadcast, target lifecycle
//! (add/remove/connect/disconnect), the periodic heartbeat tick, command
//! dispatch, TTY callback registration and orderly shutdown.
//!
//! One caller task drives everything here; the completion engine's reader
//! tasks are the only other path touching targets, always through the
//! per-target lock.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use targetlink_codec::{
    encode, try_decode, Channel, Decoded, Message, MessageKind, Payload, ServerAnnounce,
};

use crate::engine::{CompletionEngine, TtyCallback, TtySink};
use crate::error::{NetworkError, Result};
use crate::registry::TargetRegistry;
use crate::socket::{TcpEndpoint, UdpEndpoint};
use crate::target::{
    HeartbeatAction, HeartbeatTiming, Target, TargetHandle, TargetState, TtyEvent, TtyFilter,
};

/// Network manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP port devices listen on for discovery requests
    pub discovery_port: u16,
    /// Local address sockets bind to
    pub bind_address: SocketAddr,
    /// Override for the discovery destination; defaults to the subnet
    /// broadcast address on `discovery_port`
    pub broadcast_address: Option<SocketAddr>,
    /// How long to collect discovery replies
    pub discovery_window: Duration,
    /// Minimum gap between pings to a connected target
    pub ping_interval: Duration,
    /// Reply silence that marks a connection dead
    pub ping_timeout: Duration,
    /// Wait before each reconnect attempt
    pub reconnect_delay: Duration,
    /// TCP connect deadline
    pub connect_timeout: Duration,
    /// Never-connected targets are dropped after this much inactivity
    pub never_connected_expiry: Duration,
    /// Times the disconnect handshake is repeated (datagrams may be lost)
    pub disconnect_repeats: u32,
    /// Bound on joining reader tasks at shutdown
    pub shutdown_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: 13650,
            bind_address: "0.0.0.0:0".parse().unwrap(),
            broadcast_address: None,
            discovery_window: Duration::from_secs(1),
            ping_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(4),
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            never_connected_expiry: Duration::from_secs(30),
            disconnect_repeats: 3,
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

impl NetworkConfig {
    fn timing(&self) -> HeartbeatTiming {
        HeartbeatTiming {
            ping_interval: self.ping_interval,
            ping_timeout: self.ping_timeout,
            reconnect_delay: self.reconnect_delay,
        }
    }

    fn broadcast_destination(&self) -> SocketAddr {
        self.broadcast_address
            .unwrap_or_else(|| SocketAddr::new(Ipv4Addr::BROADCAST.into(), self.discovery_port))
    }
}

/// Debug-link network manager: discovers targets, maintains their
/// connections, and multiplexes their TTY streams to the host.
///
/// Constructed explicitly by the host via [`NetworkManager::initialize`];
/// there is no process-wide instance.
pub struct NetworkManager {
    config: NetworkConfig,
    timing: HeartbeatTiming,
    registry: Arc<TargetRegistry>,
    engine: CompletionEngine,
    discovery: UdpEndpoint,
    tty: TtySink,
}

impl NetworkManager {
    /// Open the broadcast-capable discovery socket and stand up the
    /// completion engine. This is the one operation whose failure is
    /// surfaced: without the discovery socket nothing else can work.
    pub async fn initialize(config: NetworkConfig) -> Result<Self> {
        let discovery = UdpEndpoint::bind(config.bind_address).await?;
        discovery.enable_broadcast()?;
        info!(local = %discovery.local_addr()?, "Network manager initialized");

        Ok(Self {
            timing: config.timing(),
            config,
            registry: Arc::new(TargetRegistry::new()),
            engine: CompletionEngine::new(),
            discovery,
            tty: TtySink::new(),
        })
    }

    /// Register the host callback that receives decoded TTY lines. The
    /// callback may be invoked concurrently across distinct targets.
    pub fn register_text_callback<F>(&self, callback: F)
    where
        F: Fn(TtyEvent) + Send + Sync + 'static,
    {
        self.tty.register(Arc::new(callback) as TtyCallback);
    }

    /// Broadcast a discovery request and collect replies for the configured
    /// window. Every valid reply registers a target; a malformed reply
    /// (empty computer name, truncated payload) removes the target it just
    /// added rather than keeping it half-initialized.
    pub async fn discover_targets(&self) -> Result<Vec<TargetHandle>> {
        let request = encode(&Message::header_only(MessageKind::ServerAnnounce));
        let destination = self.config.broadcast_destination();
        self.discovery.send_to(&request, destination).await?;
        debug!(%destination, "Discovery request broadcast");

        let mut found = Vec::new();
        let deadline = Instant::now() + self.config.discovery_window;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.discovery.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    warn!(error = %e, "Discovery receive failed");
                    break;
                }
                Ok(Ok((n, sender))) => {
                    if let Some(handle) = self.accept_discovery_reply(&buf[..n], sender).await {
                        found.push(handle);
                    }
                }
            }
        }

        info!(count = found.len(), "Discovery window closed");
        Ok(found)
    }

    async fn accept_discovery_reply(
        &self,
        datagram: &[u8],
        sender: SocketAddr,
    ) -> Option<TargetHandle> {
        let message = match try_decode(datagram) {
            Decoded::Complete { message, .. } if message.kind == MessageKind::ServerResponse => {
                message
            }
            Decoded::Complete { message, .. } => {
                debug!(peer = %sender, kind = ?message.kind, "Ignoring non-response discovery datagram");
                return None;
            }
            // Short datagram: transient, silently ignored
            Decoded::Incomplete => return None,
            Decoded::Invalid(e) => {
                warn!(peer = %sender, error = %e, "Undecodable discovery reply");
                return None;
            }
        };

        let Payload::Blob(blob) = message.payload else {
            warn!(peer = %sender, "Discovery reply without identity payload");
            return None;
        };

        // Register first, then validate: a bad payload removes the entry so
        // nothing half-initialized lingers in the registry.
        let handle = self.add_target(sender);
        match ServerAnnounce::parse(&blob) {
            Ok(announce) if !announce.computer_name.is_empty() => {
                let slot = self.registry.get(handle)?;
                let mut target = slot.lock().await;
                target.computer_name = announce.computer_name;
                target.game_name = announce.game_name;
                target.game_type = announce.game_type;
                target.platform_type = announce.platform_type;
                target.listen_port = announce.listen_port;
                info!(
                    %handle,
                    peer = %sender,
                    name = %target.display_name(),
                    listen_port = target.listen_port,
                    "Discovered target"
                );
                Some(handle)
            }
            Ok(_) => {
                warn!(peer = %sender, "Discovery reply with empty computer name, removing target");
                self.remove_target(handle).await;
                None
            }
            Err(e) => {
                warn!(peer = %sender, error = %e, "Malformed discovery reply, removing target");
                self.remove_target(handle).await;
                None
            }
        }
    }

    /// Synthesize a loopback target without any network traffic, for the
    /// case where only one well-known local instance is relevant.
    pub async fn add_local_target(&self, listen_port: u16) -> TargetHandle {
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), self.config.discovery_port);
        let handle = self.add_target(addr);
        if let Some(slot) = self.registry.get(handle) {
            let mut target = slot.lock().await;
            target.computer_name = "localhost".to_owned();
            target.listen_port = listen_port;
        }
        handle
    }

    /// Register an address, or return the existing handle if it is already
    /// known. Sockets are created lazily at connect time, so a returned
    /// existing target with closed sockets just reconnects cleanly.
    pub fn add_target(&self, addr: SocketAddr) -> TargetHandle {
        if let Some(existing) = self.registry.find_by_addr(addr) {
            return existing;
        }
        let handle = self.registry.insert(Target::new(addr));
        debug!(%handle, %addr, "Registered target");
        handle
    }

    /// Close both sockets and drop the target. Returns false for an unknown
    /// handle.
    pub async fn remove_target(&self, handle: TargetHandle) -> bool {
        match self.registry.remove(handle) {
            Some(slot) => {
                slot.lock().await.close_endpoints();
                debug!(%handle, "Removed target");
                true
            }
            None => false,
        }
    }

    /// Connect the control and logging links to a target. Idempotent: an
    /// already connected target is sent the disconnect handshake and torn
    /// down before the fresh attempt. Connection failures are not errors to
    /// the caller - they report false and the target stays registered.
    pub async fn connect_to_target(&self, handle: TargetHandle) -> bool {
        let Some(slot) = self.registry.get(handle) else {
            warn!(%handle, "Connect requested for unknown target");
            return false;
        };
        let mut target = slot.lock().await;

        if target.connected {
            self.send_disconnect(&mut target).await;
            target.close_endpoints();
            // Give the device a moment to notice before the new handshake
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        match self.establish(&mut target).await {
            Ok(()) => true,
            Err(e) => {
                warn!(%handle, error = %e, "Connect attempt failed");
                false
            }
        }
    }

    /// Create sockets as needed, send the connect handshake over UDP, open
    /// the TCP logging stream and hand its read half to the completion
    /// engine. Caller holds the target lock.
    async fn establish(&self, target: &mut Target) -> Result<()> {
        if target.udp.is_none() {
            let udp = UdpEndpoint::bind(self.config.bind_address).await?;
            udp.connect(target.addr()).await?;
            target.udp = Some(udp);
        }

        let handshake = encode(&Message::header_only(MessageKind::Connect));
        if let Some(udp) = &target.udp {
            udp.send(&handshake).await?;
        }

        let stream_addr = SocketAddr::new(target.addr().ip(), target.listen_port());
        let (tcp, read_half) = TcpEndpoint::connect(stream_addr, self.config.connect_timeout).await?;
        target.tcp = Some(tcp);
        let session = target.begin_session();
        self.engine.attach(
            target.handle(),
            session,
            read_half,
            self.registry.clone(),
            self.tty.clone(),
        );

        target.mark_connected(Instant::now());
        info!(handle = %target.handle(), name = %target.display_name(), "Connected to target");
        Ok(())
    }

    /// Send the disconnect handshake (repeated, datagrams may be lost) and
    /// drop the target.
    pub async fn disconnect_target(&self, handle: TargetHandle) {
        if let Some(slot) = self.registry.get(handle) {
            let mut target = slot.lock().await;
            self.send_disconnect(&mut target).await;
        }
        self.remove_target(handle).await;
    }

    async fn send_disconnect(&self, target: &mut Target) {
        let frame = encode(&Message::header_only(MessageKind::Disconnect));
        if let Some(udp) = &target.udp {
            for _ in 0..self.config.disconnect_repeats {
                if let Err(e) = udp.send(&frame).await {
                    debug!(handle = %target.handle(), "Disconnect handshake send failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Send a named command string to a target over its control link
    pub async fn send_command(&self, handle: TargetHandle, text: &str) -> Result<()> {
        let slot = self
            .registry
            .get(handle)
            .ok_or(NetworkError::UnknownTarget(handle.raw()))?;
        let target = slot.lock().await;
        let udp = target.udp.as_ref().ok_or_else(|| {
            NetworkError::connection("Target has no control socket", Some(target.addr()))
        })?;
        let frame = encode(&Message::transmission(Channel::Remote, text));
        udp.send(&frame).await?;
        Ok(())
    }

    /// Run one heartbeat step over every registered target: ping the
    /// healthy, declare the silent dead, attempt due reconnects, and expire
    /// never-connected entries.
    pub async fn tick(&self) {
        let now = Instant::now();
        for handle in self.registry.handles() {
            let Some(slot) = self.registry.get(handle) else {
                continue;
            };
            let mut target = slot.lock().await;

            if target.is_expired(now, self.config.never_connected_expiry) {
                drop(target);
                debug!(%handle, "Expiring never-connected target");
                self.remove_target(handle).await;
                continue;
            }

            match target.heartbeat(now, &self.timing) {
                HeartbeatAction::None => {}
                HeartbeatAction::SendPing => {
                    let frame = encode(&Message::header_only(MessageKind::Ping));
                    if let Some(udp) = &target.udp {
                        if let Err(e) = udp.send(&frame).await {
                            // Transient; the reply timeout is the arbiter
                            debug!(%handle, "Ping send failed: {}", e);
                        }
                    }
                }
                HeartbeatAction::ScheduleReconnect => {
                    let name = target.display_name();
                    warn!(%handle, name = %name, "Ping reply timeout, scheduling reconnect");
                    target.close_endpoints();
                    self.tty.emit(TtyEvent {
                        handle,
                        channel: Channel::Debug.name(),
                        text: format!("Lost connection to {name}, reconnect scheduled"),
                    });
                }
                HeartbeatAction::AttemptReconnect => match self.establish(&mut target).await {
                    Ok(()) => {
                        info!(%handle, "Reconnected to target");
                    }
                    Err(e) => {
                        // Never fatal to the target's existence
                        warn!(%handle, error = %e, "Reconnect attempt failed, rescheduling");
                        target.reschedule_reconnect(now, &self.timing);
                    }
                },
            }
        }
    }

    /// Stop the reader tasks, close every socket and clear the registry
    pub async fn shutdown(&self) {
        info!("Network manager shutting down");
        self.engine.shutdown(self.config.shutdown_timeout).await;
        for slot in self.registry.drain() {
            slot.lock().await.close_endpoints();
        }
    }

    pub fn list_target_handles(&self) -> Vec<TargetHandle> {
        self.registry.handles()
    }

    pub async fn target_display_name(&self, handle: TargetHandle) -> Option<String> {
        let slot = self.registry.get(handle)?;
        let target = slot.lock().await;
        Some(target.display_name())
    }

    pub async fn target_state(&self, handle: TargetHandle) -> Option<TargetState> {
        let slot = self.registry.get(handle)?;
        let target = slot.lock().await;
        Some(target.state())
    }

    /// TCP port a target's logging stream listens on
    pub async fn target_listen_port(&self, handle: TargetHandle) -> Option<u16> {
        let slot = self.registry.get(handle)?;
        let target = slot.lock().await;
        Some(target.listen_port())
    }

    /// Install a platform-specific TTY filter for a target
    pub async fn set_target_filter(&self, handle: TargetHandle, filter: Box<dyn TtyFilter>) {
        if let Some(slot) = self.registry.get(handle) {
            slot.lock().await.set_filter(filter);
        }
    }

    /// Local address of the discovery socket
    pub fn discovery_addr(&self) -> Result<SocketAddr> {
        self.discovery.local_addr()
    }
}
