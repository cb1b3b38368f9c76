//! Per-Target State and Heartbeat Machine
//!
//! One [`Target`] per distinct remote address: identity and metadata, both
//! socket endpoints, the TCP reassembly buffer, and the timestamps driving
//! the heartbeat/timeout/reconnect state machine.
//!
//! The heartbeat transition is a pure function of the injected `now` so the
//! tick logic is testable without sockets or real time; the manager executes
//! the returned action (send a ping, schedule or attempt a reconnect).

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use targetlink_codec::{Channel, ReassemblyBuffer};

use crate::socket::{TcpEndpoint, UdpEndpoint};

static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque, stable identifier for a registered target.
///
/// Handles are allocated from a process-wide counter and never reused while
/// the target is registered; external collaborators hold handles, never
/// references into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetHandle(pub(crate) u64);

impl TargetHandle {
    pub(crate) fn allocate() -> Self {
        Self(HANDLE_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TargetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target#{}", self.0)
    }
}

/// Externally visible connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Unconnected,
    Running,
}

/// Heartbeat machine timings, sourced from the manager config
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatTiming {
    /// Minimum gap between outgoing pings while connected
    pub ping_interval: Duration,
    /// Silence longer than this marks the connection dead
    pub ping_timeout: Duration,
    /// Wait before the next reconnect attempt
    pub reconnect_delay: Duration,
}

impl Default for HeartbeatTiming {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(4),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// What the manager must do for a target after one heartbeat evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    None,
    /// Connection healthy and the ping interval elapsed
    SendPing,
    /// Reply timeout exceeded; connection declared dead, reconnect scheduled
    ScheduleReconnect,
    /// Reconnect deadline reached; exactly one attempt is due
    AttemptReconnect,
}

/// A decoded TTY line surfaced to the host callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyEvent {
    pub handle: TargetHandle,
    /// Uppercase channel label (DEBUG/REMOTE/MEM/UNKNOWN)
    pub channel: &'static str,
    pub text: String,
}

/// Crash callstack captured out of the TTY stream by a sniffing filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub lines: Vec<String>,
}

/// Per-platform hook deciding what the host sees for each TTY line.
///
/// A strategy value, not a subclass: the variant is chosen when the target
/// is created. Platform variants use it to sniff crash dumps out of the
/// logging stream without surfacing every raw line.
pub trait TtyFilter: Send {
    /// Lines to surface for one decoded line; may be empty while the filter
    /// is swallowing a capture in progress.
    fn on_line(&mut self, channel: Channel, text: &str) -> Vec<(Channel, String)>;

    /// A finished crash capture, if the last line completed one
    fn take_crash_report(&mut self) -> Option<CrashReport> {
        None
    }
}

/// Default filter: every line goes through untouched
#[derive(Debug, Default)]
pub struct PassthroughFilter;

impl TtyFilter for PassthroughFilter {
    fn on_line(&mut self, channel: Channel, text: &str) -> Vec<(Channel, String)> {
        vec![(channel, text.to_owned())]
    }
}

/// Filter that captures the lines between a crash begin/end marker pair
/// instead of surfacing them, handing them out as a [`CrashReport`].
#[derive(Debug)]
pub struct CrashSniffFilter {
    begin_marker: &'static str,
    end_marker: &'static str,
    capturing: Option<Vec<String>>,
    finished: Option<CrashReport>,
}

impl CrashSniffFilter {
    pub fn new(begin_marker: &'static str, end_marker: &'static str) -> Self {
        Self {
            begin_marker,
            end_marker,
            capturing: None,
            finished: None,
        }
    }
}

impl TtyFilter for CrashSniffFilter {
    fn on_line(&mut self, channel: Channel, text: &str) -> Vec<(Channel, String)> {
        if self.capturing.is_some() {
            if text.contains(self.end_marker) {
                let lines = self.capturing.take().unwrap_or_default();
                self.finished = Some(CrashReport { lines });
            } else if let Some(lines) = self.capturing.as_mut() {
                lines.push(text.to_owned());
            }
            return Vec::new();
        }
        if text.contains(self.begin_marker) {
            self.capturing = Some(Vec::new());
            return Vec::new();
        }
        vec![(channel, text.to_owned())]
    }

    fn take_crash_report(&mut self) -> Option<CrashReport> {
        self.finished.take()
    }
}

/// State for one remote device
pub struct Target {
    pub(crate) handle: TargetHandle,
    /// UDP control address the device answered discovery from
    pub(crate) addr: SocketAddr,
    /// TCP port the device's logging stream listens on
    pub(crate) listen_port: u16,

    pub(crate) udp: Option<UdpEndpoint>,
    pub(crate) tcp: Option<TcpEndpoint>,

    pub(crate) connected: bool,
    pub(crate) ever_connected: bool,
    pub(crate) created_at: Instant,
    pub(crate) connected_at: Instant,
    pub(crate) last_ping_sent: Option<Instant>,
    pub(crate) last_ping_reply: Option<Instant>,
    pub(crate) reconnect_deadline: Option<Instant>,
    pub(crate) needs_reconnect: bool,
    /// Bumped whenever the connection turns over; a reader task from an
    /// older session must not act on the target
    session: u64,

    /// Bytes received off the TCP stream but not yet forming a frame
    pub(crate) partial: ReassemblyBuffer,
    pub(crate) filter: Box<dyn TtyFilter>,

    // Descriptive metadata from the discovery reply, no protocol effect
    pub(crate) computer_name: String,
    pub(crate) game_name: String,
    pub(crate) game_type: u8,
    pub(crate) platform_type: u8,
}

impl Target {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            handle: TargetHandle::allocate(),
            addr,
            listen_port: addr.port(),
            udp: None,
            tcp: None,
            connected: false,
            ever_connected: false,
            created_at: now,
            connected_at: now,
            last_ping_sent: None,
            last_ping_reply: None,
            reconnect_deadline: None,
            needs_reconnect: false,
            session: 0,
            partial: ReassemblyBuffer::new(),
            filter: Box::new(PassthroughFilter),
            computer_name: String::new(),
            game_name: String::new(),
            game_type: 0,
            platform_type: 0,
        }
    }

    pub fn handle(&self) -> TargetHandle {
        self.handle
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn state(&self) -> TargetState {
        if self.connected {
            TargetState::Running
        } else {
            TargetState::Unconnected
        }
    }

    /// Human-readable name for UI lists: computer name plus game when known,
    /// otherwise the raw address.
    pub fn display_name(&self) -> String {
        if self.computer_name.is_empty() {
            self.addr.to_string()
        } else if self.game_name.is_empty() {
            self.computer_name.clone()
        } else {
            format!("{} ({})", self.computer_name, self.game_name)
        }
    }

    /// Swap in a platform-specific TTY filter strategy
    pub fn set_filter(&mut self, filter: Box<dyn TtyFilter>) {
        self.filter = filter;
    }

    /// Any inbound ping-reply refreshes liveness, whatever the current state
    pub(crate) fn note_ping_reply(&mut self, now: Instant) {
        self.last_ping_reply = Some(now);
    }

    pub(crate) fn mark_connected(&mut self, now: Instant) {
        self.connected = true;
        self.ever_connected = true;
        self.connected_at = now;
        self.last_ping_reply = Some(now);
        self.last_ping_sent = None;
        self.needs_reconnect = false;
        self.reconnect_deadline = None;
    }

    /// Start a fresh connection session, invalidating any reader task still
    /// attached to the previous one. Returns the new session id.
    pub(crate) fn begin_session(&mut self) -> u64 {
        self.session = self.session.wrapping_add(1);
        self.session
    }

    pub(crate) fn session(&self) -> u64 {
        self.session
    }

    /// Close both endpoints; sockets are open iff connected or an attempt is
    /// in flight, so this accompanies every disconnect path.
    pub(crate) fn close_endpoints(&mut self) {
        self.udp = None;
        if let Some(tcp) = self.tcp.take() {
            // Dropping the write half sends the FIN; the reader task sees
            // the peer close and winds down on its own.
            drop(tcp);
        }
        self.session = self.session.wrapping_add(1);
        self.connected = false;
    }

    /// Evaluate one heartbeat step. Called once per tick per target.
    pub(crate) fn heartbeat(&mut self, now: Instant, timing: &HeartbeatTiming) -> HeartbeatAction {
        if self.needs_reconnect {
            match self.reconnect_deadline {
                Some(deadline) if now >= deadline => {
                    // Cleared before the attempt so a slow connect cannot be
                    // re-entered by the next tick.
                    self.reconnect_deadline = None;
                    HeartbeatAction::AttemptReconnect
                }
                _ => HeartbeatAction::None,
            }
        } else if self.connected {
            let reference = self.last_ping_reply.unwrap_or(self.connected_at);
            if now.duration_since(reference) > timing.ping_timeout {
                self.needs_reconnect = true;
                self.reconnect_deadline = Some(now + timing.reconnect_delay);
                return HeartbeatAction::ScheduleReconnect;
            }
            let ping_due = self
                .last_ping_sent
                .map_or(true, |sent| now.duration_since(sent) >= timing.ping_interval);
            if ping_due {
                self.last_ping_sent = Some(now);
                HeartbeatAction::SendPing
            } else {
                HeartbeatAction::None
            }
        } else {
            HeartbeatAction::None
        }
    }

    /// A reconnect attempt failed: back off until the next deadline. Socket
    /// create/bind/connect failures land here and nowhere else.
    pub(crate) fn reschedule_reconnect(&mut self, now: Instant, timing: &HeartbeatTiming) {
        self.needs_reconnect = true;
        self.reconnect_deadline = Some(now + timing.reconnect_delay);
    }

    /// Never-connected targets quietly expire after the inactivity window
    pub(crate) fn is_expired(&self, now: Instant, expiry: Duration) -> bool {
        !self.ever_connected && now.duration_since(self.created_at) > expiry
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("handle", &self.handle)
            .field("addr", &self.addr)
            .field("connected", &self.connected)
            .field("needs_reconnect", &self.needs_reconnect)
            .field("display_name", &self.display_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> HeartbeatTiming {
        HeartbeatTiming::default()
    }

    fn connected_target(now: Instant) -> Target {
        let mut target = Target::new("127.0.0.1:9000".parse().unwrap());
        target.mark_connected(now);
        target
    }

    #[test]
    fn healthy_target_pings_once_per_interval() {
        let start = Instant::now();
        let mut target = connected_target(start);

        assert_eq!(target.heartbeat(start, &timing()), HeartbeatAction::SendPing);
        // Interval not yet elapsed
        let soon = start + Duration::from_millis(300);
        assert_eq!(target.heartbeat(soon, &timing()), HeartbeatAction::None);
        let later = start + Duration::from_millis(1100);
        assert_eq!(target.heartbeat(later, &timing()), HeartbeatAction::SendPing);
    }

    #[test]
    fn timeout_schedules_reconnect_exactly_once() {
        let start = Instant::now();
        let mut target = connected_target(start);

        let silent = start + Duration::from_secs(5);
        assert_eq!(
            target.heartbeat(silent, &timing()),
            HeartbeatAction::ScheduleReconnect
        );
        assert!(target.needs_reconnect);
        let deadline = target.reconnect_deadline.expect("deadline scheduled");
        assert_eq!(deadline, silent + timing().reconnect_delay);

        // Before the deadline: no attempt
        let before = silent + Duration::from_secs(2);
        assert_eq!(target.heartbeat(before, &timing()), HeartbeatAction::None);

        // At the deadline: exactly one attempt, deadline cleared first
        assert_eq!(
            target.heartbeat(deadline, &timing()),
            HeartbeatAction::AttemptReconnect
        );
        assert!(target.reconnect_deadline.is_none());
        // No deadline pending any more, so no second attempt
        assert_eq!(
            target.heartbeat(deadline + Duration::from_millis(10), &timing()),
            HeartbeatAction::None
        );
    }

    #[test]
    fn failed_attempt_reschedules() {
        let start = Instant::now();
        let mut target = connected_target(start);
        let silent = start + Duration::from_secs(5);
        target.heartbeat(silent, &timing());
        let deadline = target.reconnect_deadline.unwrap();
        target.heartbeat(deadline, &timing());

        target.reschedule_reconnect(deadline, &timing());
        assert_eq!(
            target.reconnect_deadline,
            Some(deadline + timing().reconnect_delay)
        );
        assert_eq!(
            target.heartbeat(deadline + timing().reconnect_delay, &timing()),
            HeartbeatAction::AttemptReconnect
        );
    }

    #[test]
    fn ping_reply_resets_the_timeout_reference() {
        let start = Instant::now();
        let mut target = connected_target(start);
        let reply_at = start + Duration::from_secs(3);
        target.note_ping_reply(reply_at);

        // 5s after connect but only 2s after the reply: still healthy
        let check = start + Duration::from_secs(5);
        assert_ne!(
            target.heartbeat(check, &timing()),
            HeartbeatAction::ScheduleReconnect
        );
    }

    #[test]
    fn idle_target_never_heartbeats() {
        let start = Instant::now();
        let mut target = Target::new("127.0.0.1:9000".parse().unwrap());
        assert_eq!(
            target.heartbeat(start + Duration::from_secs(60), &timing()),
            HeartbeatAction::None
        );
    }

    #[test]
    fn never_connected_target_expires() {
        let start = Instant::now();
        let target = Target::new("127.0.0.1:9000".parse().unwrap());
        let expiry = Duration::from_secs(30);
        assert!(!target.is_expired(start + Duration::from_secs(29), expiry));
        assert!(target.is_expired(start + Duration::from_secs(31), expiry));

        let connected = connected_target(start);
        assert!(!connected.is_expired(start + Duration::from_secs(31), expiry));
    }

    #[test]
    fn handles_are_unique() {
        let a = Target::new("127.0.0.1:1".parse().unwrap());
        let b = Target::new("127.0.0.1:2".parse().unwrap());
        assert_ne!(a.handle(), b.handle());
    }

    #[test]
    fn crash_sniff_filter_captures_between_markers() {
        let mut filter = CrashSniffFilter::new("=== CRASH ===", "=== END CRASH ===");

        assert_eq!(
            filter.on_line(Channel::Debug, "normal line"),
            vec![(Channel::Debug, "normal line".to_owned())]
        );
        assert!(filter.on_line(Channel::Debug, "=== CRASH ===").is_empty());
        assert!(filter.on_line(Channel::Debug, "frame 0: Engine::Tick").is_empty());
        assert!(filter.on_line(Channel::Debug, "frame 1: main").is_empty());
        assert!(filter.take_crash_report().is_none());
        assert!(filter.on_line(Channel::Debug, "=== END CRASH ===").is_empty());

        let report = filter.take_crash_report().expect("capture finished");
        assert_eq!(
            report.lines,
            vec!["frame 0: Engine::Tick".to_owned(), "frame 1: main".to_owned()]
        );
        // Back to passthrough afterwards
        assert_eq!(
            filter.on_line(Channel::Remote, "after"),
            vec![(Channel::Remote, "after".to_owned())]
        );
    }
}
