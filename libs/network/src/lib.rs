//! Targetlink Network Manager
//!
//! Discovers remote engine instances ("targets") on other devices, opens and
//! maintains a control connection to each, multiplexes their textual logging
//! channels to a host callback, and keeps connections alive across transient
//! failures via a heartbeat/timeout/reconnect state machine.
//!
//! Layering, leaf-first: socket endpoint wrappers, per-target state and
//! heartbeat machine, the guarded target registry, the completion engine
//! moving bytes from sockets into targets, and the [`NetworkManager`] facade
//! the host drives.

pub mod engine;
pub mod error;
pub mod manager;
pub mod registry;
pub mod socket;
pub mod target;

// Re-export commonly used types
pub use engine::{CompletionEngine, TtyCallback, TtySink};
pub use error::{NetworkError, Result};
pub use manager::{NetworkConfig, NetworkManager};
pub use registry::TargetRegistry;
pub use socket::{TcpEndpoint, UdpEndpoint};
pub use target::{
    CrashReport, CrashSniffFilter, HeartbeatTiming, PassthroughFilter, Target, TargetHandle,
    TargetState, TtyEvent, TtyFilter,
};

// Re-export the codec surface consumers need for custom tooling
pub use targetlink_codec as codec;
