//! Completion Engine
//!
//! The only path by which bytes move from sockets into targets. Each
//! connected target gets one reader task that waits on its TCP stream,
//! appends whatever arrives to the target's partial buffer, drains complete
//! frames and dispatches them. Serializing all receive-side mutation through
//! that one task (under the target's lock) is what keeps heartbeat updates
//! and TTY dispatch for a target in arrival order.
//!
//! Reader tasks watch a shared shutdown signal between reads, so shutdown is
//! observable mid-wait and never leaks an outstanding receive.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use targetlink_codec::{drain, Message, MessageKind, Payload};

use crate::registry::TargetRegistry;
use crate::target::{Target, TargetHandle, TtyEvent};

/// Read size for one completion
pub const TCP_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Host-registered callback receiving decoded TTY lines. Invoked from
/// whichever reader task completed the frame, so it may run concurrently
/// across distinct targets.
pub type TtyCallback = Arc<dyn Fn(TtyEvent) + Send + Sync>;

/// Shared slot for the TTY callback; empty until the host registers one
#[derive(Default, Clone)]
pub struct TtySink {
    callback: Arc<RwLock<Option<TtyCallback>>>,
}

impl TtySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: TtyCallback) {
        *self.callback.write() = Some(callback);
    }

    pub fn emit(&self, event: TtyEvent) {
        let guard = self.callback.read();
        if let Some(callback) = guard.as_ref() {
            callback(event);
        }
    }
}

/// Owns the reader tasks and their shutdown signal
pub struct CompletionEngine {
    shutdown_tx: watch::Sender<bool>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl CompletionEngine {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the reader task for a freshly connected target.
    ///
    /// Zero bytes or a read error means the peer went away: the target is
    /// removed from the registry (closing its sockets) and the task exits.
    /// `session` ties the task to one connection; after a reconnect the
    /// stale reader must exit without touching the target's new session.
    pub fn attach(
        &self,
        handle: TargetHandle,
        session: u64,
        mut read_half: OwnedReadHalf,
        registry: Arc<TargetRegistry>,
        sink: TtySink,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; TCP_READ_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!(%handle, "Reader task stopping on shutdown signal");
                        break;
                    }
                    read = read_half.read(&mut buf) => match read {
                        Ok(0) => {
                            info!(%handle, "Peer closed logging stream, removing target");
                            remove_if_current(&registry, handle, session).await;
                            break;
                        }
                        Err(e) => {
                            warn!(%handle, error = %e, "Logging stream read failed, removing target");
                            remove_if_current(&registry, handle, session).await;
                            break;
                        }
                        Ok(n) => {
                            let Some(slot) = registry.get(handle) else {
                                debug!(%handle, "Target gone mid-receive, reader exiting");
                                break;
                            };
                            let mut target = slot.lock().await;
                            if target.session() != session {
                                debug!(%handle, "Connection superseded, reader exiting");
                                break;
                            }
                            ingest(handle, &mut target, &buf[..n], &sink);
                        }
                    }
                }
            }
            // The tokio read future is dropped with the task; nothing is
            // left armed on the socket.
        });
        self.readers.lock().push(task);
    }

    /// Signal every reader, then join them with a bounded timeout. Safe to
    /// call while readers are mid-wait; stragglers are aborted.
    pub async fn shutdown(&self, join_timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        let readers = std::mem::take(&mut *self.readers.lock());
        for mut task in readers {
            if tokio::time::timeout(join_timeout, &mut task).await.is_err() {
                warn!("Reader task missed the shutdown deadline, aborting");
                task.abort();
            }
        }
    }
}

impl Default for CompletionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove the target, but only if `session` is still its live connection;
/// a stale reader observing its own dead socket must not tear down a
/// target that has since reconnected.
async fn remove_if_current(registry: &TargetRegistry, handle: TargetHandle, session: u64) {
    let Some(slot) = registry.get(handle) else {
        return;
    };
    let mut target = slot.lock().await;
    if target.session() != session {
        return;
    }
    registry.remove(handle);
    target.close_endpoints();
}

/// Feed received stream bytes into a target: append to the partial buffer,
/// drain every complete frame, dispatch each in arrival order.
///
/// Ping replies refresh the heartbeat timestamp; transmissions go through
/// the target's TTY filter and out to the host callback tagged with the
/// channel name. An undecodable stream drops the whole buffer (already
/// desynchronized) and is logged as a protocol anomaly, never an abort.
pub fn ingest(handle: TargetHandle, target: &mut Target, bytes: &[u8], sink: &TtySink) {
    target.partial.extend(bytes);

    // Drain first, dispatch after: the drain closure may not touch the
    // target while the buffer is borrowed.
    let mut messages = Vec::new();
    let drained = drain(&mut target.partial, |message| messages.push(message));
    if let Err(e) = drained {
        warn!(%handle, error = %e, "Corrupt logging stream from target");
    }

    let now = Instant::now();
    for message in messages {
        dispatch(handle, target, message, now, sink);
    }
}

fn dispatch(
    handle: TargetHandle,
    target: &mut Target,
    message: Message,
    now: Instant,
    sink: &TtySink,
) {
    match (message.kind, message.payload) {
        (MessageKind::PingReply, _) => {
            target.note_ping_reply(now);
        }
        (MessageKind::Transmission, Payload::Text { channel, text }) => {
            for (channel, text) in target.filter.on_line(channel, &text) {
                sink.emit(TtyEvent {
                    handle,
                    channel: channel.name(),
                    text,
                });
            }
            if let Some(report) = target.filter.take_crash_report() {
                warn!(
                    %handle,
                    frames = report.lines.len(),
                    "Crash report captured from TTY stream"
                );
            }
        }
        (kind, _) => {
            // Control frames have no business on the logging stream
            warn!(%handle, ?kind, "Unexpected message kind on TCP stream, discarded");
        }
    }
}
