//! Target Registry
//!
//! The single source of truth for which targets exist: a guarded map from
//! opaque handle to target, plus an address index enforcing the one-target-
//! per-remote-address invariant. The map's own lock is independent of the
//! per-target locks and is never held across a socket operation - lookups
//! clone the `Arc` out and release the map immediately.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::target::{Target, TargetHandle};

/// Shared per-target slot; all mutation of a target's state goes through
/// this lock (heartbeat fields from the tick path, receive state from the
/// target's reader task).
pub type TargetSlot = Arc<Mutex<Target>>;

#[derive(Default)]
struct Inner {
    targets: HashMap<TargetHandle, TargetSlot>,
    /// Remote address -> handle; addresses never change after registration
    by_addr: HashMap<SocketAddr, TargetHandle>,
}

/// Guarded handle -> target mapping
#[derive(Default)]
pub struct TargetRegistry {
    inner: RwLock<Inner>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target, returning its handle
    pub fn insert(&self, target: Target) -> TargetHandle {
        let handle = target.handle();
        let addr = target.addr();
        let mut inner = self.inner.write();
        inner.targets.insert(handle, Arc::new(Mutex::new(target)));
        inner.by_addr.insert(addr, handle);
        handle
    }

    pub fn get(&self, handle: TargetHandle) -> Option<TargetSlot> {
        self.inner.read().targets.get(&handle).cloned()
    }

    /// Remove an entry. The caller closes the target's sockets; the map
    /// lock must not be held while doing so.
    pub fn remove(&self, handle: TargetHandle) -> Option<TargetSlot> {
        let mut inner = self.inner.write();
        let slot = inner.targets.remove(&handle)?;
        inner.by_addr.retain(|_, h| *h != handle);
        Some(slot)
    }

    /// Resolve a remote address back to its handle
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<TargetHandle> {
        self.inner.read().by_addr.get(&addr).copied()
    }

    pub fn handles(&self) -> Vec<TargetHandle> {
        self.inner.read().targets.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().targets.is_empty()
    }

    /// Drop every entry, returning them so the caller can close sockets
    pub fn drain(&self) -> Vec<TargetSlot> {
        let mut inner = self.inner.write();
        inner.by_addr.clear();
        inner.targets.drain().map(|(_, slot)| slot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let registry = TargetRegistry::new();
        let addr: SocketAddr = "10.0.0.5:9000".parse().unwrap();
        let handle = registry.insert(Target::new(addr));

        assert_eq!(registry.len(), 1);
        assert!(registry.get(handle).is_some());
        assert_eq!(registry.find_by_addr(addr), Some(handle));

        let removed = registry.remove(handle);
        assert!(removed.is_some());
        assert!(registry.get(handle).is_none());
        assert_eq!(registry.find_by_addr(addr), None);
        assert!(registry.is_empty());
        // Removing twice is harmless
        assert!(registry.remove(handle).is_none());
    }

    #[test]
    fn find_by_addr_misses_unknown_addresses() {
        let registry = TargetRegistry::new();
        registry.insert(Target::new("10.0.0.5:9000".parse().unwrap()));
        assert_eq!(registry.find_by_addr("10.0.0.6:9000".parse().unwrap()), None);
    }

    #[test]
    fn drain_empties_both_maps() {
        let registry = TargetRegistry::new();
        let a = registry.insert(Target::new("10.0.0.1:9000".parse().unwrap()));
        registry.insert(Target::new("10.0.0.2:9000".parse().unwrap()));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.get(a).is_none());
        assert_eq!(registry.find_by_addr("10.0.0.1:9000".parse().unwrap()), None);
    }

    #[test]
    fn handles_lists_every_entry() {
        let registry = TargetRegistry::new();
        let a = registry.insert(Target::new("10.0.0.1:9000".parse().unwrap()));
        let b = registry.insert(Target::new("10.0.0.2:9000".parse().unwrap()));
        let mut handles = registry.handles();
        handles.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(handles, expected);
    }
}
