//! The remote lookup table.

use ahash::AHashMap;
use std::net::SocketAddr;

/// Identifies a remote for the lifetime of the gateway process.
pub type RemoteId = uuid::Uuid;

/// Maps remote ids to transport addresses.
///
/// Built before the gateway starts and immutable afterwards. The first
/// remote inserted fixes the default address used for every session's
/// initial dial; later inserts never change it.
#[derive(Debug, Default)]
pub struct RemoteRegistry {
    remotes: AHashMap<RemoteId, SocketAddr>,
    default: Option<SocketAddr>,
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `addr` under `id`.
    pub fn add_remote(&mut self, id: RemoteId, addr: SocketAddr) {
        if self.default.is_none() {
            self.default = Some(addr);
        }
        self.remotes.insert(id, addr);
    }

    pub fn lookup(&self, id: RemoteId) -> Option<SocketAddr> {
        self.remotes.get(&id).copied()
    }

    /// Address new sessions dial first; `None` until a remote is added.
    pub fn default_remote(&self) -> Option<SocketAddr> {
        self.default
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }
}
