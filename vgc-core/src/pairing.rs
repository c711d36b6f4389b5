//! Stream pairing: an accepting side sees the two streams of one peer arrive as independent
//! stream-open events in any order. Match them into one pair within a time window.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::link::ChannelKind;

/// Default window between the first and second stream of a peer.
pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(3);

struct Pending<S> {
    kind: ChannelKind,
    stream: S,
    opened_at: Instant,
}

/// Result of offering a stream to the pairing manager.
#[derive(Debug)]
pub enum PairingOutcome<S> {
    /// Cached as the first stream of its peer.
    Waiting,
    Paired { small: S, large: S },
    /// A second stream of the same kind arrived; it replaced the cached one, which is returned
    /// for the caller to close.
    Replaced { stale: S },
    /// The cached stream had timed out; it is returned and the new stream cached in its place.
    Expired { stale: S },
}

pub struct StreamPairingManager<K, S> {
    timeout: Duration,
    pending: HashMap<K, Pending<S>>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug, S> StreamPairingManager<K, S> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn on_stream_open(
        &mut self,
        key: K,
        kind: ChannelKind,
        stream: S,
        now: Instant,
    ) -> PairingOutcome<S> {
        let fresh = Pending {
            kind,
            stream,
            opened_at: now,
        };
        let Some(cached) = self.pending.remove(&key) else {
            debug!(peer = ?key, ?kind, "first stream cached");
            self.pending.insert(key, fresh);
            return PairingOutcome::Waiting;
        };
        if now.duration_since(cached.opened_at) >= self.timeout {
            debug!(peer = ?key, "cached stream expired before its pair arrived");
            self.pending.insert(key, fresh);
            return PairingOutcome::Expired {
                stale: cached.stream,
            };
        }
        if cached.kind == kind {
            warn!(peer = ?key, ?kind, "duplicate stream before pairing; keeping the newest");
            self.pending.insert(key, fresh);
            return PairingOutcome::Replaced {
                stale: cached.stream,
            };
        }
        debug!(peer = ?key, "streams paired");
        let (small, large) = match kind {
            ChannelKind::Small => (fresh.stream, cached.stream),
            ChannelKind::Large => (cached.stream, fresh.stream),
        };
        PairingOutcome::Paired { small, large }
    }

    /// Drop entries whose pair never arrived; returns them so the caller can close the streams.
    pub fn expire(&mut self, now: Instant) -> Vec<(K, S)> {
        let stale: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.opened_at) >= self.timeout)
            .map(|(k, _)| k.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|k| self.pending.remove(&k).map(|p| (k, p.stream)))
            .collect()
    }

    /// Drop the cached stream of one peer, e.g. because it closed before its pair arrived.
    pub fn remove(&mut self, key: &K) -> Option<S> {
        self.pending.remove(key).map(|p| p.stream)
    }

    /// Forget everything cached. Returns the streams so they can be closed.
    pub fn clear(&mut self) -> Vec<S> {
        self.pending.drain().map(|(_, p)| p.stream).collect()
    }
}
