//! Per-shard resume state and its persistence contract.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resume state for one shard.
///
/// Created on the first READY dispatch; `sequence` only ever moves
/// forward. Cleared whenever a destroy's recovery mode is not `Resume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub sequence: u64,
    pub shard_id: u32,
    pub shard_count: u32,
    /// Endpoint to reconnect to when resuming, if the server gave one
    pub resume_url: Option<String>,
}

impl SessionInfo {
    /// Advance the sequence, discarding stale (non-increasing) values.
    ///
    /// Returns `true` if the sequence moved forward and should be
    /// persisted.
    pub fn advance(&mut self, sequence: u64) -> bool {
        if sequence > self.sequence {
            self.sequence = sequence;
            true
        } else {
            false
        }
    }
}

/// Persists resume state between connections (and, for distributed
/// strategies, between processes).
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Retrieve the stored session for a shard, if any.
    async fn retrieve(&self, shard_id: u32) -> Option<SessionInfo>;

    /// Store or clear (`None`) the session for a shard.
    async fn update(&self, shard_id: u32, info: Option<SessionInfo>);
}

/// Default store backed by process memory.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<u32, SessionInfo>>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn retrieve(&self, shard_id: u32) -> Option<SessionInfo> {
        self.sessions.read().get(&shard_id).cloned()
    }

    async fn update(&self, shard_id: u32, info: Option<SessionInfo>) {
        let mut sessions = self.sessions.write();
        match info {
            Some(info) => {
                sessions.insert(shard_id, info);
            }
            None => {
                sessions.remove(&shard_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(sequence: u64) -> SessionInfo {
        SessionInfo {
            session_id: "abc".into(),
            sequence,
            shard_id: 0,
            shard_count: 1,
            resume_url: None,
        }
    }

    #[test]
    fn test_sequence_advances_monotonically() {
        let mut info = session(5);
        assert!(info.advance(6));
        assert_eq!(info.sequence, 6);

        // Stale and duplicate writes are discarded
        assert!(!info.advance(6));
        assert!(!info.advance(3));
        assert_eq!(info.sequence, 6);
    }

    #[test]
    fn test_max_sequence_wins_regardless_of_order() {
        let mut info = session(0);
        for s in [3u64, 1, 7, 2, 7, 5] {
            info.advance(s);
        }
        assert_eq!(info.sequence, 7);
    }

    #[tokio::test]
    async fn test_in_memory_store_roundtrip() {
        let store = InMemorySessionStore::new();
        assert!(store.retrieve(0).await.is_none());

        store.update(0, Some(session(10))).await;
        assert_eq!(store.retrieve(0).await.unwrap().sequence, 10);

        // Shards are independent
        assert!(store.retrieve(1).await.is_none());

        store.update(0, None).await;
        assert!(store.retrieve(0).await.is_none());
    }
}
