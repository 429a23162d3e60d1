//! Typed events flowing from shards up to the library consumer.

use crate::error::ErrorKind;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// Shard identifier, `[0, shard_count)`.
pub type ShardId = u32;

/// An event emitted by one shard.
///
/// Events are delivered strictly in socket-receive order per shard. The
/// channel is unbounded so emission never exerts backpressure on the
/// read loop.
#[derive(Debug, Clone)]
pub enum ShardEvent {
    /// An application-level dispatch frame
    Dispatch {
        /// Event name (`t`)
        event: String,
        /// Event payload (`d`)
        data: Value,
    },
    /// A brand-new session was established
    Ready { data: Value },
    /// A previous session was re-attached
    Resumed {
        /// Dispatches replayed while resuming
        replayed: u64,
    },
    /// The server acknowledged a heartbeat
    HeartbeatAck { latency: Duration },
    /// The socket closed; recovery (if any) is already scheduled
    Closed { code: Option<u16> },
    /// A non-fatal error the shard recovered from (or is recovering from)
    Error { kind: ErrorKind, message: String },
}

/// Sender half used by shards.
pub type EventSender = mpsc::UnboundedSender<(ShardId, ShardEvent)>;

/// Receiver half handed to the consumer.
pub type EventReceiver = mpsc::UnboundedReceiver<(ShardId, ShardEvent)>;

/// Create the event channel shared by every shard of one manager.
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
