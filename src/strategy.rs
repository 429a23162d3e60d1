//! Pluggable shard placement and fan-out.

use crate::error::Error;
use crate::manager::GatewayContext;
use crate::protocol::GatewayMessage;
use crate::shard::{DestroyOptions, ShardCommand, ShardStatus, WebSocketShard};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

/// Decides where shards live and fans manager operations out to them.
///
/// The default [`SimpleShardingStrategy`] runs every shard as a task in
/// the current process; alternative implementations may place shards in
/// worker threads or other processes, as long as each operation reaches
/// the owning shard.
#[async_trait]
pub trait ShardingStrategy: Send + Sync {
    /// Tear down any current fleet and create (but do not connect) one
    /// shard per id.
    async fn spawn(&self, shard_ids: &[u32]) -> Result<(), Error>;

    /// Connect every spawned shard, in order, honoring identify pacing.
    async fn connect(&self) -> Result<(), Error>;

    /// Destroy every spawned shard.
    async fn destroy(&self, options: DestroyOptions) -> Result<(), Error>;

    /// Route a payload to the shard owning `shard_id`.
    async fn send(&self, shard_id: u32, message: GatewayMessage) -> Result<(), Error>;

    /// Snapshot the status of every spawned shard.
    async fn fetch_status(&self) -> Result<HashMap<u32, ShardStatus>, Error>;
}

struct ShardHandle {
    commands: mpsc::UnboundedSender<ShardCommand>,
    task: tokio::task::JoinHandle<()>,
}

/// Default strategy: one tokio task per shard in this process.
pub struct SimpleShardingStrategy {
    ctx: Arc<GatewayContext>,
    shards: Mutex<HashMap<u32, ShardHandle>>,
}

impl SimpleShardingStrategy {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self {
            ctx,
            shards: Mutex::new(HashMap::new()),
        }
    }

    async fn destroy_fleet(
        shards: &mut HashMap<u32, ShardHandle>,
        options: DestroyOptions,
    ) -> Result<(), Error> {
        let terminal = options.recover.is_none();
        let mut acks = Vec::with_capacity(shards.len());

        for (id, handle) in shards.iter() {
            let (done_tx, done_rx) = oneshot::channel();
            handle
                .commands
                .send(ShardCommand::Destroy {
                    options: options.clone(),
                    done: done_tx,
                })
                .map_err(|_| Error::ChannelSend(format!("shard {id} task is gone")))?;
            acks.push(done_rx);
        }

        for ack in acks {
            // A dropped ack means the task already exited; that is fine
            let _ = ack.await;
        }

        if terminal {
            for (id, handle) in shards.drain() {
                // Dropping the sender lets the task run down cleanly
                drop(handle.commands);
                if handle.task.await.is_err() {
                    debug!("[SHARD-{}] Task panicked during shutdown", id);
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ShardingStrategy for SimpleShardingStrategy {
    async fn spawn(&self, shard_ids: &[u32]) -> Result<(), Error> {
        let mut shards = self.shards.lock().await;

        if !shards.is_empty() {
            Self::destroy_fleet(&mut shards, DestroyOptions::default()).await?;
        }

        info!("Spawning {} shard(s): {:?}", shard_ids.len(), shard_ids);
        for &id in shard_ids {
            let (tx, rx) = mpsc::unbounded_channel();
            let shard = WebSocketShard::new(id, Arc::clone(&self.ctx));
            let task = tokio::spawn(shard.run(rx));
            shards.insert(id, ShardHandle { commands: tx, task });
        }

        Ok(())
    }

    async fn connect(&self) -> Result<(), Error> {
        let shards = self.shards.lock().await;

        // Sequential on purpose: the identify throttler paces the fleet,
        // and a fatal failure on one shard should stop the rest.
        let mut ids: Vec<u32> = shards.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            let handle = shards.get(&id).ok_or(Error::UnknownShard { id })?;
            let (reply_tx, reply_rx) = oneshot::channel();
            handle
                .commands
                .send(ShardCommand::Connect(reply_tx))
                .map_err(|_| Error::ChannelSend(format!("shard {id} task is gone")))?;
            reply_rx
                .await
                .map_err(|_| Error::ChannelSend(format!("shard {id} dropped connect reply")))??;
        }

        Ok(())
    }

    async fn destroy(&self, options: DestroyOptions) -> Result<(), Error> {
        let mut shards = self.shards.lock().await;
        Self::destroy_fleet(&mut shards, options).await
    }

    async fn send(&self, shard_id: u32, message: GatewayMessage) -> Result<(), Error> {
        let shards = self.shards.lock().await;
        let handle = shards
            .get(&shard_id)
            .ok_or(Error::UnknownShard { id: shard_id })?;
        handle
            .commands
            .send(ShardCommand::Send(message))
            .map_err(|_| Error::ChannelSend(format!("shard {shard_id} task is gone")))
    }

    async fn fetch_status(&self) -> Result<HashMap<u32, ShardStatus>, Error> {
        let shards = self.shards.lock().await;
        let mut statuses = HashMap::with_capacity(shards.len());

        for (&id, handle) in shards.iter() {
            let (reply_tx, reply_rx) = oneshot::channel();
            handle
                .commands
                .send(ShardCommand::Status(reply_tx))
                .map_err(|_| Error::ChannelSend(format!("shard {id} task is gone")))?;
            let status = reply_rx
                .await
                .map_err(|_| Error::ChannelSend(format!("shard {id} dropped status reply")))?;
            statuses.insert(id, status);
        }

        Ok(statuses)
    }
}
