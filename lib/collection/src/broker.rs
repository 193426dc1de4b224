//! The message-queue client abstraction named in spec.md §1 and detailed in
//! §6.1. Only the interface is in scope; `ChannelBroker` is an in-memory
//! reference implementation used by tests and by single-process
//! deployments, backed by `tokio::sync::mpsc` in the idiom the teacher uses
//! for its own internal channels (`lib/collection/src/shards/local_shard.rs`
//! `update_sender`/`update_receiver`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use segment::{ChannelName, CollectionId, PartitionId, PrimaryKey, SegmentId, Timestamp};
use tokio::sync::mpsc;

use crate::errors::{CollectionError, CollectionResult};

#[derive(Debug, Clone)]
pub struct InsertMsg {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub segment_id: SegmentId,
    pub shard_name: ChannelName,
    pub row_ids: Vec<i64>,
    pub primary_keys: Vec<PrimaryKey>,
    pub timestamps: Vec<Timestamp>,
    pub fields: segment::InsertRecord,
}

#[derive(Debug, Clone)]
pub struct DeleteMsg {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub primary_keys: Vec<PrimaryKey>,
    pub timestamps: Vec<Timestamp>,
}

/// One message from the broker's consumer (spec.md §6.1); `Close` is the
/// sentinel a v-channel's unsubscription emits.
#[derive(Debug, Clone)]
pub enum StreamMsg {
    Insert(InsertMsg),
    Delete(DeleteMsg),
    TimeTick { timestamp: Timestamp },
    Close,
}

/// A batch pulled in one `Chan()` read (spec.md §6.1): begin/end timestamps
/// bound the batch, and per-message ordering within it is by begin-ts
/// ascending once sorted by `InsertNode` (spec.md §4.3 step 1).
#[derive(Debug, Clone, Default)]
pub struct MsgPack {
    pub begin_ts: Timestamp,
    pub end_ts: Timestamp,
    pub messages: Vec<StreamMsg>,
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn as_consumer(&self, channels: &[ChannelName], sub_name: &str) -> CollectionResult<()>;

    async fn as_consumer_with_latest(
        &self,
        channels: &[ChannelName],
        sub_name: &str,
    ) -> CollectionResult<()>;

    async fn seek(&self, positions: &[segment::ChannelPosition]) -> CollectionResult<()>;

    /// Pulls the next batch, or `None` once the channel has been closed and
    /// fully drained.
    async fn recv(&self, channel: &ChannelName) -> CollectionResult<Option<MsgPack>>;
}

/// In-memory broker: each channel is a bounded `mpsc` queue of `MsgPack`.
/// Publish is synchronous (used by tests to set up fixtures); `recv` awaits
/// the next pack, giving the natural back-pressure spec.md §4.3 requires
/// ("InputNode blocks on the broker when downstream cannot keep up").
pub struct ChannelBroker {
    queues: Mutex<HashMap<ChannelName, mpsc::Receiver<MsgPack>>>,
    senders: Mutex<HashMap<ChannelName, mpsc::Sender<MsgPack>>>,
    capacity: usize,
}

impl ChannelBroker {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(ChannelBroker {
            queues: Mutex::new(HashMap::new()),
            senders: Mutex::new(HashMap::new()),
            capacity,
        })
    }

    fn ensure_channel(&self, channel: &ChannelName) {
        let mut senders = self.senders.lock();
        if !senders.contains_key(channel) {
            let (tx, rx) = mpsc::channel(self.capacity);
            senders.insert(channel.clone(), tx);
            self.queues.lock().insert(channel.clone(), rx);
        }
    }

    pub async fn publish(&self, channel: &ChannelName, pack: MsgPack) -> CollectionResult<()> {
        self.ensure_channel(channel);
        let sender = self
            .senders
            .lock()
            .get(channel)
            .cloned()
            .ok_or_else(|| CollectionError::not_found(format!("channel {channel}")))?;
        sender
            .send(pack)
            .await
            .map_err(|_| CollectionError::ChannelClosed {
                channel: channel.clone(),
            })
    }

    pub async fn close(&self, channel: &ChannelName) {
        self.senders.lock().remove(channel);
    }
}

#[async_trait]
impl MessageBroker for ChannelBroker {
    async fn as_consumer(&self, channels: &[ChannelName], _sub_name: &str) -> CollectionResult<()> {
        for c in channels {
            self.ensure_channel(c);
        }
        Ok(())
    }

    async fn as_consumer_with_latest(
        &self,
        channels: &[ChannelName],
        _sub_name: &str,
    ) -> CollectionResult<()> {
        for c in channels {
            self.ensure_channel(c);
        }
        Ok(())
    }

    async fn seek(&self, _positions: &[segment::ChannelPosition]) -> CollectionResult<()> {
        // The in-memory reference broker has no persisted history to replay;
        // a real broker implementation seeks its subscription cursor here.
        Ok(())
    }

    async fn recv(&self, channel: &ChannelName) -> CollectionResult<Option<MsgPack>> {
        let mut receiver = {
            let mut queues = self.queues.lock();
            match queues.remove(channel) {
                Some(rx) => rx,
                None => return Err(CollectionError::not_found(format!("channel {channel}"))),
            }
        };
        let result = receiver.recv().await;
        self.queues.lock().insert(channel.clone(), receiver);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_recv_round_trips() {
        let broker = ChannelBroker::new(8);
        broker
            .as_consumer(&["c1".to_string()], "sub")
            .await
            .unwrap();
        broker
            .publish(
                &"c1".to_string(),
                MsgPack {
                    begin_ts: 1,
                    end_ts: 1,
                    messages: vec![StreamMsg::TimeTick { timestamp: 1 }],
                },
            )
            .await
            .unwrap();
        let pack = broker.recv(&"c1".to_string()).await.unwrap().unwrap();
        assert_eq!(pack.begin_ts, 1);
    }

    #[tokio::test]
    async fn close_then_recv_yields_none() {
        let broker = ChannelBroker::new(8);
        broker
            .as_consumer(&["c1".to_string()], "sub")
            .await
            .unwrap();
        broker.close(&"c1".to_string()).await;
        let pack = broker.recv(&"c1".to_string()).await.unwrap();
        assert!(pack.is_none());
    }
}
