//! `FlowGraph` — the per-(collection, v-channel) ingest pipeline of
//! spec.md §4.3: `InputNode -> FilterNode -> InsertNode/DeleteNode ->
//! ServiceTimeNode`. Each node is realized as one `tokio::spawn`ed task
//! reading the previous stage's output; since the pipeline here runs
//! strictly in series per batch (spec.md §5 "nodes run cooperatively one
//! batch at a time"), a single task drives all stages in order rather than
//! wiring real inter-node channels — the important property, a bounded
//! queue in front of the broker consume, still holds via the broker's own
//! back-pressure (`ChannelBroker`'s bounded `mpsc`).

pub mod pipeline;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use segment::{ChannelName, CollectionId, PartitionId};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::{MessageBroker, StreamMsg};
use crate::errors::CollectionResult;
use crate::meta_replica::MetaReplica;
use crate::tsafe::TimestampWatcher;

/// Handle to a running flow graph. Dropping this without calling `close`
/// leaves the background task running (it is kept alive by its own `Arc`
/// clones); always call `close` during node Stop (spec.md §5).
pub struct FlowGraph {
    pub collection_id: CollectionId,
    pub channel: ChannelName,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Set when a fatal invariant violation tears the graph down
    /// (spec.md §7); the node that owns this `FlowGraph` should treat a
    /// poisoned graph as no longer serving its channel.
    poisoned: Arc<AtomicBool>,
}

struct RunState {
    meta: Arc<MetaReplica>,
    tsafe: Arc<TimestampWatcher>,
    broker: Arc<dyn MessageBroker>,
    collection_id: CollectionId,
    channel: ChannelName,
    watched_partitions: Arc<RwLock<HashSet<PartitionId>>>,
    poisoned: Arc<AtomicBool>,
}

impl FlowGraph {
    pub fn spawn(
        meta: Arc<MetaReplica>,
        tsafe: Arc<TimestampWatcher>,
        broker: Arc<dyn MessageBroker>,
        collection_id: CollectionId,
        channel: ChannelName,
        watched_partitions: Arc<RwLock<HashSet<PartitionId>>>,
    ) -> Arc<Self> {
        tsafe.add_tsafe(&channel);
        let (stop_tx, stop_rx) = watch::channel(false);
        let poisoned = Arc::new(AtomicBool::new(false));

        let state = RunState {
            meta,
            tsafe,
            broker,
            collection_id,
            channel: channel.clone(),
            watched_partitions,
            poisoned: poisoned.clone(),
        };

        let task = tokio::spawn(run_loop(state, stop_rx));

        Arc::new(FlowGraph {
            collection_id,
            channel,
            stop_tx,
            task: Mutex::new(Some(task)),
            poisoned,
        })
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Close semantics (spec.md §4.3): stop the input, drain in-flight
    /// batches, unregister the v-channel's tSafe entry (which wakes every
    /// watcher with a removal signal).
    pub async fn close(&self, tsafe: &TimestampWatcher) {
        let _ = self.stop_tx.send(true);
        let task = self.task.lock().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
        tsafe.remove_tsafe(&self.channel);
    }
}

async fn run_loop(state: RunState, mut stop_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            received = state.broker.recv(&state.channel) => {
                match received {
                    Ok(Some(pack)) => {
                        let closing = pack.messages.iter().any(|m| matches!(m, StreamMsg::Close));
                        if let Err(err) = process_batch(&state, pack) {
                            log::error!(
                                "flow graph for collection {} channel {} aborting: {err}",
                                state.collection_id, state.channel
                            );
                            state.poisoned.store(true, Ordering::SeqCst);
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        log::error!("broker recv failed on channel {}: {err}", state.channel);
                        break;
                    }
                }
            }
        }
    }
}

fn process_batch(state: &RunState, pack: crate::broker::MsgPack) -> CollectionResult<()> {
    let watched = state.watched_partitions.read().clone();

    let mut inserts = Vec::new();
    let mut deletes = Vec::new();
    for msg in &pack.messages {
        if !pipeline::filter_accepts(&state.meta, state.collection_id, &watched, msg) {
            continue;
        }
        match msg {
            StreamMsg::Insert(insert) => inserts.push(insert.clone()),
            StreamMsg::Delete(delete) => deletes.push(delete.clone()),
            StreamMsg::TimeTick { .. } | StreamMsg::Close => {}
        }
    }

    // InsertNode step 1 (spec.md §4.3): sort by begin-timestamp ascending.
    inserts.sort_by_key(|i| i.timestamps.iter().copied().min().unwrap_or(0));

    for insert in &inserts {
        match pipeline::apply_insert(&state.meta, &state.channel, insert) {
            Ok(true) => {}
            Ok(false) => {
                log::warn!(
                    "skipping insert into unhealthy segment {} (collection {})",
                    insert.segment_id, insert.collection_id
                );
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                log::warn!(
                    "skipping insert into segment {} after recoverable error: {err}",
                    insert.segment_id
                );
            }
        }
    }

    for delete in &deletes {
        match pipeline::apply_delete(&state.meta, &state.channel, delete) {
            Ok(_) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                log::warn!(
                    "skipping delete in partition {} after recoverable error: {err}",
                    delete.partition_id
                );
            }
        }
    }

    // ServiceTimeNode (spec.md §4.3 node 5): the only updater of tSafe.
    if pack.end_ts > 0 {
        pipeline::advance_service_time(&state.tsafe, &state.channel, pack.end_ts)?;
    }

    Ok(())
}

/// Convenience used by node Init to build the watched-partitions set a
/// FilterNode consults (spec.md §4.3 node 2).
pub fn new_watched_partitions() -> Arc<RwLock<HashSet<PartitionId>>> {
    Arc::new(RwLock::new(HashSet::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ChannelBroker, DeleteMsg, InsertMsg, MsgPack};
    use crate::meta_replica::{Collection, MetaReplica};
    use segment::{CollectionSchema, FieldColumn, InsertRecord, LoadType, PrimaryKey};
    use std::collections::BTreeMap;

    fn insert_msg(segment_id: i64, ids: Vec<i64>, ts: Vec<u64>) -> InsertMsg {
        let mut columns = BTreeMap::new();
        columns.insert(
            0,
            FieldColumn::Vector(ids.iter().map(|i| vec![*i as f32, 0.0]).collect()),
        );
        InsertMsg {
            collection_id: 1,
            partition_id: 10,
            segment_id,
            shard_name: "dml_1_1_v0".to_string(),
            row_ids: ids.clone(),
            primary_keys: ids.into_iter().map(PrimaryKey::Int64).collect(),
            timestamps: ts,
            fields: InsertRecord { columns },
        }
    }

    #[tokio::test]
    async fn streaming_insert_then_tsafe_advances() {
        let meta = Arc::new(MetaReplica::new());
        meta.add_collection(Collection::new(1, CollectionSchema::default(), LoadType::Collection));
        let tsafe = Arc::new(TimestampWatcher::new());
        let broker = ChannelBroker::new(8);
        let channel = "dml_1_1_v0".to_string();

        let graph = FlowGraph::spawn(
            meta.clone(),
            tsafe.clone(),
            broker.clone(),
            1,
            channel.clone(),
            new_watched_partitions(),
        );

        broker
            .publish(
                &channel,
                MsgPack {
                    begin_ts: 5,
                    end_ts: 7,
                    messages: vec![StreamMsg::Insert(insert_msg(100, vec![1, 2, 3], vec![5, 6, 7]))],
                },
            )
            .await
            .unwrap();

        // wait for tsafe to reach 7
        for _ in 0..100 {
            if tsafe.get_tsafe(&channel).unwrap_or(0) >= 7 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(tsafe.get_tsafe(&channel).unwrap(), 7);

        let segment = meta
            .get_segment_by_id(100, segment::SegmentType::Growing)
            .unwrap();
        assert_eq!(segment.num_rows(), 3);

        graph.close(&tsafe).await;
        assert!(tsafe.get_tsafe(&channel).is_err());
    }

    #[tokio::test]
    async fn delete_prefilter_skips_absent_pk() {
        let meta = Arc::new(MetaReplica::new());
        meta.add_collection(Collection::new(1, CollectionSchema::default(), LoadType::Collection));
        let tsafe = Arc::new(TimestampWatcher::new());
        let broker = ChannelBroker::new(8);
        let channel = "dml_1_1_v0".to_string();

        let graph = FlowGraph::spawn(
            meta.clone(),
            tsafe.clone(),
            broker.clone(),
            1,
            channel.clone(),
            new_watched_partitions(),
        );

        broker
            .publish(
                &channel,
                MsgPack {
                    begin_ts: 5,
                    end_ts: 7,
                    messages: vec![StreamMsg::Insert(insert_msg(100, vec![11, 22, 33], vec![5, 6, 7]))],
                },
            )
            .await
            .unwrap();
        for _ in 0..100 {
            if tsafe.get_tsafe(&channel).unwrap_or(0) >= 7 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        broker
            .publish(
                &channel,
                MsgPack {
                    begin_ts: 8,
                    end_ts: 8,
                    messages: vec![StreamMsg::Delete(DeleteMsg {
                        collection_id: 1,
                        partition_id: 10,
                        primary_keys: vec![PrimaryKey::Int64(44)],
                        timestamps: vec![8],
                    })],
                },
            )
            .await
            .unwrap();
        for _ in 0..100 {
            if tsafe.get_tsafe(&channel).unwrap_or(0) >= 8 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let segment = meta
            .get_segment_by_id(100, segment::SegmentType::Growing)
            .unwrap();
        // pk=44 was never inserted, so segmentDelete must have been a no-op
        // (bloom filter rejects it); all 3 original rows remain.
        assert_eq!(segment.num_rows(), 3);

        graph.close(&tsafe).await;
    }
}
