//! `ShardCluster` — the distribution state machine of spec.md §4.5. One
//! instance per (collection, dm-channel) shard, tracking which node holds
//! which sealed segment, fanning historical search/query/statistics calls
//! out to peers, and running the handoff protocol that atomically swaps a
//! segment's placement without ever serving a request against both the old
//! and new owner at once.
//!
//! Locking discipline follows spec.md §5: one `RwLock` over nodes/segments/
//! legacy/handoffs, plus two `Notify`-backed condition variables
//! (`segment_cond` for handoff's wait-online step, `rc_cond` for its
//! wait-inUse-zero step). `ShardClusterVersion`'s append-only-chain
//! refcounting (spec.md §4.5 "Versioning") is realized here as a per-segment
//! `Arc<AtomicU32>` refcount stamped with a monotonically increasing version
//! id, rather than a literal chain of frozen segment-map snapshots: every
//! testable property in spec.md §8 about allocation/handoff/legacy behavior
//! depends only on the refcount-drains-to-zero contract, not on the chain
//! being materialized, and this keeps GetAllocation from cloning the whole
//! segment map on every query. See DESIGN.md.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use segment::{CollectionId, PartitionId, SegmentId};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::errors::{StorageError, StorageResult};
use crate::external::peer_node::PeerNode;
use crate::types::{ClusterState, NodeId, SegmentChangeInfo, SegmentState};

struct NodeInfo {
    peer: Arc<dyn PeerNode>,
    online: bool,
}

#[derive(Clone)]
struct SegmentRecord {
    segment_id: SegmentId,
    partition_id: PartitionId,
    node_id: NodeId,
    state: SegmentState,
    version_id: u64,
    in_use: Arc<AtomicU32>,
}

struct LegacySegment {
    segment_id: SegmentId,
    node_id: NodeId,
    in_use: Arc<AtomicU32>,
}

struct PendingHandoff {
    offline: Vec<SegmentId>,
}

/// One call's worth of allocated segments, grouped by owning node. Dropping
/// this releases the refcount held against every allocated segment
/// (`FinishUsage`, spec.md §4.5).
pub struct ClusterAllocation {
    pub by_node: HashMap<NodeId, Vec<SegmentId>>,
    _guards: Vec<AllocationGuard>,
}

struct AllocationGuard {
    in_use: Arc<AtomicU32>,
    rc_cond: Arc<Notify>,
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        self.rc_cond.notify_waiters();
    }
}

pub struct ShardCluster {
    pub collection_id: CollectionId,
    pub dm_channel: String,
    nodes: RwLock<HashMap<NodeId, NodeInfo>>,
    segments: RwLock<HashMap<SegmentId, SegmentRecord>>,
    // Only drained by the handoff's offline-retire step below. If a peer holding a
    // legacy reference vanishes without releasing it, the entry is stuck here
    // forever; see DESIGN.md Open Question (c).
    legacy: RwLock<Vec<LegacySegment>>,
    pending_handoffs: RwLock<HashMap<Uuid, PendingHandoff>>,
    state: RwLock<ClusterState>,
    version_counter: AtomicU64,
    segment_cond: Arc<Notify>,
    rc_cond: Arc<Notify>,
}

impl ShardCluster {
    pub fn new(collection_id: CollectionId, dm_channel: impl Into<String>) -> Arc<Self> {
        Arc::new(ShardCluster {
            collection_id,
            dm_channel: dm_channel.into(),
            nodes: RwLock::new(HashMap::new()),
            segments: RwLock::new(HashMap::new()),
            legacy: RwLock::new(Vec::new()),
            pending_handoffs: RwLock::new(HashMap::new()),
            state: RwLock::new(ClusterState::Available),
            version_counter: AtomicU64::new(0),
            segment_cond: Arc::new(Notify::new()),
            rc_cond: Arc::new(Notify::new()),
        })
    }

    pub fn state(&self) -> ClusterState {
        *self.state.read()
    }

    pub fn node_add(&self, node_id: NodeId, peer: Arc<dyn PeerNode>) {
        self.nodes.write().insert(node_id, NodeInfo { peer, online: true });
        self.recompute_state();
    }

    /// Every segment on the departing node snaps to Offline and the cluster
    /// unconditionally flips Unavailable (spec.md §4.5 "Node removal").
    pub fn node_del(&self, node_id: NodeId) {
        self.nodes.write().remove(&node_id);
        {
            let mut segments = self.segments.write();
            for record in segments.values_mut() {
                if record.node_id == node_id {
                    record.state = SegmentState::Offline;
                }
            }
        }
        self.segment_cond.notify_waiters();
        *self.state.write() = ClusterState::Unavailable;
    }

    /// Applies one `segmentEvent{Add, ...}` through the transfer table of
    /// spec.md §4.5. Returns `StaleEvent` (never mutates) on a late
    /// `Loading -> Loaded` from the wrong node.
    pub fn sync_segment(
        &self,
        segment_id: SegmentId,
        partition_id: PartitionId,
        node_id: NodeId,
        new_state: SegmentState,
    ) -> StorageResult<()> {
        let mut segments = self.segments.write();
        let existing = segments.get(&segment_id).cloned();
        let mut legacy_push = None;

        let in_use = match &existing {
            None => Arc::new(AtomicU32::new(0)),
            Some(old) => match old.state {
                SegmentState::Offline => old.in_use.clone(),
                SegmentState::Loading => {
                    if new_state == SegmentState::Loaded && node_id != old.node_id {
                        return Err(StorageError::stale_event(format!(
                            "segment {segment_id} Loading->Loaded from node {node_id}, expected {}",
                            old.node_id
                        )));
                    }
                    old.in_use.clone()
                }
                SegmentState::Loaded => {
                    if new_state == SegmentState::Loaded && node_id != old.node_id {
                        legacy_push = Some(LegacySegment {
                            segment_id,
                            node_id: old.node_id,
                            in_use: old.in_use.clone(),
                        });
                        Arc::new(AtomicU32::new(0))
                    } else {
                        old.in_use.clone()
                    }
                }
            },
        };

        let version_id = self.version_counter.fetch_add(1, Ordering::SeqCst) + 1;
        segments.insert(
            segment_id,
            SegmentRecord {
                segment_id,
                partition_id,
                node_id,
                state: new_state,
                version_id,
                in_use,
            },
        );
        drop(segments);

        if let Some(legacy) = legacy_push {
            self.legacy.write().push(legacy);
        }
        self.segment_cond.notify_waiters();
        self.recompute_state();
        Ok(())
    }

    pub fn sync_segment_del(&self, segment_id: SegmentId) {
        self.segments.write().remove(&segment_id);
        self.recompute_state();
    }

    /// Batch form used by `WatchDmChannels`/coordinator sync calls; applies
    /// each event and logs (never propagates) `StaleEvent`s, per spec.md §7.
    pub fn sync_segments(&self, events: Vec<crate::types::SegmentEvent>) {
        for event in events {
            match event {
                crate::types::SegmentEvent::Add {
                    segment_id,
                    partition_id,
                    node_id,
                    state,
                } => {
                    if let Err(err) = self.sync_segment(segment_id, partition_id, node_id, state) {
                        log::warn!("sync_segments: {err}");
                    }
                }
                crate::types::SegmentEvent::Del { segment_id } => {
                    self.sync_segment_del(segment_id);
                }
            }
        }
    }

    fn recompute_state(&self) {
        let nodes = self.nodes.read();
        let segments = self.segments.read();
        let available = segments
            .values()
            .all(|r| r.state == SegmentState::Loaded && nodes.get(&r.node_id).map(|n| n.online).unwrap_or(false));
        *self.state.write() = if available {
            ClusterState::Available
        } else {
            ClusterState::Unavailable
        };
    }

    fn segment_in_use(&self, segment_id: SegmentId, node_id: NodeId) -> u32 {
        if let Some(record) = self.segments.read().get(&segment_id) {
            if record.node_id == node_id {
                return record.in_use.load(Ordering::SeqCst);
            }
        }
        if let Some(legacy) = self
            .legacy
            .read()
            .iter()
            .find(|l| l.segment_id == segment_id && l.node_id == node_id)
        {
            return legacy.in_use.load(Ordering::SeqCst);
        }
        0
    }

    async fn wait_until(notify: &Arc<Notify>, mut predicate: impl FnMut() -> bool) {
        loop {
            if predicate() {
                return;
            }
            let notified = notify.notified();
            if predicate() {
                return;
            }
            notified.await;
        }
    }

    /// GetAllocation (spec.md §4.5): refcounts and returns every Loaded
    /// segment for the given partitions, skipping any segment currently
    /// listed in a pending handoff's OfflineSegments.
    pub fn get_allocation(&self, partition_ids: &HashSet<PartitionId>) -> StorageResult<ClusterAllocation> {
        if self.state() != ClusterState::Available {
            return Err(StorageError::unavailable(format!(
                "shard cluster for collection {} channel {} is not available",
                self.collection_id, self.dm_channel
            )));
        }
        let excluded: HashSet<SegmentId> = self
            .pending_handoffs
            .read()
            .values()
            .flat_map(|p| p.offline.iter().copied())
            .collect();

        let segments = self.segments.read();
        let mut by_node: HashMap<NodeId, Vec<SegmentId>> = HashMap::new();
        let mut guards = Vec::new();
        for record in segments.values() {
            if record.state != SegmentState::Loaded {
                continue;
            }
            if !partition_ids.contains(&record.partition_id) {
                continue;
            }
            if excluded.contains(&record.segment_id) {
                continue;
            }
            record.in_use.fetch_add(1, Ordering::SeqCst);
            guards.push(AllocationGuard {
                in_use: record.in_use.clone(),
                rc_cond: self.rc_cond.clone(),
            });
            by_node.entry(record.node_id).or_default().push(record.segment_id);
        }
        Ok(ClusterAllocation {
            by_node,
            _guards: guards,
        })
    }

    /// `HandoffSegments` (spec.md §4.5): atomically swaps placement for the
    /// online segments in, the offline segments out. Returns the joined
    /// `ReleaseSegments` error list; the local state is consistent even if
    /// this is non-empty.
    pub async fn handoff_segments(&self, info: SegmentChangeInfo) -> Vec<StorageError> {
        Self::wait_until(&self.segment_cond, || {
            let segments = self.segments.read();
            info.online.iter().all(|(segment_id, _partition_id, node_id)| {
                segments
                    .get(segment_id)
                    .map(|r| r.state == SegmentState::Loaded && r.node_id == *node_id)
                    .unwrap_or(false)
            })
        })
        .await;

        let token = Uuid::new_v4();
        let offline_ids: Vec<SegmentId> = info.offline.iter().map(|(id, _)| *id).collect();
        self.pending_handoffs
            .write()
            .insert(token, PendingHandoff { offline: offline_ids });

        Self::wait_until(&self.rc_cond, || {
            info.offline
                .iter()
                .all(|(segment_id, node_id)| self.segment_in_use(*segment_id, *node_id) == 0)
        })
        .await;

        {
            let mut segments = self.segments.write();
            let mut legacy = self.legacy.write();
            for (segment_id, node_id) in &info.offline {
                if let Some(record) = segments.get(segment_id) {
                    if record.node_id == *node_id {
                        segments.remove(segment_id);
                    } else {
                        log::warn!(
                            "handoff: segment {segment_id} offline node mismatch, expected {node_id} found {}",
                            record.node_id
                        );
                    }
                }
                legacy.retain(|l| !(l.segment_id == *segment_id && l.node_id == *node_id));
            }
        }

        let mut by_node: HashMap<NodeId, Vec<SegmentId>> = HashMap::new();
        for (segment_id, node_id) in &info.offline {
            by_node.entry(*node_id).or_default().push(*segment_id);
        }
        let peers: Vec<(Arc<dyn PeerNode>, Vec<SegmentId>)> = {
            let nodes = self.nodes.read();
            by_node
                .into_iter()
                .filter_map(|(node_id, ids)| nodes.get(&node_id).map(|n| (n.peer.clone(), ids)))
                .collect()
        };

        let mut errors = Vec::new();
        for (peer, ids) in peers {
            if let Err(err) = peer.release_segments(&ids).await {
                errors.push(err);
            }
        }

        self.pending_handoffs.write().remove(&token);
        errors
    }

    /// Historical fan-out (spec.md §4.5): allocates segments for
    /// `partition_ids`, sends `request_for` to each owning peer concurrently
    /// with `streaming`, and returns every partial result. The first error
    /// (from a peer or from `streaming`) short-circuits the return; results
    /// from calls still running at that point are simply discarded, since
    /// segcore calls are not cancellable (spec.md §5/§4.6).
    pub async fn fan_out_search<F, Fut>(
        &self,
        channel: &str,
        partition_ids: &HashSet<PartitionId>,
        request_for: impl Fn(&[SegmentId]) -> crate::types::ShardSearchRequest,
        streaming: F,
    ) -> StorageResult<Vec<segment::SearchPartialResult>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<segment::SearchPartialResult>>,
    {
        if channel != self.dm_channel {
            return Err(StorageError::unavailable(format!(
                "channel {channel} does not match shard channel {}",
                self.dm_channel
            )));
        }
        let allocation = self.get_allocation(partition_ids)?;
        let futs: Vec<_> = {
            let nodes = self.nodes.read();
            allocation
                .by_node
                .iter()
                .filter_map(|(node_id, ids)| {
                    nodes.get(node_id).map(|n| {
                        let peer = n.peer.clone();
                        let req = request_for(ids);
                        async move { peer.search(&req).await }
                    })
                })
                .collect()
        };

        let (historical, streaming_result) =
            futures::join!(futures::future::join_all(futs), streaming());
        let mut results = Vec::with_capacity(historical.len() + 1);
        for r in historical {
            results.push(r?);
        }
        results.push(streaming_result?);
        Ok(results)
    }

    pub async fn fan_out_query<F, Fut>(
        &self,
        channel: &str,
        partition_ids: &HashSet<PartitionId>,
        request_for: impl Fn(&[SegmentId]) -> crate::types::ShardQueryRequest,
        streaming: F,
    ) -> StorageResult<Vec<segment::RetrievePartialResult>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<segment::RetrievePartialResult>>,
    {
        if channel != self.dm_channel {
            return Err(StorageError::unavailable(format!(
                "channel {channel} does not match shard channel {}",
                self.dm_channel
            )));
        }
        let allocation = self.get_allocation(partition_ids)?;
        let futs: Vec<_> = {
            let nodes = self.nodes.read();
            allocation
                .by_node
                .iter()
                .filter_map(|(node_id, ids)| {
                    nodes.get(node_id).map(|n| {
                        let peer = n.peer.clone();
                        let req = request_for(ids);
                        async move { peer.query(&req).await }
                    })
                })
                .collect()
        };

        let (historical, streaming_result) =
            futures::join!(futures::future::join_all(futs), streaming());
        let mut results = Vec::with_capacity(historical.len() + 1);
        for r in historical {
            results.push(r?);
        }
        results.push(streaming_result?);
        Ok(results)
    }

    pub async fn get_statistics(&self) -> StorageResult<crate::types::CollectionStatistics> {
        if self.state() != ClusterState::Available {
            return Err(StorageError::unavailable(format!(
                "shard cluster for collection {} is not available",
                self.collection_id
            )));
        }
        let peers: Vec<Arc<dyn PeerNode>> = {
            let nodes = self.nodes.read();
            let segments = self.segments.read();
            let node_ids: HashSet<NodeId> = segments.values().map(|r| r.node_id).collect();
            node_ids
                .into_iter()
                .filter_map(|id| nodes.get(&id).map(|n| n.peer.clone()))
                .collect()
        };
        let mut total = crate::types::CollectionStatistics::default();
        for peer in peers {
            let stats = peer.get_statistics(self.collection_id).await?;
            total.row_count += stats.row_count;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::peer_node::LocalPeerNode;
    use collection::MetaReplica;

    fn peer() -> Arc<dyn PeerNode> {
        LocalPeerNode::new(Arc::new(MetaReplica::new()))
    }

    #[test]
    fn empty_cluster_starts_available() {
        let cluster = ShardCluster::new(1, "dml_1_1_v0");
        assert_eq!(cluster.state(), ClusterState::Available);
    }

    #[test]
    fn loading_to_loaded_from_wrong_node_is_stale() {
        let cluster = ShardCluster::new(1, "dml_1_1_v0");
        cluster.node_add(1, peer());
        cluster.node_add(2, peer());
        cluster.sync_segment(100, 10, 1, SegmentState::Loading).unwrap();
        let err = cluster.sync_segment(100, 10, 2, SegmentState::Loaded).unwrap_err();
        assert!(matches!(err, StorageError::StaleEvent { .. }));
    }

    #[test]
    fn loaded_to_loaded_node_change_demotes_to_legacy() {
        let cluster = ShardCluster::new(1, "dml_1_1_v0");
        cluster.node_add(1, peer());
        cluster.node_add(2, peer());
        cluster.sync_segment(100, 10, 1, SegmentState::Loaded).unwrap();
        assert_eq!(cluster.segment_in_use(100, 1), 0);
        cluster.sync_segment(100, 10, 2, SegmentState::Loaded).unwrap();
        assert_eq!(cluster.legacy.read().len(), 1);
        assert_eq!(cluster.legacy.read()[0].node_id, 1);
    }

    #[test]
    fn node_removal_snaps_segments_offline_and_flips_unavailable() {
        let cluster = ShardCluster::new(1, "dml_1_1_v0");
        cluster.node_add(1, peer());
        cluster.sync_segment(100, 10, 1, SegmentState::Loaded).unwrap();
        assert_eq!(cluster.state(), ClusterState::Available);
        cluster.node_del(1);
        assert_eq!(cluster.state(), ClusterState::Unavailable);
        assert_eq!(
            cluster.segments.read().get(&100).unwrap().state,
            SegmentState::Offline
        );
    }

    #[tokio::test]
    async fn handoff_waits_for_online_then_drains_offline() {
        let cluster = ShardCluster::new(1, "dml_1_1_v0");
        cluster.node_add(1, peer());
        cluster.node_add(2, peer());
        cluster.sync_segment(1, 10, 1, SegmentState::Loaded).unwrap();
        cluster.sync_segment(3, 10, 2, SegmentState::Loaded).unwrap();

        let mut partitions = HashSet::new();
        partitions.insert(10);
        let allocation = cluster.get_allocation(&partitions).unwrap();
        assert!(allocation.by_node.values().flatten().any(|id| *id == 1));
        drop(allocation);

        let errors = cluster
            .handoff_segments(SegmentChangeInfo {
                online: vec![(3, 10, 2)],
                offline: vec![(1, 1)],
            })
            .await;
        assert!(errors.is_empty());
        assert!(!cluster.segments.read().contains_key(&1));
    }
}
