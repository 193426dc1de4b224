//! Node lifecycle (spec.md §2.8, detailed as SPEC_FULL.md §4.8):
//! `Initializing -> Healthy -> Stopping -> Stopped`, with the graceful-drain
//! ordering from spec.md §5 "Cancellation": flip state to Stopping (new
//! queries rejected immediately with *Unavailable*) -> wait for in-flight
//! queries to drain, bounded by `graceful_stop_timeout` -> cancel flow-graph
//! contexts -> close flow graphs -> free MetaReplica -> mark Stopped.
//!
//! `NodeLifecycle` is the one place that holds `MetaReplica`,
//! `TimestampWatcher`, the per-shard `ShardCluster`s, the per-collection
//! `QueryCollection`s, and the `TaskScheduler` together; every collaborator
//! below it looks its peers up by id through this registry rather than
//! holding a back-pointer (spec.md §9 "never store back-pointers between
//! peers — look up by id on each call").

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use collection::{FlowGraph, MetaReplica, TimestampWatcher};
use parking_lot::RwLock;
use segment::{ChannelName, CollectionId};
use tokio::time::Instant;

use crate::errors::{StorageError, StorageResult};
use crate::query_collection::QueryCollection;
use crate::shard_cluster::ShardCluster;
use crate::task_scheduler::TaskScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Initializing,
    Healthy,
    Stopping,
    Stopped,
}

/// Held by a caller for the duration of one query; dropping it decrements
/// the in-flight counter `stop()` drains against.
pub struct QueryGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct NodeLifecycle {
    state: RwLock<NodeState>,
    meta: Arc<MetaReplica>,
    tsafe: Arc<TimestampWatcher>,
    flow_graphs: RwLock<HashMap<(CollectionId, ChannelName), Arc<FlowGraph>>>,
    shard_clusters: RwLock<HashMap<(CollectionId, ChannelName), Arc<ShardCluster>>>,
    query_collections: RwLock<HashMap<CollectionId, Arc<QueryCollection>>>,
    task_scheduler: Arc<TaskScheduler>,
    in_flight_queries: Arc<AtomicUsize>,
    graceful_stop_timeout: Duration,
}

impl NodeLifecycle {
    /// `Init` (spec.md §4.8): constructs every registry this node needs.
    /// Collaborators are added incrementally afterwards via
    /// `add_flow_graph`/`add_shard_cluster`/`add_query_collection` as Watch
    /// requests arrive; none of them hold a reference back to this struct.
    pub fn init(task_queue_capacity: usize, graceful_stop_timeout: Duration) -> Arc<Self> {
        Arc::new(NodeLifecycle {
            state: RwLock::new(NodeState::Initializing),
            meta: Arc::new(MetaReplica::new()),
            tsafe: Arc::new(TimestampWatcher::new()),
            flow_graphs: RwLock::new(HashMap::new()),
            shard_clusters: RwLock::new(HashMap::new()),
            query_collections: RwLock::new(HashMap::new()),
            task_scheduler: Arc::new(TaskScheduler::new(task_queue_capacity)),
            in_flight_queries: Arc::new(AtomicUsize::new(0)),
            graceful_stop_timeout,
        })
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// `Register` (spec.md §4.8): exposes the RPC surface and marks the
    /// node `Healthy`; `GetComponentStates` and the healthz probe read this
    /// state from this point on.
    pub fn register(&self) {
        *self.state.write() = NodeState::Healthy;
        log::info!("node registered, now serving");
    }

    pub fn meta(&self) -> &Arc<MetaReplica> {
        &self.meta
    }

    pub fn tsafe(&self) -> &Arc<TimestampWatcher> {
        &self.tsafe
    }

    pub fn task_scheduler(&self) -> &Arc<TaskScheduler> {
        &self.task_scheduler
    }

    pub fn add_flow_graph(&self, collection_id: CollectionId, channel: ChannelName, graph: Arc<FlowGraph>) {
        self.flow_graphs.write().insert((collection_id, channel), graph);
    }

    pub fn add_shard_cluster(&self, collection_id: CollectionId, channel: ChannelName, cluster: Arc<ShardCluster>) {
        self.shard_clusters.write().insert((collection_id, channel), cluster);
    }

    pub fn get_shard_cluster(&self, collection_id: CollectionId, channel: &str) -> Option<Arc<ShardCluster>> {
        self.shard_clusters.read().get(&(collection_id, channel.to_string())).cloned()
    }

    pub fn add_query_collection(&self, collection: Arc<QueryCollection>) {
        self.query_collections.write().insert(collection.collection_id, collection);
    }

    pub fn get_query_collection(&self, collection_id: CollectionId) -> Option<Arc<QueryCollection>> {
        self.query_collections.read().get(&collection_id).cloned()
    }

    /// Acquired by a caller before dispatching a Search/Query/GetStatistics
    /// RPC; rejects immediately once the node has started stopping, which
    /// is the "new queries are rejected with Unavailable" behavior spec.md
    /// §4.8 calls out as implied-but-unstated by the Cancellation ordering.
    pub fn begin_query(&self) -> StorageResult<QueryGuard> {
        if self.state() != NodeState::Healthy {
            return Err(StorageError::unavailable("node is not serving queries"));
        }
        self.in_flight_queries.fetch_add(1, Ordering::SeqCst);
        Ok(QueryGuard {
            in_flight: self.in_flight_queries.clone(),
        })
    }

    /// `Stop` (spec.md §4.8, ordering from spec.md §5 "Cancellation"):
    /// flip to Stopping, drain in-flight queries up to
    /// `graceful_stop_timeout`, close every flow graph (which cancels its
    /// consume loop and unregisters its tSafe entry), then free MetaReplica
    /// and mark Stopped.
    pub async fn stop(&self) {
        *self.state.write() = NodeState::Stopping;
        log::info!("node stopping, draining in-flight queries");

        let deadline = Instant::now() + self.graceful_stop_timeout;
        while self.in_flight_queries.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let remaining = self.in_flight_queries.load(Ordering::SeqCst);
        if remaining > 0 {
            log::warn!("graceful stop timeout elapsed with {remaining} queries still in flight");
        }

        let graphs: Vec<Arc<FlowGraph>> = self.flow_graphs.write().drain().map(|(_, g)| g).collect();
        for graph in graphs {
            graph.close(&self.tsafe).await;
        }

        self.shard_clusters.write().clear();
        self.query_collections.write().clear();

        *self.state.write() = NodeState::Stopped;
        log::info!("node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_register_stop_transitions_in_order() {
        let node = NodeLifecycle::init(8, Duration::from_millis(200));
        assert_eq!(node.state(), NodeState::Initializing);
        node.register();
        assert_eq!(node.state(), NodeState::Healthy);
        node.stop().await;
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn queries_are_rejected_once_stopping_begins() {
        let node = NodeLifecycle::init(8, Duration::from_millis(50));
        node.register();
        let guard = node.begin_query().unwrap();

        let node2 = node.clone();
        let stop_handle = tokio::spawn(async move { node2.stop().await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(node.begin_query().is_err());

        drop(guard);
        stop_handle.await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
    }
}
