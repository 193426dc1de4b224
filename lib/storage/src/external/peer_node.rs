//! `PeerNode` (spec.md §6.3): the subset of the per-node RPC surface that
//! `ShardCluster` fan-out and the handoff protocol call on other nodes. Only
//! the interface is in scope per spec.md §1; `LocalPeerNode` is a
//! single-process reference implementation that serves historical segments
//! directly out of a shared `MetaReplica`, standing in for the real
//! `tonic`-backed client (scaffolding only).

use std::sync::Arc;

use api::grpc::transport_channel_pool::TransportChannelPool;
use async_trait::async_trait;
use collection::MetaReplica;
use segment::{SegmentId, SegmentType};

use crate::errors::{StorageError, StorageResult};
use crate::types::{
    CollectionStatistics, SegmentInfo, SegmentState, ShardQueryRequest, ShardSearchRequest,
};

#[async_trait]
pub trait PeerNode: Send + Sync {
    async fn search(&self, req: &ShardSearchRequest) -> StorageResult<segment::SearchPartialResult>;

    async fn query(&self, req: &ShardQueryRequest) -> StorageResult<segment::RetrievePartialResult>;

    async fn get_statistics(&self, collection_id: segment::CollectionId) -> StorageResult<CollectionStatistics>;

    async fn release_segments(&self, segment_ids: &[SegmentId]) -> StorageResult<()>;

    async fn get_segment_info(&self, segment_ids: &[SegmentId]) -> StorageResult<Vec<SegmentInfo>>;
}

/// Routes every call directly at the sealed segments held by a local
/// `MetaReplica`, ignoring node identity — adequate for single-binary tests
/// where "every node" is really the same process (spec.md §4.9).
pub struct LocalPeerNode {
    meta: Arc<MetaReplica>,
}

impl LocalPeerNode {
    pub fn new(meta: Arc<MetaReplica>) -> Arc<Self> {
        Arc::new(LocalPeerNode { meta })
    }
}

#[async_trait]
impl PeerNode for LocalPeerNode {
    async fn search(&self, req: &ShardSearchRequest) -> StorageResult<segment::SearchPartialResult> {
        let mut merged = segment::SearchPartialResult {
            segment_id: 0,
            hits: vec![Vec::new(); req.plan.queries.len()],
        };
        for segment_id in &req.segment_ids {
            let segment = self
                .meta
                .get_segment_by_id(*segment_id, SegmentType::Sealed)
                .map_err(StorageError::from)?;
            let partial = segment
                .handle
                .search(&req.plan)
                .map_err(|e| StorageError::from(collection::CollectionError::from(e)))?;
            for (query_idx, hits) in partial.hits.into_iter().enumerate() {
                if let Some(slot) = merged.hits.get_mut(query_idx) {
                    slot.extend(hits);
                }
            }
        }
        Ok(merged)
    }

    async fn query(&self, req: &ShardQueryRequest) -> StorageResult<segment::RetrievePartialResult> {
        let mut merged = segment::RetrievePartialResult {
            segment_id: 0,
            rows: Vec::new(),
        };
        for segment_id in &req.segment_ids {
            let segment = self
                .meta
                .get_segment_by_id(*segment_id, SegmentType::Sealed)
                .map_err(StorageError::from)?;
            let partial = segment
                .handle
                .retrieve(&req.plan)
                .map_err(|e| StorageError::from(collection::CollectionError::from(e)))?;
            merged.rows.extend(partial.rows);
        }
        Ok(merged)
    }

    async fn get_statistics(&self, collection_id: segment::CollectionId) -> StorageResult<CollectionStatistics> {
        let row_count = self
            .meta
            .get_segment_infos_by_col_id(collection_id)
            .iter()
            .map(|s| s.num_rows() as u64)
            .sum();
        Ok(CollectionStatistics { row_count })
    }

    async fn release_segments(&self, segment_ids: &[SegmentId]) -> StorageResult<()> {
        for id in segment_ids {
            let _ = self.meta.remove_segment(*id);
        }
        Ok(())
    }

    async fn get_segment_info(&self, segment_ids: &[SegmentId]) -> StorageResult<Vec<SegmentInfo>> {
        let mut infos = Vec::with_capacity(segment_ids.len());
        for id in segment_ids {
            if let Ok(segment) = self.meta.get_segment_by_id(*id, SegmentType::Sealed) {
                infos.push(SegmentInfo {
                    segment_id: segment.segment_id,
                    collection_id: segment.collection_id,
                    partition_id: segment.partition_id,
                    node_id: 0,
                    state: SegmentState::Loaded,
                    num_rows: segment.num_rows(),
                });
            }
        }
        Ok(infos)
    }
}

/// The real cross-process shape of `PeerNode` (spec.md §1 "RPC transport and
/// grpc scaffolding" are out of scope): one lazily-dialed `tonic::Channel`
/// per peer, cached in the shared `TransportChannelPool` (spec.md §5
/// "Connection pools to peer nodes are 1-per-node, reconnect on event-driven
/// re-add"). The generated client stubs that would actually serialize
/// `Search`/`Query`/... onto that channel are the named non-goal; every
/// method here dials (or reuses) the channel and then reports that the
/// stub layer is not part of this crate, so a deployment only needs to
/// plug in the generated client to make this real.
pub struct RemotePeerNode {
    uri: String,
    pool: Arc<TransportChannelPool>,
}

impl RemotePeerNode {
    pub fn new(uri: impl Into<String>, pool: Arc<TransportChannelPool>) -> Arc<Self> {
        Arc::new(RemotePeerNode {
            uri: uri.into(),
            pool,
        })
    }

    /// Ensures a channel is dialed and cached for this peer; called from
    /// `ShardCluster::node_add` so the connection is warm before the first
    /// fan-out call reaches it.
    pub async fn connect(&self) -> StorageResult<()> {
        self.pool
            .channel(&self.uri)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::service_error(format!("dialing peer {}: {e}", self.uri)))
    }

    /// Drops this peer's cached channel, forcing the next `connect` (e.g.
    /// after a `nodeEvent{Add, ...}` re-adds the same uri) to redial
    /// (spec.md §4.5 "Node removal").
    pub fn disconnect(&self) {
        self.pool.drop_channel(&self.uri);
    }

    fn unimplemented(&self, rpc: &str) -> StorageError {
        StorageError::service_error(format!(
            "{rpc} against peer {}: no generated gRPC client is wired into this crate (spec.md §1 names RPC transport out of scope)",
            self.uri
        ))
    }
}

#[async_trait]
impl PeerNode for RemotePeerNode {
    async fn search(&self, _req: &ShardSearchRequest) -> StorageResult<segment::SearchPartialResult> {
        self.connect().await?;
        Err(self.unimplemented("Search"))
    }

    async fn query(&self, _req: &ShardQueryRequest) -> StorageResult<segment::RetrievePartialResult> {
        self.connect().await?;
        Err(self.unimplemented("Query"))
    }

    async fn get_statistics(&self, _collection_id: segment::CollectionId) -> StorageResult<CollectionStatistics> {
        self.connect().await?;
        Err(self.unimplemented("GetStatistics"))
    }

    async fn release_segments(&self, _segment_ids: &[SegmentId]) -> StorageResult<()> {
        self.connect().await?;
        Err(self.unimplemented("ReleaseSegments"))
    }

    async fn get_segment_info(&self, _segment_ids: &[SegmentId]) -> StorageResult<Vec<SegmentInfo>> {
        self.connect().await?;
        Err(self.unimplemented("GetSegmentInfo"))
    }
}

#[cfg(test)]
mod remote_tests {
    use super::*;

    #[tokio::test]
    async fn disconnect_before_connect_is_a_no_op() {
        let pool = Arc::new(TransportChannelPool::default());
        let peer = RemotePeerNode::new("http://127.0.0.1:19999", pool);
        peer.disconnect();
    }
}
