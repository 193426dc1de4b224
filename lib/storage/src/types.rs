//! Shared wire-adjacent types for the distribution layer (spec.md §4.5,
//! §4.6, §6.3): node/segment events, the fan-out request shape, and the
//! per-node RPC surface's return types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use segment::{CollectionId, FieldId, PartitionId, PrimaryKey, RetrievePlan, SearchPlan, SegmentId};

pub type NodeId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Offline,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Available,
    Unavailable,
}

/// A query's fan-out scope (spec.md §4.5 "Scope=Historical"); streaming
/// growing-segment search never leaves the local node, so only the
/// historical value crosses the RPC boundary in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueryScope {
    Historical,
    Streaming,
}

/// One entry of `segmentEvent{Add|Del, segmentID, partitionID, nodeID,
/// state}` (spec.md §4.5). `Del` carries no meaningful `state`/`node_id`
/// beyond identifying the segment to drop.
#[derive(Debug, Clone)]
pub enum SegmentEvent {
    Add {
        segment_id: SegmentId,
        partition_id: PartitionId,
        node_id: NodeId,
        state: SegmentState,
    },
    Del {
        segment_id: SegmentId,
    },
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    Add { node_id: NodeId },
    Del { node_id: NodeId },
}

/// `HandoffSegments` input (spec.md §4.5): the online placement taking
/// over, and the offline placement it replaces.
#[derive(Debug, Clone)]
pub struct SegmentChangeInfo {
    pub online: Vec<(SegmentId, PartitionId, NodeId)>,
    pub offline: Vec<(SegmentId, NodeId)>,
}

/// A historical-tier search request sent to one peer node (spec.md §4.5
/// fan-out: "clone the request per node, set `FromShardLeader=true` and
/// `Scope=Historical`").
#[derive(Debug, Clone)]
pub struct ShardSearchRequest {
    pub collection_id: CollectionId,
    pub dm_channel: String,
    pub segment_ids: Vec<SegmentId>,
    pub plan: SearchPlan,
    pub guarantee_ts: u64,
    pub from_shard_leader: bool,
    pub scope: QueryScope,
}

#[derive(Debug, Clone)]
pub struct ShardQueryRequest {
    pub collection_id: CollectionId,
    pub dm_channel: String,
    pub segment_ids: Vec<SegmentId>,
    pub plan: RetrievePlan,
    pub guarantee_ts: u64,
    pub from_shard_leader: bool,
    pub scope: QueryScope,
}

#[derive(Debug, Clone, Default)]
pub struct CollectionStatistics {
    pub row_count: u64,
}

#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub segment_id: SegmentId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub node_id: NodeId,
    pub state: SegmentState,
    pub num_rows: usize,
}

/// Primary-key-addressed output row, returned by `Query`/Retrieve fan-in.
#[derive(Debug, Clone)]
pub struct RetrievedRow {
    pub primary_key: PrimaryKey,
    pub fields: std::collections::BTreeMap<FieldId, serde_json::Value>,
}
