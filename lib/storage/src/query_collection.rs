//! `QueryCollection` / `QueryShard` — guarantee-ts gating and result
//! reduction (spec.md §4.6). One `QueryCollection` per watched collection,
//! holding one `QueryShard` per watched v-channel; each shard wraps the
//! `ShardCluster` that serves its historical tier.
//!
//! The "unsolvedMsg list drained by a background `doUnsolvedQueryMsg`
//! loop" of the original design collapses here into one retry loop per
//! call to `search`/`retrieve`: each query is already its own `tokio` task
//! by virtue of being an `async fn` call, so a dedicated per-query wait
//! loop woken by `TimestampWatcher::watch` gives the same "block until
//! serviceTime catches up, wake on any tSafe update" behavior without a
//! second shared queue and dispatcher. See DESIGN.md.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use segment::{
    ChannelName, CollectionId, FieldId, PartitionId, PrimaryKey, RetrievePlan, SearchPlan,
    SegmentId, Timestamp,
};

use collection::{Collection, MetaReplica, TimestampWatcher};

use crate::errors::{StorageError, StorageResult};
use crate::shard_cluster::ShardCluster;
use crate::types::{QueryScope, ShardQueryRequest, ShardSearchRequest};

/// One v-channel's worth of historical + streaming search/query capability.
pub struct QueryShard {
    pub channel: ChannelName,
    pub cluster: Arc<ShardCluster>,
}

impl QueryShard {
    pub fn new(channel: impl Into<ChannelName>, cluster: Arc<ShardCluster>) -> Arc<Self> {
        Arc::new(QueryShard {
            channel: channel.into(),
            cluster,
        })
    }

    pub async fn search(
        &self,
        meta: &MetaReplica,
        partition_ids: &HashSet<PartitionId>,
        plan: &SearchPlan,
        collection_id: CollectionId,
        guarantee_ts: Timestamp,
    ) -> StorageResult<Vec<segment::SearchPartialResult>> {
        let channel = self.channel.clone();
        self.cluster
            .fan_out_search(
                &channel,
                partition_ids,
                |ids| ShardSearchRequest {
                    collection_id,
                    dm_channel: channel.clone(),
                    segment_ids: ids.to_vec(),
                    plan: plan.clone(),
                    guarantee_ts,
                    from_shard_leader: true,
                    scope: QueryScope::Historical,
                },
                || async { search_streaming(meta, collection_id, &channel, partition_ids, plan) },
            )
            .await
    }

    pub async fn retrieve(
        &self,
        meta: &MetaReplica,
        partition_ids: &HashSet<PartitionId>,
        plan: &RetrievePlan,
        collection_id: CollectionId,
        guarantee_ts: Timestamp,
    ) -> StorageResult<Vec<segment::RetrievePartialResult>> {
        let channel = self.channel.clone();
        self.cluster
            .fan_out_query(
                &channel,
                partition_ids,
                |ids| ShardQueryRequest {
                    collection_id,
                    dm_channel: channel.clone(),
                    segment_ids: ids.to_vec(),
                    plan: plan.clone(),
                    guarantee_ts,
                    from_shard_leader: true,
                    scope: QueryScope::Historical,
                },
                || async { retrieve_streaming(meta, collection_id, &channel, partition_ids, plan) },
            )
            .await
    }
}

fn search_streaming(
    meta: &MetaReplica,
    collection_id: CollectionId,
    channel: &str,
    partition_ids: &HashSet<PartitionId>,
    plan: &SearchPlan,
) -> StorageResult<segment::SearchPartialResult> {
    let mut merged = segment::SearchPartialResult {
        segment_id: 0,
        hits: vec![Vec::new(); plan.queries.len()],
    };
    for seg in meta.growing_segments_for(collection_id, channel, partition_ids) {
        if !seg.is_healthy() {
            continue;
        }
        let partial = seg
            .handle
            .search(plan)
            .map_err(|e| StorageError::from(collection::CollectionError::from(e)))?;
        for (i, hits) in partial.hits.into_iter().enumerate() {
            if let Some(slot) = merged.hits.get_mut(i) {
                slot.extend(hits);
            }
        }
    }
    Ok(merged)
}

fn retrieve_streaming(
    meta: &MetaReplica,
    collection_id: CollectionId,
    channel: &str,
    partition_ids: &HashSet<PartitionId>,
    plan: &RetrievePlan,
) -> StorageResult<segment::RetrievePartialResult> {
    let mut merged = segment::RetrievePartialResult {
        segment_id: 0,
        rows: Vec::new(),
    };
    for seg in meta.growing_segments_for(collection_id, channel, partition_ids) {
        if !seg.is_healthy() {
            continue;
        }
        let partial = seg
            .handle
            .retrieve(plan)
            .map_err(|e| StorageError::from(collection::CollectionError::from(e)))?;
        merged.rows.extend(partial.rows);
    }
    Ok(merged)
}

/// Picks each channel's current notifier and waits for the first one to
/// fire, registering interest before the caller re-checks its predicate
/// (spec.md §4.6 "waitNewTSafe ... driven by any tSafe update").
async fn wait_for_any_tsafe_update(tsafe: &TimestampWatcher, channels: &[ChannelName]) {
    let notifies: Vec<Arc<tokio::sync::Notify>> =
        channels.iter().filter_map(|c| tsafe.watch(c)).collect();
    if notifies.is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
        return;
    }
    let pinned: Vec<_> = notifies.iter().map(|n| Box::pin(n.notified())).collect();
    let _ = futures::future::select_all(pinned).await;
}

pub struct QueryCollection {
    pub collection_id: CollectionId,
    meta: Arc<MetaReplica>,
    tsafe: Arc<TimestampWatcher>,
    shards: RwLock<HashMap<ChannelName, Arc<QueryShard>>>,
    watched_partitions: RwLock<HashSet<PartitionId>>,
}

impl QueryCollection {
    pub fn new(collection_id: CollectionId, meta: Arc<MetaReplica>, tsafe: Arc<TimestampWatcher>) -> Arc<Self> {
        Arc::new(QueryCollection {
            collection_id,
            meta,
            tsafe,
            shards: RwLock::new(HashMap::new()),
            watched_partitions: RwLock::new(HashSet::new()),
        })
    }

    pub fn add_shard(&self, shard: Arc<QueryShard>) {
        self.shards.write().insert(shard.channel.clone(), shard);
    }

    pub fn watch_partition(&self, partition_id: PartitionId) {
        self.watched_partitions.write().insert(partition_id);
    }

    /// Gate (spec.md §4.6 steps 1-3): rejects against a released collection,
    /// then blocks until `serviceTime = min tSafe` over `v_channels ∪
    /// v_delta_channels` reaches `guarantee_ts`.
    async fn gate(&self, collection: &Collection, guarantee_ts: Timestamp) -> StorageResult<Timestamp> {
        let effective_release_time = if collection.is_released() {
            *collection.release_time.read()
        } else {
            Timestamp::MAX
        };
        if guarantee_ts >= effective_release_time {
            return Err(StorageError::CollectionReleased {
                description: format!("collection {} was released", self.collection_id),
            });
        }

        let channels: Vec<ChannelName> = collection
            .vchannels()
            .into_iter()
            .chain(collection.vdelta_channels())
            .collect();

        loop {
            let service_time = channels
                .iter()
                .map(|c| self.tsafe.get_tsafe(c).unwrap_or(0))
                .min()
                .unwrap_or(0);
            if guarantee_ts <= service_time {
                return Ok(service_time);
            }
            wait_for_any_tsafe_update(&self.tsafe, &channels).await;
        }
    }

    pub async fn search(
        &self,
        collection: &Collection,
        plan: SearchPlan,
        guarantee_ts: Timestamp,
        topk: usize,
    ) -> StorageResult<Vec<(f32, PrimaryKey, SegmentId)>> {
        self.gate(collection, guarantee_ts).await?;

        let shards: Vec<Arc<QueryShard>> = self.shards.read().values().cloned().collect();
        let watched = self.watched_partitions.read().clone();

        let mut per_query: Vec<Vec<(f32, PrimaryKey, u64)>> = vec![Vec::new(); plan.queries.len()];
        for shard in &shards {
            let partials = shard
                .search(&self.meta, &watched, &plan, self.collection_id, guarantee_ts)
                .await?;
            for partial in partials {
                for (i, hits) in partial.hits.into_iter().enumerate() {
                    if let Some(slot) = per_query.get_mut(i) {
                        slot.extend(hits);
                    }
                }
            }
        }

        // reduceSearchResultsAndFillData (spec.md §4.6): stable top-k merge,
        // tie-break (score desc, primary key asc, offset asc) — segmentID is
        // not carried across the RPC boundary by this reference
        // implementation, so primary key stands in as the deterministic
        // tie-break key (see DESIGN.md).
        let mut flattened = Vec::new();
        for hits in per_query {
            let mut sorted = hits;
            sorted.sort_by(|a, b| {
                OrderedFloat(b.0)
                    .cmp(&OrderedFloat(a.0))
                    .then_with(|| a.1.to_string().cmp(&b.1.to_string()))
                    .then_with(|| a.2.cmp(&b.2))
            });
            sorted.truncate(topk);
            flattened.extend(sorted.into_iter().map(|(score, pk, offset)| (score, pk, offset as SegmentId)));
        }
        Ok(flattened)
    }

    pub async fn retrieve(
        &self,
        collection: &Collection,
        plan: RetrievePlan,
        guarantee_ts: Timestamp,
    ) -> StorageResult<Vec<(PrimaryKey, BTreeMap<FieldId, serde_json::Value>)>> {
        self.gate(collection, guarantee_ts).await?;

        let shards: Vec<Arc<QueryShard>> = self.shards.read().values().cloned().collect();
        let watched = self.watched_partitions.read().clone();

        let mut rows = Vec::new();
        for shard in &shards {
            let partials = shard
                .retrieve(&self.meta, &watched, &plan, self.collection_id, guarantee_ts)
                .await?;
            for partial in partials {
                rows.extend(partial.rows);
            }
        }

        // Merge by primary key: first occurrence wins, duplicates counted
        // and logged (spec.md §4.6 "Retrieve" reduction).
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut merged = Vec::with_capacity(rows.len());
        for (pk, fields) in rows {
            let key = pk.to_string();
            let count = seen.entry(key).or_insert(0);
            *count += 1;
            if *count == 1 {
                merged.push((pk, fields));
            }
        }
        if let Some((dup_key, count)) = seen.iter().find(|(_, c)| **c > 1) {
            log::warn!(
                "retrieve: primary key {dup_key} returned by {count} segments, kept first occurrence"
            );
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::peer_node::LocalPeerNode;
    use collection::Collection as CollectionHandle;
    use segment::{CollectionSchema, LoadType, MetricType};

    fn setup() -> (Arc<QueryCollection>, Arc<CollectionHandle>, Arc<TimestampWatcher>) {
        let meta = Arc::new(MetaReplica::new());
        let tsafe = Arc::new(TimestampWatcher::new());
        let collection = meta.add_collection(CollectionHandle::new(1, CollectionSchema::default(), LoadType::Collection));
        collection.add_vchannels(&["dml_1_1_v0".to_string()]);
        tsafe.add_tsafe("dml_1_1_v0");

        let query_collection = QueryCollection::new(1, meta.clone(), tsafe.clone());
        let cluster = ShardCluster::new(1, "dml_1_1_v0");
        cluster.node_add(1, LocalPeerNode::new(meta.clone()));
        query_collection.add_shard(QueryShard::new("dml_1_1_v0", cluster));
        query_collection.watch_partition(10);

        (query_collection, collection, tsafe)
    }

    #[tokio::test]
    async fn search_unblocks_once_service_time_reaches_guarantee() {
        let (qc, collection, tsafe) = setup();
        tsafe.set_tsafe("dml_1_1_v0", 5).unwrap();

        let plan = SearchPlan {
            vector_field: 0,
            queries: vec![vec![1.0, 0.0]],
            topk: 5,
            metric: MetricType::L2,
        };

        let qc2 = qc.clone();
        let collection2 = collection.clone();
        let plan2 = plan.clone();
        let handle = tokio::spawn(async move { qc2.search(&collection2, plan2, 7, 5).await });

        // guaranteeTs=7 > serviceTime=5: the call must still be parked.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        // Advancing tSafe past guaranteeTs must wake and resolve the call.
        tsafe.set_tsafe("dml_1_1_v0", 7).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("query should unblock once service time reaches guarantee ts")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn released_collection_rejects_with_collection_released() {
        let (qc, collection, _tsafe) = setup();
        collection.release(50);
        let plan = RetrievePlan {
            ids: vec![PrimaryKey::Int64(1)],
            output_fields: vec![],
        };
        let err = qc.retrieve(&collection, plan, 60).await.unwrap_err();
        assert!(matches!(err, StorageError::CollectionReleased { .. }));
    }
}
