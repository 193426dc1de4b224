//! `MetaReplica` — the authoritative in-memory registry of spec.md §4.2.
//!
//! MetaReplica exclusively owns `Collection`/`Partition`/`Segment` handles
//! and is the sole mutator (spec.md §3 "Ownership"); everyone else looks
//! segments up by id under a read lock rather than holding a reference.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use segment::entry::SegmentEntry;
use segment::reference::ReferenceSegment;
use segment::{
    ChannelName, ChannelPosition, CollectionId, CollectionSchema, LoadType, PartitionId,
    PkBloomFilter, SegmentId, SegmentType, Timestamp,
};

use crate::errors::{CollectionError, CollectionResult};

/// A primary-key/position pair describing a segment whose contents are
/// already covered by a sealed-segment load; see spec.md §4.2 "Excluded
/// segment filter".
#[derive(Debug, Clone)]
pub struct ExcludedSegment {
    pub segment_id: SegmentId,
    pub dml_position: Timestamp,
}

pub struct Partition {
    pub partition_id: PartitionId,
    pub released: RwLock<bool>,
}

/// One segment, owned exclusively by `MetaReplica`. Growing segments are
/// owned by the local node's flow graph; sealed segments are owned by
/// exactly one node per replica (spec.md §3 "Segment" invariants).
pub struct Segment {
    pub segment_id: SegmentId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub insert_channel: ChannelName,
    pub start_position: ChannelPosition,
    segment_type: RwLock<SegmentType>,
    pub bloom: RwLock<PkBloomFilter>,
    pub index_info: RwLock<HashMap<segment::FieldId, String>>,
    /// The native handle. Boxed behind the `SegmentEntry` trait object so
    /// `MetaReplica` never depends on which kernel backs it; dropping this
    /// `Arc` runs the handle's destructor exactly once, after every other
    /// holder (flow graph node, query fan-in) has released its reference,
    /// per spec.md §9 "Native-library C handles".
    pub handle: Arc<dyn SegmentEntry>,
}

impl Segment {
    pub fn new_growing(
        segment_id: SegmentId,
        collection_id: CollectionId,
        partition_id: PartitionId,
        insert_channel: ChannelName,
        start_position: ChannelPosition,
        expected_rows: usize,
    ) -> Self {
        Segment {
            segment_id,
            collection_id,
            partition_id,
            insert_channel,
            start_position,
            segment_type: RwLock::new(SegmentType::Growing),
            bloom: RwLock::new(PkBloomFilter::new(expected_rows.max(1024), 0.01)),
            index_info: RwLock::new(HashMap::new()),
            handle: Arc::new(ReferenceSegment::new(segment_id)),
        }
    }

    pub fn new_sealed(
        segment_id: SegmentId,
        collection_id: CollectionId,
        partition_id: PartitionId,
        insert_channel: ChannelName,
        num_rows_hint: usize,
    ) -> Self {
        Segment {
            segment_id,
            collection_id,
            partition_id,
            insert_channel: insert_channel.clone(),
            start_position: ChannelPosition {
                channel: insert_channel,
                timestamp: 0,
            },
            segment_type: RwLock::new(SegmentType::Sealed),
            bloom: RwLock::new(PkBloomFilter::new(num_rows_hint.max(1024), 0.01)),
            index_info: RwLock::new(HashMap::new()),
            handle: Arc::new(ReferenceSegment::new(segment_id)),
        }
    }

    pub fn segment_type(&self) -> SegmentType {
        *self.segment_type.read()
    }

    /// `segmentType` is monotone toward `Sealed` (spec.md §3); a sealed
    /// segment never re-enters `Growing`.
    pub fn seal(&self) -> CollectionResult<()> {
        let mut guard = self.segment_type.write();
        if *guard == SegmentType::Sealed {
            return Ok(());
        }
        *guard = SegmentType::Sealed;
        Ok(())
    }

    pub fn num_rows(&self) -> usize {
        self.handle.num_rows()
    }

    pub fn is_healthy(&self) -> bool {
        self.handle.is_healthy()
    }
}

pub struct Collection {
    pub collection_id: CollectionId,
    pub schema: CollectionSchema,
    pub load_type: LoadType,
    pub v_channels: RwLock<Vec<ChannelName>>,
    pub v_delta_channels: RwLock<Vec<ChannelName>>,
    pub p_channels: RwLock<Vec<ChannelName>>,
    /// Read on every query (spec.md §3 "Created by a Watch request,
    /// destroyed by Release ... the release flag is read on every query").
    /// This resolves spec.md §9 Open Question (a) in favor of keeping the
    /// flag; see DESIGN.md.
    released: RwLock<bool>,
    pub release_time: RwLock<Timestamp>,
    released_partitions: RwLock<HashSet<PartitionId>>,
    excluded_segments: RwLock<Vec<ExcludedSegment>>,
}

impl Collection {
    pub fn new(collection_id: CollectionId, schema: CollectionSchema, load_type: LoadType) -> Self {
        Collection {
            collection_id,
            schema,
            load_type,
            v_channels: RwLock::new(Vec::new()),
            v_delta_channels: RwLock::new(Vec::new()),
            p_channels: RwLock::new(Vec::new()),
            released: RwLock::new(false),
            release_time: RwLock::new(0),
            released_partitions: RwLock::new(HashSet::new()),
            excluded_segments: RwLock::new(Vec::new()),
        }
    }

    /// Idempotent: duplicates are no-ops (spec.md §8 "addVChannels is
    /// idempotent").
    pub fn add_vchannels(&self, channels: &[ChannelName]) {
        let mut guard = self.v_channels.write();
        for c in channels {
            if !guard.contains(c) {
                guard.push(c.clone());
            }
        }
    }

    pub fn add_vdelta_channels(&self, channels: &[ChannelName]) {
        let mut guard = self.v_delta_channels.write();
        for c in channels {
            if !guard.contains(c) {
                guard.push(c.clone());
            }
        }
    }

    pub fn vchannels(&self) -> Vec<ChannelName> {
        self.v_channels.read().clone()
    }

    pub fn vdelta_channels(&self) -> Vec<ChannelName> {
        self.v_delta_channels.read().clone()
    }

    pub fn is_released(&self) -> bool {
        *self.released.read()
    }

    pub fn release(&self, at: Timestamp) {
        *self.released.write() = true;
        *self.release_time.write() = at;
    }

    pub fn release_partition(&self, partition_id: PartitionId) {
        self.released_partitions.write().insert(partition_id);
    }

    pub fn is_partition_released(&self, partition_id: PartitionId) -> bool {
        self.released_partitions.read().contains(&partition_id)
    }

    pub fn add_excluded_segments(&self, excluded: Vec<ExcludedSegment>) {
        self.excluded_segments.write().extend(excluded);
    }

    /// Core of spec.md §4.2 "Excluded-segment filter": a message from
    /// `segment_id` at `msg_ts` must be discarded if that segment is
    /// excluded and the message is not newer than its recorded position.
    pub fn is_excluded(&self, segment_id: SegmentId, msg_ts: Timestamp) -> bool {
        self.excluded_segments
            .read()
            .iter()
            .any(|e| e.segment_id == segment_id && msg_ts <= e.dml_position)
    }

    /// Whether inserts for `partition_id` should pass the filter node
    /// (spec.md §4.3 FilterNode): collection-level loads accept every
    /// partition; partition-level loads only accept partitions that have
    /// actually been watched (tracked here as "not released", since
    /// partition add/remove for a partition-loaded collection is driven by
    /// the same Watch/Release lifecycle).
    pub fn accepts_partition(&self, partition_id: PartitionId, partitions: &HashSet<PartitionId>) -> bool {
        match self.load_type {
            LoadType::Collection => true,
            LoadType::Partition => partitions.contains(&partition_id),
        }
    }
}

#[derive(Default)]
struct SegmentTable {
    growing: HashMap<SegmentId, Arc<Segment>>,
    sealed: HashMap<SegmentId, Arc<Segment>>,
}

/// The authoritative in-memory registry (spec.md §4.2). One instance per
/// node, shared behind an `Arc` by the flow graphs, segment loader, shard
/// cluster and query collection running on that node.
pub struct MetaReplica {
    collections: RwLock<HashMap<CollectionId, Arc<Collection>>>,
    partitions: RwLock<HashMap<(CollectionId, PartitionId), Arc<Partition>>>,
    segments: RwLock<SegmentTable>,
    next_local_segment_id: AtomicUsize,
}

impl Default for MetaReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaReplica {
    pub fn new() -> Self {
        MetaReplica {
            collections: RwLock::new(HashMap::new()),
            partitions: RwLock::new(HashMap::new()),
            segments: RwLock::new(SegmentTable::default()),
            next_local_segment_id: AtomicUsize::new(1),
        }
    }

    pub fn add_collection(&self, collection: Collection) -> Arc<Collection> {
        let id = collection.collection_id;
        let arced = Arc::new(collection);
        self.collections.write().insert(id, arced.clone());
        arced
    }

    pub fn get_collection(&self, collection_id: CollectionId) -> CollectionResult<Arc<Collection>> {
        self.collections
            .read()
            .get(&collection_id)
            .cloned()
            .ok_or_else(|| CollectionError::not_found(format!("collection {collection_id}")))
    }

    pub fn remove_collection(&self, collection_id: CollectionId) -> CollectionResult<()> {
        self.collections
            .write()
            .remove(&collection_id)
            .map(|_| ())
            .ok_or_else(|| CollectionError::not_found(format!("collection {collection_id}")))
    }

    pub fn add_partition(&self, collection_id: CollectionId, partition_id: PartitionId) {
        self.partitions
            .write()
            .entry((collection_id, partition_id))
            .or_insert_with(|| {
                Arc::new(Partition {
                    partition_id,
                    released: RwLock::new(false),
                })
            });
    }

    pub fn has_partition(&self, collection_id: CollectionId, partition_id: PartitionId) -> bool {
        self.partitions
            .read()
            .contains_key(&(collection_id, partition_id))
    }

    pub fn remove_partition(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> CollectionResult<()> {
        self.partitions
            .write()
            .remove(&(collection_id, partition_id))
            .map(|_| ())
            .ok_or_else(|| CollectionError::not_found(format!("partition {partition_id}")))
    }

    pub fn add_segment(&self, segment: Segment) -> CollectionResult<Arc<Segment>> {
        let id = segment.segment_id;
        let segment_type = segment.segment_type();
        let arced = Arc::new(segment);
        let mut guard = self.segments.write();
        let table = match segment_type {
            SegmentType::Growing | SegmentType::Indexing => &mut guard.growing,
            SegmentType::Sealed => &mut guard.sealed,
        };
        if table.contains_key(&id) {
            return Err(CollectionError::already_exists(format!(
                "segment {id} ({segment_type:?})"
            )));
        }
        table.insert(id, arced.clone());
        Ok(arced)
    }

    pub fn has_segment(&self, segment_id: SegmentId, segment_type: SegmentType) -> bool {
        let guard = self.segments.read();
        match segment_type {
            SegmentType::Growing | SegmentType::Indexing => guard.growing.contains_key(&segment_id),
            SegmentType::Sealed => guard.sealed.contains_key(&segment_id),
        }
    }

    pub fn get_segment_by_id(
        &self,
        segment_id: SegmentId,
        segment_type: SegmentType,
    ) -> CollectionResult<Arc<Segment>> {
        let guard = self.segments.read();
        let found_growing = guard.growing.get(&segment_id);
        let found_sealed = guard.sealed.get(&segment_id);
        match segment_type {
            SegmentType::Growing | SegmentType::Indexing => found_growing
                .cloned()
                .ok_or_else(|| self.missing_or_wrong_type(segment_id, found_sealed.is_some())),
            SegmentType::Sealed => found_sealed
                .cloned()
                .ok_or_else(|| self.missing_or_wrong_type(segment_id, found_growing.is_some())),
        }
    }

    fn missing_or_wrong_type(&self, segment_id: SegmentId, exists_as_other: bool) -> CollectionError {
        if exists_as_other {
            CollectionError::wrong_type(format!("segment {segment_id} has a different type"))
        } else {
            CollectionError::not_found(format!("segment {segment_id}"))
        }
    }

    pub fn remove_segment(&self, segment_id: SegmentId) -> CollectionResult<()> {
        let mut guard = self.segments.write();
        if guard.growing.remove(&segment_id).is_some() || guard.sealed.remove(&segment_id).is_some()
        {
            Ok(())
        } else {
            Err(CollectionError::not_found(format!("segment {segment_id}")))
        }
    }

    /// Replaces a segment's registry entry, e.g. when a growing segment is
    /// sealed in place. Fails hard on an id that is not already registered
    /// ("hard error on setSegment conflicts", spec.md §4.2).
    pub fn set_segment(&self, segment: Segment) -> CollectionResult<Arc<Segment>> {
        let id = segment.segment_id;
        let new_type = segment.segment_type();
        let mut guard = self.segments.write();
        let existed = guard.growing.remove(&id).is_some() || guard.sealed.remove(&id).is_some();
        if !existed {
            return Err(CollectionError::not_found(format!(
                "setSegment: segment {id} does not exist"
            )));
        }
        let arced = Arc::new(segment);
        match new_type {
            SegmentType::Growing | SegmentType::Indexing => {
                guard.growing.insert(id, arced.clone());
            }
            SegmentType::Sealed => {
                guard.sealed.insert(id, arced.clone());
            }
        }
        Ok(arced)
    }

    pub fn add_excluded_segments(
        &self,
        collection_id: CollectionId,
        excluded: Vec<ExcludedSegment>,
    ) -> CollectionResult<()> {
        let collection = self.get_collection(collection_id)?;
        collection.add_excluded_segments(excluded);
        Ok(())
    }

    /// All growing segments for `collection_id` on `channel` belonging to
    /// one of `partitions` — used by the delete path of spec.md §4.3 step 3.
    pub fn growing_segments_for(
        &self,
        collection_id: CollectionId,
        channel: &str,
        partitions: &HashSet<PartitionId>,
    ) -> Vec<Arc<Segment>> {
        self.segments
            .read()
            .growing
            .values()
            .filter(|s| {
                s.collection_id == collection_id
                    && s.insert_channel == channel
                    && partitions.contains(&s.partition_id)
            })
            .cloned()
            .collect()
    }

    pub fn get_segment_infos_by_col_id(&self, collection_id: CollectionId) -> Vec<Arc<Segment>> {
        let guard = self.segments.read();
        guard
            .growing
            .values()
            .chain(guard.sealed.values())
            .filter(|s| s.collection_id == collection_id)
            .cloned()
            .collect()
    }

    pub fn next_local_segment_id(&self) -> SegmentId {
        self.next_local_segment_id.fetch_add(1, Ordering::SeqCst) as SegmentId
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segment::ChannelPosition;

    fn schema() -> CollectionSchema {
        CollectionSchema::default()
    }

    #[test]
    fn add_collection_then_lookup() {
        let meta = MetaReplica::new();
        meta.add_collection(Collection::new(1, schema(), LoadType::Collection));
        assert!(meta.get_collection(1).is_ok());
        assert!(meta.get_collection(2).is_err());
    }

    #[test]
    fn segment_type_mismatch_is_wrong_type_not_not_found() {
        let meta = MetaReplica::new();
        let seg = Segment::new_growing(
            100,
            1,
            10,
            "c1".to_string(),
            ChannelPosition {
                channel: "c1".to_string(),
                timestamp: 0,
            },
            16,
        );
        meta.add_segment(seg).unwrap();
        let err = meta.get_segment_by_id(100, SegmentType::Sealed).unwrap_err();
        assert!(matches!(err, CollectionError::WrongType { .. }));
    }

    #[test]
    fn add_segment_twice_is_already_exists() {
        let meta = MetaReplica::new();
        let seg1 = Segment::new_growing(
            100,
            1,
            10,
            "c1".to_string(),
            ChannelPosition {
                channel: "c1".to_string(),
                timestamp: 0,
            },
            16,
        );
        let seg2 = Segment::new_growing(
            100,
            1,
            10,
            "c1".to_string(),
            ChannelPosition {
                channel: "c1".to_string(),
                timestamp: 0,
            },
            16,
        );
        meta.add_segment(seg1).unwrap();
        assert!(matches!(
            meta.add_segment(seg2).unwrap_err(),
            CollectionError::AlreadyExists { .. }
        ));
    }

    #[test]
    fn excluded_segment_filters_covered_messages() {
        let collection = Collection::new(1, schema(), LoadType::Collection);
        collection.add_excluded_segments(vec![ExcludedSegment {
            segment_id: 100,
            dml_position: 50,
        }]);
        assert!(collection.is_excluded(100, 10));
        assert!(collection.is_excluded(100, 50));
        assert!(!collection.is_excluded(100, 51));
        assert!(!collection.is_excluded(200, 10));
    }
}
