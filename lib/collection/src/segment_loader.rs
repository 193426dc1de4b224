//! `SegmentLoader` (spec.md §4.4): pulls sealed-segment binlogs from object
//! storage and installs them into `MetaReplica`, under a configurable memory
//! budget. Mirrors the teacher's `load_from_wal` progress-bar idiom
//! (`lib/collection/src/collection_manager/segments_updater.rs` in the
//! original) by driving an `indicatif::ProgressBar` across the per-segment
//! load steps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use segment::{CollectionId, PartitionId, SegmentId};

use crate::errors::{CollectionError, CollectionResult};
use crate::meta_replica::{MetaReplica, Segment};
use crate::object_store::ObjectStore;

/// One sealed segment to load, as handed down by a `LoadSegments` RPC
/// (spec.md §6.3).
#[derive(Debug, Clone)]
pub struct SegmentLoadInfo {
    pub segment_id: SegmentId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub insert_channel: String,
    pub num_rows: usize,
    pub binlog_paths: Vec<String>,
}

/// Estimate of a segment's resident memory footprint, used for admission
/// control (spec.md §4.4 "rejects the whole batch up-front if projected
/// usage would exceed the threshold").
fn estimate_bytes(info: &SegmentLoadInfo) -> u64 {
    // A real kernel reports this from its own binlog headers; here we use
    // row count as a stand-in proportional estimate, which is enough to
    // exercise the admission-control logic against a deterministic budget
    // in tests.
    (info.num_rows as u64).saturating_mul(256)
}

pub struct SegmentLoader {
    meta: Arc<MetaReplica>,
    object_store: Arc<dyn ObjectStore>,
    /// Fraction of `total_memory_bytes` allowed to be in use after a load
    /// completes. Default 0.9 per spec.md §4.4.
    memory_threshold: f64,
    total_memory_bytes: u64,
    /// Bytes already resident from prior successful loads on this node
    /// ("usedMemory" in spec.md §4.4 step 4's admission formula).
    used_memory_bytes: AtomicU64,
}

impl SegmentLoader {
    pub fn new(
        meta: Arc<MetaReplica>,
        object_store: Arc<dyn ObjectStore>,
        total_memory_bytes: u64,
    ) -> Self {
        SegmentLoader {
            meta,
            object_store,
            memory_threshold: 0.9,
            total_memory_bytes,
            used_memory_bytes: AtomicU64::new(0),
        }
    }

    pub fn with_memory_threshold(mut self, threshold: f64) -> Self {
        self.memory_threshold = threshold;
        self
    }

    pub fn with_used_memory_bytes(self, used: u64) -> Self {
        self.used_memory_bytes.store(used, Ordering::SeqCst);
        self
    }

    fn budget_bytes(&self) -> u64 {
        (self.total_memory_bytes as f64 * self.memory_threshold) as u64
    }

    /// Loads a batch of sealed segments. Already-present segment ids are
    /// silently skipped (spec.md §4.4 "LoadSegments is idempotent per
    /// segment id"). Admission is all-or-nothing: if
    /// `usedMemory + sum(estimatedSize) + largestIndividual` would exceed
    /// `threshold * totalMemory`, nothing in the batch is loaded (spec.md
    /// §4.4 step 4, scenario S6).
    pub async fn load(&self, infos: Vec<SegmentLoadInfo>) -> CollectionResult<Vec<Arc<Segment>>> {
        let pending: Vec<SegmentLoadInfo> = infos
            .into_iter()
            .filter(|i| !self.meta.has_segment(i.segment_id, segment::SegmentType::Sealed))
            .collect();

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let sizes: Vec<u64> = pending.iter().map(estimate_bytes).collect();
        let sum: u64 = sizes.iter().sum();
        let largest = sizes.iter().copied().max().unwrap_or(0);
        let used = self.used_memory_bytes.load(Ordering::SeqCst);
        let projected = used.saturating_add(sum).saturating_add(largest);
        if projected > self.budget_bytes() {
            return Err(CollectionError::InsufficientMemory {
                description: format!(
                    "loading {} segments needs usedMemory {used} + Σsize {sum} + largest {largest} = {projected} bytes, budget is {}",
                    pending.len(),
                    self.budget_bytes()
                ),
            });
        }

        let progress = ProgressBar::new(pending.len() as u64);
        progress.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} segments loaded")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut loaded: Vec<(Arc<Segment>, u64)> = Vec::with_capacity(pending.len());
        for info in &pending {
            match self.load_one(info).await {
                Ok(segment) => {
                    let size = estimate_bytes(info);
                    self.used_memory_bytes.fetch_add(size, Ordering::SeqCst);
                    loaded.push((segment, size));
                    progress.inc(1);
                }
                Err(err) => {
                    // Install-or-free-all-on-failure (spec.md §4.4): unwind
                    // anything already registered in this batch.
                    for (segment, size) in &loaded {
                        let _ = self.meta.remove_segment(segment.segment_id);
                        self.used_memory_bytes.fetch_sub(*size, Ordering::SeqCst);
                    }
                    progress.finish_and_clear();
                    return Err(err);
                }
            }
        }
        progress.finish_and_clear();
        Ok(loaded.into_iter().map(|(segment, _)| segment).collect())
    }

    async fn load_one(&self, info: &SegmentLoadInfo) -> CollectionResult<Arc<Segment>> {
        for path in &info.binlog_paths {
            self.object_store.get_object(path).await?;
        }
        let segment = Segment::new_sealed(
            info.segment_id,
            info.collection_id,
            info.partition_id,
            info.insert_channel.clone(),
            info.num_rows,
        );
        self.meta.add_segment(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryObjectStore;

    fn info(id: SegmentId, num_rows: usize, paths: Vec<&str>) -> SegmentLoadInfo {
        SegmentLoadInfo {
            segment_id: id,
            collection_id: 1,
            partition_id: 10,
            insert_channel: "dml_1_1_v0".to_string(),
            num_rows,
            binlog_paths: paths.into_iter().map(String::from).collect(),
        }
    }

    #[tokio::test]
    async fn loads_segments_within_budget() {
        let meta = Arc::new(MetaReplica::new());
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("seg1/0", vec![0u8; 10]);
        let loader = SegmentLoader::new(meta.clone(), store, 1_000_000);

        let loaded = loader.load(vec![info(1, 100, vec!["seg1/0"])]).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(meta.has_segment(1, segment::SegmentType::Sealed));
    }

    #[tokio::test]
    async fn already_present_segments_are_skipped() {
        let meta = Arc::new(MetaReplica::new());
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("seg1/0", vec![0u8; 10]);
        let loader = SegmentLoader::new(meta.clone(), store, 1_000_000);

        loader.load(vec![info(1, 100, vec!["seg1/0"])]).await.unwrap();
        let second = loader.load(vec![info(1, 100, vec!["seg1/0"])]).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn over_budget_batch_is_rejected_entirely() {
        let meta = Arc::new(MetaReplica::new());
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("seg1/0", vec![0u8; 10]);
        store.put("seg2/0", vec![0u8; 10]);
        let loader = SegmentLoader::new(meta.clone(), store, 1000).with_memory_threshold(0.9);

        let err = loader
            .load(vec![info(1, 100, vec!["seg1/0"]), info(2, 100, vec!["seg2/0"])])
            .await
            .unwrap_err();
        assert!(matches!(err, CollectionError::InsufficientMemory { .. }));
        assert!(!meta.has_segment(1, segment::SegmentType::Sealed));
        assert!(!meta.has_segment(2, segment::SegmentType::Sealed));
    }

    #[tokio::test]
    async fn oom_admission_accounts_for_used_memory_before_any_fetch() {
        // spec.md §8 scenario S6: estimatedSize=8GiB, usedMemory=2GiB,
        // totalMemory=10GiB, threshold=0.9 -> reject before any binlog read.
        let meta = Arc::new(MetaReplica::new());
        let store = Arc::new(InMemoryObjectStore::new());
        // Deliberately do not `put` the binlog: a rejection must happen
        // before `load_one` ever calls `get_object`.
        let gib = 1u64 << 30;
        let loader = SegmentLoader::new(meta.clone(), store, 10 * gib)
            .with_memory_threshold(0.9)
            .with_used_memory_bytes(2 * gib);

        let huge_rows = (8 * gib / 256) as usize;
        let err = loader
            .load(vec![info(1, huge_rows, vec!["never-fetched"])])
            .await
            .unwrap_err();
        assert!(matches!(err, CollectionError::InsufficientMemory { .. }));
        assert!(!meta.has_segment(1, segment::SegmentType::Sealed));
    }

    #[tokio::test]
    async fn missing_binlog_aborts_and_frees_prior_segments_in_batch() {
        let meta = Arc::new(MetaReplica::new());
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("seg1/0", vec![0u8; 10]);
        // seg2's binlog is never stored.
        let loader = SegmentLoader::new(meta.clone(), store, 1_000_000);

        let err = loader
            .load(vec![info(1, 100, vec!["seg1/0"]), info(2, 100, vec!["missing"])])
            .await
            .unwrap_err();
        assert!(matches!(err, CollectionError::NotFound { .. }));
        assert!(!meta.has_segment(1, segment::SegmentType::Sealed));
        assert!(!meta.has_segment(2, segment::SegmentType::Sealed));
    }
}
