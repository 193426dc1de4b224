use crate::errors::SegmentResult;
use crate::types::{
    FieldColumn, FieldId, InsertRecord, PrimaryKey, RetrievePartialResult, RetrievePlan,
    SearchPartialResult, SearchPlan, Timestamp,
};

/// The native segment kernel interface named by spec.md §1 and §4.3-4.4:
/// `segmentInsert`, `segmentDelete`, `segmentSearch`, `segmentRetrieve`,
/// `loadFieldData`. Only the signatures are part of this spec; the
/// implementation (HNSW build, on-disk layout, SIMD kernels) is an external
/// collaborator. `reference::ReferenceSegment` implements this trait with a
/// brute-force in-memory engine so the rest of the crate is testable.
pub trait SegmentEntry: Send + Sync {
    /// Reserves `n` row slots and returns the starting offset, as in
    /// `segmentPreInsert` (spec.md §4.3).
    fn pre_insert(&self, n: usize) -> SegmentResult<u64>;

    /// Applies a columnar insert at the previously reserved `offset`.
    fn insert(
        &self,
        offset: u64,
        ids: &[PrimaryKey],
        timestamps: &[Timestamp],
        record: &InsertRecord,
    ) -> SegmentResult<()>;

    /// Reserves `n` delete slots and returns the starting offset, as in
    /// `segmentPreDelete` (spec.md §4.3).
    fn pre_delete(&self, n: usize) -> SegmentResult<u64>;

    /// Applies a delete at the previously reserved `offset`.
    fn delete(&self, offset: u64, ids: &[PrimaryKey], timestamps: &[Timestamp]) -> SegmentResult<()>;

    fn search(&self, plan: &SearchPlan) -> SegmentResult<SearchPartialResult>;

    fn retrieve(&self, plan: &RetrievePlan) -> SegmentResult<RetrievePartialResult>;

    /// Loads one field's raw column data into the segment, used both by
    /// streaming catch-up and by `SegmentLoader` step 5 (spec.md §4.4).
    fn load_field_data(&self, field_id: FieldId, column: FieldColumn) -> SegmentResult<()>;

    fn num_rows(&self) -> usize;

    /// `false` once the segment has been marked for concurrent release; the
    /// insert/delete nodes treat this as the recoverable "skip this
    /// segment's work for the batch" condition (spec.md §4.3, §7).
    fn is_healthy(&self) -> bool;

    fn mark_unhealthy(&self);
}
