//! A brute-force, in-memory stand-in for the native segment kernel.
//!
//! Good enough to exercise ingest, delete-prefiltering, search and retrieve
//! end to end in tests; not an index in any performance sense. Production
//! deployments bind `SegmentEntry` to the real kernel instead.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ordered_float::OrderedFloat;
use parking_lot::RwLock;

use crate::entry::SegmentEntry;
use crate::errors::{SegmentError, SegmentResult};
use crate::types::{
    FieldColumn, FieldId, InsertRecord, MetricType, PrimaryKey, RetrievePartialResult,
    RetrievePlan, SearchPartialResult, SearchPlan, SegmentId, Timestamp,
};

#[derive(Default, Clone)]
struct Row {
    id: PrimaryKey,
    timestamp: Timestamp,
    deleted_at: Option<Timestamp>,
    columns: BTreeMap<FieldId, serde_json::Value>,
    vectors: BTreeMap<FieldId, Vec<f32>>,
}

#[derive(Default)]
struct Rows {
    rows: Vec<Row>,
    pk_to_offset: std::collections::HashMap<PrimaryKey, usize>,
}

pub struct ReferenceSegment {
    segment_id: SegmentId,
    next_insert_offset: AtomicU64,
    next_delete_offset: AtomicU64,
    rows: RwLock<Rows>,
    healthy: AtomicBool,
}

impl ReferenceSegment {
    pub fn new(segment_id: SegmentId) -> Self {
        ReferenceSegment {
            segment_id,
            next_insert_offset: AtomicU64::new(0),
            next_delete_offset: AtomicU64::new(0),
            rows: RwLock::new(Rows::default()),
            healthy: AtomicBool::new(true),
        }
    }

    fn score(metric: MetricType, query: &[f32], candidate: &[f32]) -> f32 {
        match metric {
            MetricType::InnerProduct | MetricType::Cosine => {
                query.iter().zip(candidate).map(|(a, b)| a * b).sum()
            }
            MetricType::L2 => -query
                .iter()
                .zip(candidate)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>(),
        }
    }
}

impl SegmentEntry for ReferenceSegment {
    fn pre_insert(&self, n: usize) -> SegmentResult<u64> {
        if !self.is_healthy() {
            return Err(SegmentError::Unhealthy);
        }
        Ok(self.next_insert_offset.fetch_add(n as u64, Ordering::SeqCst))
    }

    fn insert(
        &self,
        _offset: u64,
        ids: &[PrimaryKey],
        timestamps: &[Timestamp],
        record: &InsertRecord,
    ) -> SegmentResult<()> {
        if !self.is_healthy() {
            return Err(SegmentError::Unhealthy);
        }
        if ids.len() != timestamps.len() {
            return Err(SegmentError::fatal(
                "insert: ids/timestamps length mismatch",
            ));
        }
        let mut guard = self.rows.write();
        for (row_idx, (id, ts)) in ids.iter().zip(timestamps).enumerate() {
            let mut columns = BTreeMap::new();
            let mut vectors = BTreeMap::new();
            for (field_id, column) in &record.columns {
                match column {
                    FieldColumn::Vector(vs) => {
                        if let Some(v) = vs.get(row_idx) {
                            vectors.insert(*field_id, v.clone());
                        }
                    }
                    FieldColumn::Scalar(vs) => {
                        if let Some(v) = vs.get(row_idx) {
                            columns.insert(*field_id, v.clone());
                        }
                    }
                }
            }
            let offset = guard.rows.len();
            guard.pk_to_offset.insert(id.clone(), offset);
            guard.rows.push(Row {
                id: id.clone(),
                timestamp: *ts,
                deleted_at: None,
                columns,
                vectors,
            });
        }
        Ok(())
    }

    fn pre_delete(&self, n: usize) -> SegmentResult<u64> {
        if !self.is_healthy() {
            return Err(SegmentError::Unhealthy);
        }
        Ok(self.next_delete_offset.fetch_add(n as u64, Ordering::SeqCst))
    }

    fn delete(&self, _offset: u64, ids: &[PrimaryKey], timestamps: &[Timestamp]) -> SegmentResult<()> {
        if !self.is_healthy() {
            return Err(SegmentError::Unhealthy);
        }
        let mut guard = self.rows.write();
        for (id, ts) in ids.iter().zip(timestamps) {
            if let Some(&offset) = guard.pk_to_offset.get(id) {
                if let Some(row) = guard.rows.get_mut(offset) {
                    if row.deleted_at.map(|d| d < *ts).unwrap_or(true) {
                        row.deleted_at = Some(*ts);
                    }
                }
            }
        }
        Ok(())
    }

    fn search(&self, plan: &SearchPlan) -> SegmentResult<SearchPartialResult> {
        if !self.is_healthy() {
            return Err(SegmentError::Unhealthy);
        }
        let guard = self.rows.read();
        let mut hits = Vec::with_capacity(plan.queries.len());
        for query in &plan.queries {
            let mut scored: Vec<(f32, PrimaryKey, u64)> = guard
                .rows
                .iter()
                .enumerate()
                .filter(|(_, row)| row.deleted_at.is_none())
                .filter_map(|(offset, row)| {
                    row.vectors
                        .get(&plan.vector_field)
                        .map(|v| (Self::score(plan.metric, query, v), row.id.clone(), offset as u64))
                })
                .collect();
            scored.sort_by(|a, b| {
                OrderedFloat(b.0)
                    .cmp(&OrderedFloat(a.0))
                    .then(a.1.to_string().cmp(&b.1.to_string()))
                    .then(a.2.cmp(&b.2))
            });
            scored.truncate(plan.topk);
            hits.push(scored);
        }
        Ok(SearchPartialResult {
            segment_id: self.segment_id,
            hits,
        })
    }

    fn retrieve(&self, plan: &RetrievePlan) -> SegmentResult<RetrievePartialResult> {
        if !self.is_healthy() {
            return Err(SegmentError::Unhealthy);
        }
        let guard = self.rows.read();
        let mut rows = Vec::new();
        for id in &plan.ids {
            if let Some(&offset) = guard.pk_to_offset.get(id) {
                let row = &guard.rows[offset];
                if row.deleted_at.is_some() {
                    continue;
                }
                let mut out = BTreeMap::new();
                for field_id in &plan.output_fields {
                    if let Some(v) = row.columns.get(field_id) {
                        out.insert(*field_id, v.clone());
                    }
                }
                rows.push((id.clone(), out));
            }
        }
        Ok(RetrievePartialResult {
            segment_id: self.segment_id,
            rows,
        })
    }

    fn load_field_data(&self, field_id: FieldId, column: FieldColumn) -> SegmentResult<()> {
        let mut guard = self.rows.write();
        match column {
            FieldColumn::Vector(vs) => {
                for (row, v) in guard.rows.iter_mut().zip(vs) {
                    row.vectors.insert(field_id, v);
                }
            }
            FieldColumn::Scalar(vs) => {
                for (row, v) in guard.rows.iter_mut().zip(vs) {
                    row.columns.insert(field_id, v);
                }
            }
        }
        Ok(())
    }

    fn num_rows(&self) -> usize {
        self.rows.read().rows.iter().filter(|r| r.deleted_at.is_none()).count()
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn insert_record(ids: &[i64], ts: &[u64], vectors: Vec<Vec<f32>>) -> (Vec<PrimaryKey>, Vec<u64>, InsertRecord) {
        let pks: Vec<PrimaryKey> = ids.iter().copied().map(PrimaryKey::Int64).collect();
        let mut columns = Map::new();
        columns.insert(0, FieldColumn::Vector(vectors));
        (pks, ts.to_vec(), InsertRecord { columns })
    }

    #[test]
    fn insert_then_search_returns_rows() {
        let segment = ReferenceSegment::new(1);
        let (ids, ts, record) = insert_record(&[1, 2, 3], &[5, 6, 7], vec![
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![1.0, 1.0],
        ]);
        let offset = segment.pre_insert(ids.len()).unwrap();
        segment.insert(offset, &ids, &ts, &record).unwrap();
        assert_eq!(segment.num_rows(), 3);

        let plan = SearchPlan {
            vector_field: 0,
            queries: vec![vec![1.0, 0.0]],
            topk: 2,
            metric: MetricType::InnerProduct,
        };
        let result = segment.search(&plan).unwrap();
        assert_eq!(result.hits[0].len(), 2);
        assert_eq!(result.hits[0][0].1, PrimaryKey::Int64(1));
    }

    #[test]
    fn delete_hides_row_from_search_and_retrieve() {
        let segment = ReferenceSegment::new(1);
        let (ids, ts, record) = insert_record(&[1, 2], &[1, 1], vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        let offset = segment.pre_insert(ids.len()).unwrap();
        segment.insert(offset, &ids, &ts, &record).unwrap();

        let del_offset = segment.pre_delete(1).unwrap();
        segment
            .delete(del_offset, &[PrimaryKey::Int64(1)], &[2])
            .unwrap();

        assert_eq!(segment.num_rows(), 1);
        let plan = RetrievePlan {
            ids: vec![PrimaryKey::Int64(1), PrimaryKey::Int64(2)],
            output_fields: vec![],
        };
        let result = segment.retrieve(&plan).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].0, PrimaryKey::Int64(2));
    }

    #[test]
    fn unhealthy_segment_rejects_further_work() {
        let segment = ReferenceSegment::new(1);
        segment.mark_unhealthy();
        assert!(segment.pre_insert(1).is_err());
    }
}
