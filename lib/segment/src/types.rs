use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type CollectionId = i64;
pub type PartitionId = i64;
pub type SegmentId = i64;
pub type FieldId = i64;
pub type Timestamp = u64;
pub type ChannelName = String;

/// A primary key value. Milvus-style collections key on either an int64 or a
/// varchar field; both are carried through the ingest/delete/search path as
/// this enum so the bloom filter and segment indices stay primary-key-type
/// agnostic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryKey {
    Int64(i64),
    VarChar(String),
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int64(v) => write!(f, "{v}"),
            PrimaryKey::VarChar(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    Growing,
    Sealed,
    Indexing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoadType {
    Collection,
    Partition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    L2,
    InnerProduct,
    Cosine,
}

/// Position of a v-channel's consumer at the time a growing segment was
/// opened, or at the time a message pack begins. Carries enough information
/// to `Seek` the broker back to this point (spec.md §6.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChannelPosition {
    pub channel: ChannelName,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FieldSchema {
    pub field_id: FieldId,
    pub name: String,
    pub is_primary_key: bool,
    pub nullable: bool,
    pub is_vector: bool,
    pub dim: Option<usize>,
    pub metric_type: Option<MetricType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct CollectionSchema {
    pub fields: Vec<FieldSchema>,
}

impl CollectionSchema {
    pub fn primary_key_field(&self) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.is_primary_key)
    }

    pub fn vector_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| f.is_vector)
    }
}

/// One column of a columnar insert record. Only the two kinds the rest of
/// the system needs to reason about (vector data, and everything else
/// carried opaquely as JSON scalars) are modelled; full column typing lives
/// in the native kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldColumn {
    Vector(Vec<Vec<f32>>),
    Scalar(Vec<serde_json::Value>),
}

impl FieldColumn {
    pub fn len(&self) -> usize {
        match self {
            FieldColumn::Vector(v) => v.len(),
            FieldColumn::Scalar(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A columnar insert record as produced by the `FilterNode` -> `InsertNode`
/// translation step (spec.md §4.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertRecord {
    pub columns: std::collections::BTreeMap<FieldId, FieldColumn>,
}

#[derive(Debug, Clone)]
pub struct SearchPlan {
    pub vector_field: FieldId,
    pub queries: Vec<Vec<f32>>,
    pub topk: usize,
    pub metric: MetricType,
}

#[derive(Debug, Clone, Default)]
pub struct SearchPartialResult {
    pub segment_id: SegmentId,
    /// One entry per query, each a (score, primary key, offset) triple kept
    /// sorted best-first; ties are broken downstream by the reducer using
    /// `(score desc, segment_id asc, offset asc)` per spec.md §4.6.
    pub hits: Vec<Vec<(f32, PrimaryKey, u64)>>,
}

#[derive(Debug, Clone)]
pub struct RetrievePlan {
    pub ids: Vec<PrimaryKey>,
    pub output_fields: Vec<FieldId>,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievePartialResult {
    pub segment_id: SegmentId,
    pub rows: Vec<(PrimaryKey, std::collections::BTreeMap<FieldId, serde_json::Value>)>,
}
