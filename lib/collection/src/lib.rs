//! The `collection` crate owns everything a query node tracks about the
//! collections/partitions/segments it has been told to watch, and the
//! streaming ingest path that keeps growing segments current: `MetaReplica`
//! (spec.md §4.2), the per-channel `tSafe` watermark (spec.md §4.1), the
//! `FlowGraph` ingest pipeline (spec.md §4.3), and `SegmentLoader` (spec.md
//! §4.4). The message broker and object store this crate consumes are
//! modelled as traits (spec.md §1's external collaborators) with in-memory
//! reference implementations for tests and single-process deployments.

pub mod broker;
pub mod errors;
pub mod flow_graph;
pub mod meta_replica;
pub mod object_store;
pub mod segment_loader;
pub mod tsafe;

pub use broker::{ChannelBroker, DeleteMsg, InsertMsg, MessageBroker, MsgPack, StreamMsg};
pub use errors::{CollectionError, CollectionResult};
pub use flow_graph::FlowGraph;
pub use meta_replica::{Collection, ExcludedSegment, MetaReplica, Partition, Segment};
pub use object_store::{InMemoryObjectStore, ObjectStore};
pub use segment_loader::{SegmentLoadInfo, SegmentLoader};
pub use tsafe::TimestampWatcher;
