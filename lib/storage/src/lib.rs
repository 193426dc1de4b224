//! The `storage` crate owns the per-shard distribution state machine
//! (`ShardCluster`, spec.md §4.5), the guarantee-ts query gate and
//! reduction layer (`QueryCollection`/`QueryShard`, spec.md §4.6), the
//! per-node task serialization queue (`TaskScheduler`, spec.md §4.7), and
//! the node's own Init/Register/Stop lifecycle (spec.md §4.8/§2.8). The
//! catalog and peer-RPC collaborators this crate calls out to are modelled
//! as traits with in-memory/in-process reference implementations
//! (spec.md §4.9).

pub mod errors;
pub mod external;
pub mod lifecycle;
pub mod query_collection;
pub mod shard_cluster;
pub mod task_scheduler;
pub mod types;

pub use errors::{StorageError, StorageResult};
pub use lifecycle::{NodeLifecycle, NodeState};
pub use query_collection::{QueryCollection, QueryShard};
pub use shard_cluster::{ClusterAllocation, ShardCluster};
pub use task_scheduler::{Task, TaskOutcome, TaskScheduler};
