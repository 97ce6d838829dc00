//! Write routing: targeting, batching, dispatch and reply reconciliation

pub mod batch;
pub mod bulk_write_op;
pub mod catalog;
pub mod exec;
pub mod placement;
pub mod shard_client;
pub mod targeter;
pub mod tracked_errors;
pub mod write_op;

pub use batch::{
    BatchBuilder, BatchLimits, TargetedBatchMap, TargetedWrite, TargetedWriteBatch, WriteType,
};
pub use bulk_write_op::BulkWriteOp;
pub use catalog::{Chunk, RoutingCatalog, RoutingTable, ShardKeyPattern};
pub use exec::execute;
pub use placement::ChunkMapTargeter;
pub use shard_client::{HttpShardClient, ShardClient};
pub use targeter::{ChunkVersion, RoutingVersion, ShardEndpoint, ShardId, Targeter};
pub use tracked_errors::TrackedErrors;
pub use write_op::{WriteOp, WriteOpState};
