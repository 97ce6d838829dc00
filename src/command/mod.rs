//! Bulk write command types
//!
//! Requests arrive already parsed; this module only defines their shape,
//! the projection sent to each shard and the replies flowing back.

pub mod reply;
pub mod request;

pub use reply::{BulkWriteReplyInfo, ReplyItem, ShardWriteReply};
pub use request::{
    BulkWriteRequest, DeleteOp, InsertOp, Namespace, NamespaceInfo, OpKind, ShardWriteRequest,
    UpdateOp, WriteOperation,
};
