//! Per-operation reply items, shard replies and the client reply

use crate::common::{ErrorCode, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one operation. Shards index items by position in the child
/// request; the client reply indexes them by position in the original request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyItem {
    pub idx: usize,
    pub ok: bool,
    #[serde(default)]
    pub n: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_modified: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upserted: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_stmt_id: Option<i32>,
}

impl ReplyItem {
    pub fn success(idx: usize, n: u64) -> Self {
        Self {
            idx,
            ok: true,
            n,
            n_modified: None,
            upserted: None,
            status: None,
            retried_stmt_id: None,
        }
    }

    pub fn error(idx: usize, status: Status) -> Self {
        Self {
            idx,
            ok: false,
            n: 0,
            n_modified: None,
            upserted: None,
            status: Some(status),
            retried_stmt_id: None,
        }
    }

    pub fn with_modified(mut self, n_modified: u64) -> Self {
        self.n_modified = Some(n_modified);
        self
    }

    pub fn with_upserted(mut self, id: Value) -> Self {
        self.upserted = Some(id);
        self
    }

    /// Status of a failed item. A shard that reports `ok: false` without a
    /// status still yields an error.
    pub fn error_status(&self) -> Option<Status> {
        if self.ok {
            return None;
        }
        Some(
            self.status
                .clone()
                .unwrap_or_else(|| Status::new(ErrorCode::WriteFailed, "shard reported failure")),
        )
    }
}

/// Reply from the shard-local executor for one child request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardWriteReply {
    /// Parallel to the child request's ops; may be shorter after an error
    pub items: Vec<ReplyItem>,
    /// Statement ids recognised as already executed
    #[serde(default)]
    pub retried_stmt_ids: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_concern_error: Option<Status>,
}

impl ShardWriteReply {
    pub fn new(items: Vec<ReplyItem>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }
}

/// Final reply returned to the client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkWriteReplyInfo {
    /// One item per finished operation, in original index order
    pub items: Vec<ReplyItem>,
    pub num_errors: usize,
    pub retried_stmt_ids: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_concern_error: Option<Status>,
}

impl BulkWriteReplyInfo {
    pub fn n_total(&self) -> u64 {
        self.items.iter().filter(|item| item.ok).map(|item| item.n).sum()
    }
}
