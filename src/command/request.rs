//! Bulk write requests: the client request and the per-shard child request

use crate::common::{Error, Result};
use crate::router::targeter::RoutingVersion;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Fully qualified collection name (`db.collection`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(ns: impl Into<String>) -> Self {
        Self(ns.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A namespace addressed by the request, plus the routing version stamped on
/// it when the request is projected onto a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub ns: Namespace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_version: Option<RoutingVersion>,
}

impl NamespaceInfo {
    pub fn new(ns: impl Into<Namespace>) -> Self {
        Self {
            ns: ns.into(),
            routing_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertOp {
    pub ns_index: usize,
    pub document: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOp {
    pub ns_index: usize,
    pub filter: Value,
    pub update: Value,
    #[serde(default)]
    pub multi: bool,
    #[serde(default)]
    pub upsert: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteOp {
    pub ns_index: usize,
    pub filter: Value,
    #[serde(default)]
    pub multi: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

/// One write in a bulk request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOperation {
    Insert(InsertOp),
    Update(UpdateOp),
    Delete(DeleteOp),
}

impl WriteOperation {
    pub fn insert(ns_index: usize, document: Value) -> Self {
        WriteOperation::Insert(InsertOp { ns_index, document })
    }

    pub fn update(ns_index: usize, filter: Value, update: Value) -> Self {
        WriteOperation::Update(UpdateOp {
            ns_index,
            filter,
            update,
            multi: false,
            upsert: false,
        })
    }

    pub fn update_many(ns_index: usize, filter: Value, update: Value) -> Self {
        WriteOperation::Update(UpdateOp {
            ns_index,
            filter,
            update,
            multi: true,
            upsert: false,
        })
    }

    pub fn upsert(ns_index: usize, filter: Value, update: Value) -> Self {
        WriteOperation::Update(UpdateOp {
            ns_index,
            filter,
            update,
            multi: false,
            upsert: true,
        })
    }

    pub fn delete(ns_index: usize, filter: Value) -> Self {
        WriteOperation::Delete(DeleteOp {
            ns_index,
            filter,
            multi: false,
        })
    }

    pub fn delete_many(ns_index: usize, filter: Value) -> Self {
        WriteOperation::Delete(DeleteOp {
            ns_index,
            filter,
            multi: true,
        })
    }

    pub fn ns_index(&self) -> usize {
        match self {
            WriteOperation::Insert(op) => op.ns_index,
            WriteOperation::Update(op) => op.ns_index,
            WriteOperation::Delete(op) => op.ns_index,
        }
    }

    pub(crate) fn set_ns_index(&mut self, ns_index: usize) {
        match self {
            WriteOperation::Insert(op) => op.ns_index = ns_index,
            WriteOperation::Update(op) => op.ns_index = ns_index,
            WriteOperation::Delete(op) => op.ns_index = ns_index,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            WriteOperation::Insert(_) => OpKind::Insert,
            WriteOperation::Update(_) => OpKind::Update,
            WriteOperation::Delete(_) => OpKind::Delete,
        }
    }

    /// Selection predicate (updates and deletes only)
    pub fn filter(&self) -> Option<&Value> {
        match self {
            WriteOperation::Insert(_) => None,
            WriteOperation::Update(op) => Some(&op.filter),
            WriteOperation::Delete(op) => Some(&op.filter),
        }
    }

    /// Whether the write may touch more than one document
    pub fn is_multi(&self) -> bool {
        match self {
            WriteOperation::Insert(_) => false,
            WriteOperation::Update(op) => op.multi,
            WriteOperation::Delete(op) => op.multi,
        }
    }

    pub fn is_upsert(&self) -> bool {
        matches!(self, WriteOperation::Update(op) if op.upsert)
    }
}

fn default_ordered() -> bool {
    true
}

/// The client's bulk write request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkWriteRequest {
    pub ops: Vec<WriteOperation>,
    pub ns_info: Vec<NamespaceInfo>,
    #[serde(default = "default_ordered")]
    pub ordered: bool,
    #[serde(default)]
    pub bypass_document_validation: bool,
    #[serde(default, rename = "let", skip_serializing_if = "Option::is_none")]
    pub let_params: Option<Value>,
    /// Base statement id; op `i` gets `stmt_id + i`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stmt_id: Option<i32>,
    /// Explicit statement id per op
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stmt_ids: Option<Vec<i32>>,
}

impl BulkWriteRequest {
    pub fn new(ops: Vec<WriteOperation>, ns_info: Vec<NamespaceInfo>) -> Self {
        Self {
            ops,
            ns_info,
            ordered: true,
            bypass_document_validation: false,
            let_params: None,
            stmt_id: None,
            stmt_ids: None,
        }
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn with_stmt_id(mut self, base: i32) -> Self {
        self.stmt_id = Some(base);
        self
    }

    pub fn with_stmt_ids(mut self, ids: Vec<i32>) -> Self {
        self.stmt_ids = Some(ids);
        self
    }

    pub fn with_let(mut self, let_params: Value) -> Self {
        self.let_params = Some(let_params);
        self
    }

    /// Whether child requests carry statement ids
    pub fn is_retryable(&self) -> bool {
        self.stmt_ids.is_some() || self.stmt_id.is_some()
    }

    /// Statement id of op `op_index`, if the request carries any
    pub fn statement_id(&self, op_index: usize) -> Option<i32> {
        if let Some(ids) = &self.stmt_ids {
            return ids.get(op_index).copied();
        }
        let base = self.stmt_id?;
        i32::try_from(op_index)
            .ok()
            .and_then(|offset| base.checked_add(offset))
    }

    /// Reject requests the router cannot execute
    pub fn validate(&self) -> Result<()> {
        if self.ops.is_empty() {
            return Err(Error::InvalidRequest("no write operations".into()));
        }
        if let Some(op) = self.ops.iter().find(|op| op.ns_index() >= self.ns_info.len()) {
            return Err(Error::InvalidRequest(format!(
                "namespace index {} out of range ({} namespaces)",
                op.ns_index(),
                self.ns_info.len()
            )));
        }
        if let Some(ids) = &self.stmt_ids {
            if ids.len() != self.ops.len() {
                return Err(Error::InvalidRequest(format!(
                    "{} statement ids for {} operations",
                    ids.len(),
                    self.ops.len()
                )));
            }
        } else if let Some(base) = self.stmt_id {
            if self.statement_id(self.ops.len() - 1).is_none() {
                return Err(Error::InvalidRequest(format!(
                    "statement id base {} overflows for {} operations",
                    base,
                    self.ops.len()
                )));
            }
        }
        Ok(())
    }
}

/// Request sent to one shard for one round. Operations are copies of the
/// client's ops with `ns_index` remapped into this request's `ns_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardWriteRequest {
    pub ops: Vec<WriteOperation>,
    pub ns_info: Vec<NamespaceInfo>,
    pub ordered: bool,
    #[serde(default)]
    pub bypass_document_validation: bool,
    #[serde(default, rename = "let", skip_serializing_if = "Option::is_none")]
    pub let_params: Option<Value>,
    /// Parallel to `ops` when the client request is retryable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stmt_ids: Option<Vec<i32>>,
    /// Ties the child request to the client request in shard logs
    pub correlation_id: Uuid,
}
