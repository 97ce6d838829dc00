//! In-process shard executors for router tests
//!
//! Each shard keeps documents per namespace, checks the routing version the
//! router stamped against the catalog and answers like a shard-local executor.
//! Faults can be queued per shard.

#![allow(dead_code)]

use async_trait::async_trait;
use minibulk::command::{ReplyItem, ShardWriteReply, ShardWriteRequest, WriteOperation};
use minibulk::common::{Error, ErrorCode, Result, StaleInfo, Status};
use minibulk::router::{
    ChunkMapTargeter, RoutingCatalog, RoutingTable, RoutingVersion, ShardClient, ShardId, Targeter,
};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub enum Fault {
    Unreachable,
    Shutdown,
    /// Every op answers with a stale version error
    Stale,
    /// First op answers with an always-fatal error
    Fatal,
}

#[derive(Default)]
struct ShardState {
    docs: HashMap<String, Vec<Value>>,
    executed_stmt_ids: HashSet<i32>,
    faults: VecDeque<Fault>,
    sticky_fault: Option<Fault>,
}

pub struct InMemoryShards {
    catalog: RoutingCatalog,
    shards: Mutex<HashMap<ShardId, ShardState>>,
    received: Mutex<Vec<(ShardId, ShardWriteRequest)>>,
}

impl InMemoryShards {
    pub fn new(catalog: RoutingCatalog) -> Self {
        Self {
            catalog,
            shards: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn seed(&self, shard: &str, ns: &str, doc: Value) {
        let mut shards = self.shards.lock().unwrap();
        shards
            .entry(ShardId::new(shard))
            .or_default()
            .docs
            .entry(ns.to_string())
            .or_default()
            .push(doc);
    }

    pub fn docs(&self, shard: &str, ns: &str) -> Vec<Value> {
        let shards = self.shards.lock().unwrap();
        shards
            .get(&ShardId::new(shard))
            .and_then(|s| s.docs.get(ns))
            .cloned()
            .unwrap_or_default()
    }

    /// Fail the next request to `shard`
    pub fn fail_next(&self, shard: &str, fault: Fault) {
        let mut shards = self.shards.lock().unwrap();
        shards.entry(ShardId::new(shard)).or_default().faults.push_back(fault);
    }

    /// Fail every request to `shard`
    pub fn fail_always(&self, shard: &str, fault: Fault) {
        let mut shards = self.shards.lock().unwrap();
        shards.entry(ShardId::new(shard)).or_default().sticky_fault = Some(fault);
    }

    /// Child requests in arrival order
    pub fn received(&self) -> Vec<(ShardId, ShardWriteRequest)> {
        self.received.lock().unwrap().clone()
    }

    /// Shard ids of received requests, with the op count of each
    pub fn received_shards(&self) -> Vec<(String, usize)> {
        self.received()
            .iter()
            .map(|(shard, request)| (shard.to_string(), request.ops.len()))
            .collect()
    }

    fn check_version(
        &self,
        shard: &ShardId,
        ns: &str,
        version: &Option<RoutingVersion>,
    ) -> Option<Status> {
        let Some(RoutingVersion::Versioned(sent)) = version else {
            return None;
        };
        let current = self
            .catalog
            .get(&ns.into())
            .unwrap()
            .and_then(|table| table.shard_version(shard));
        if current == Some(*sent) {
            return None;
        }
        Some(Status::stale(
            ErrorCode::StaleShardVersion,
            format!("shard {} has a different version for {}", shard, ns),
            StaleInfo {
                namespace: ns.to_string(),
                received: Some(sent.to_string()),
                wanted: current.map(|v| v.to_string()),
            },
        ))
    }
}

fn matches(doc: &Value, filter: &Value) -> bool {
    let Some(filter) = filter.as_object() else {
        return true;
    };
    filter.iter().all(|(field, cond)| {
        let value = doc.get(field);
        match cond.as_object() {
            Some(ops) if ops.keys().any(|k| k.starts_with('$')) => ops.iter().all(|(op, bound)| {
                let (Some(v), Some(b)) = (value.and_then(Value::as_i64), bound.as_i64()) else {
                    return op == "$eq" && value == Some(bound);
                };
                match op.as_str() {
                    "$eq" => v == b,
                    "$gt" => v > b,
                    "$gte" => v >= b,
                    "$lt" => v < b,
                    "$lte" => v <= b,
                    _ => false,
                }
            }),
            _ => value == Some(cond),
        }
    })
}

fn apply_set(doc: &mut Value, update: &Value) {
    let set = update.get("$set").and_then(Value::as_object);
    if let (Some(target), Some(set)) = (doc.as_object_mut(), set) {
        for (k, v) in set {
            target.insert(k.clone(), v.clone());
        }
    }
}

fn execute_op(docs: &mut Vec<Value>, op: &WriteOperation, idx: usize) -> ReplyItem {
    match op {
        WriteOperation::Insert(insert) => {
            let id = insert.document.get("_id");
            if id.is_some() && docs.iter().any(|d| d.get("_id") == id) {
                return ReplyItem::error(idx, Status::new(ErrorCode::DuplicateKey, "duplicate _id"));
            }
            docs.push(insert.document.clone());
            ReplyItem::success(idx, 1)
        }
        WriteOperation::Update(update) => {
            let mut n = 0;
            for doc in docs.iter_mut().filter(|d| matches(d, &update.filter)) {
                apply_set(doc, &update.update);
                n += 1;
                if !update.multi {
                    break;
                }
            }
            if n == 0 && update.upsert {
                let mut doc = Value::Object(Map::new());
                let filter = update.filter.as_object();
                if let (Some(target), Some(filter)) = (doc.as_object_mut(), filter) {
                    for (k, v) in filter {
                        target.insert(k.clone(), v.clone());
                    }
                }
                apply_set(&mut doc, &update.update);
                let id = doc.get("_id").cloned().unwrap_or(Value::from(docs.len() as u64));
                docs.push(doc);
                return ReplyItem::success(idx, 1).with_modified(0).with_upserted(id);
            }
            ReplyItem::success(idx, n).with_modified(n)
        }
        WriteOperation::Delete(delete) => {
            let mut n = 0;
            docs.retain(|d| {
                if (delete.multi || n == 0) && matches(d, &delete.filter) {
                    n += 1;
                    false
                } else {
                    true
                }
            });
            ReplyItem::success(idx, n)
        }
    }
}

#[async_trait]
impl ShardClient for InMemoryShards {
    async fn bulk_write(
        &self,
        shard: &ShardId,
        request: &ShardWriteRequest,
    ) -> Result<ShardWriteReply> {
        self.received
            .lock()
            .unwrap()
            .push((shard.clone(), request.clone()));

        let mut shards = self.shards.lock().unwrap();
        let state = shards.entry(shard.clone()).or_default();
        let fault = state.faults.pop_front().or_else(|| state.sticky_fault.clone());

        match fault {
            Some(Fault::Unreachable) => {
                return Err(Error::ConnectionFailed {
                    shard: shard.to_string(),
                    reason: "connection refused".into(),
                })
            }
            Some(Fault::Shutdown) => {
                return Err(Error::Shutdown(format!("{} stepping down", shard)));
            }
            Some(Fault::Fatal) => {
                let status = Status::new(
                    ErrorCode::IncompleteTransactionHistory,
                    "retry history truncated",
                );
                return Ok(ShardWriteReply::new(vec![ReplyItem::error(0, status)]));
            }
            Some(Fault::Stale) => {
                let items = (0..request.ops.len())
                    .map(|i| {
                        let ns = request.ns_info[request.ops[i].ns_index()].ns.to_string();
                        let status = Status::stale(
                            ErrorCode::StaleShardVersion,
                            "stale",
                            StaleInfo {
                                namespace: ns,
                                received: None,
                                wanted: None,
                            },
                        );
                        ReplyItem::error(i, status)
                    })
                    .collect();
                return Ok(ShardWriteReply::new(items));
            }
            None => {}
        }

        let mut reply = ShardWriteReply::default();
        for (i, op) in request.ops.iter().enumerate() {
            let info = &request.ns_info[op.ns_index()];
            let stale = self.check_version(shard, info.ns.as_str(), &info.routing_version);
            if let Some(stale) = stale {
                reply.items.push(ReplyItem::error(i, stale));
                // Shards stop at a stale version in both modes
                break;
            }

            if let Some(id) = request.stmt_ids.as_ref().and_then(|ids| ids.get(i)) {
                if !state.executed_stmt_ids.insert(*id) {
                    reply.retried_stmt_ids.push(*id);
                    reply.items.push(ReplyItem::success(i, 1));
                    continue;
                }
            }

            let docs = state.docs.entry(info.ns.to_string()).or_default();
            let item = execute_op(docs, op, i);
            let failed = !item.ok;
            reply.items.push(item);
            if failed && request.ordered {
                break;
            }
        }
        Ok(reply)
    }
}

pub fn targeters(catalog: &RoutingCatalog, namespaces: &[&str]) -> Vec<Arc<dyn Targeter>> {
    namespaces
        .iter()
        .map(|ns| {
            Arc::new(ChunkMapTargeter::new(*ns, catalog.clone()).unwrap()) as Arc<dyn Targeter>
        })
        .collect()
}

/// `foo.bar` split on `x` at 0 between shard-a and shard-b
pub fn two_shard_catalog() -> RoutingCatalog {
    RoutingCatalog::from_tables(vec![RoutingTable::split_range(
        "foo.bar", "x", 0, "shard-a", "shard-b", 1,
    )])
}
