//! Chunk-map targeting
//!
//! [`ChunkMapTargeter`] caches one [`RoutingTable`] snapshot per namespace and
//! places writes by their shard key:
//! - inserts go to the chunk owning the document's key
//! - updates and deletes with an equality on the shard key go to one shard
//! - range predicates (range-sharded only) go to every overlapping chunk's shard
//! - anything else goes to every shard holding the collection
//!
//! A write sent to one shard is pinned to that shard's version; a write sent to
//! several shards carries [`RoutingVersion::Ignored`].

use crate::command::{Namespace, WriteOperation};
use crate::common::{Error, Result, Status};
use crate::router::catalog::{RoutingCatalog, RoutingTable, ShardKeyPattern};
use crate::router::targeter::{RoutingVersion, ShardEndpoint, ShardId, Targeter};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use tracing::debug;

/// What a filter says about the shard key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyPredicate {
    Exact(i64),
    /// Half-open `[lo, hi)`
    Range { lo: Option<i64>, hi: Option<i64> },
    Unknown,
}

fn analyze_filter(pattern: &ShardKeyPattern, filter: &Value) -> KeyPredicate {
    let Some(value) = filter.get(pattern.field()) else {
        return KeyPredicate::Unknown;
    };

    let ops = match value {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => ops,
        other => return pattern.key_for(other).map_or(KeyPredicate::Unknown, KeyPredicate::Exact),
    };

    if let Some(eq) = ops.get("$eq") {
        return pattern.key_for(eq).map_or(KeyPredicate::Unknown, KeyPredicate::Exact);
    }
    if pattern.is_hashed() {
        return KeyPredicate::Unknown;
    }

    let mut lo: Option<i64> = None;
    let mut hi: Option<i64> = None;
    for (op, bound) in ops {
        let Some(bound) = bound.as_i64() else {
            return KeyPredicate::Unknown;
        };
        let (new_lo, new_hi) = match op.as_str() {
            "$gt" => (Some(bound.saturating_add(1)), None),
            "$gte" => (Some(bound), None),
            "$lt" => (None, Some(bound)),
            // `None` upper bound is unbounded
            "$lte" => match bound.checked_add(1) {
                Some(next) => (None, Some(next)),
                None => (None, None),
            },
            _ => return KeyPredicate::Unknown,
        };
        if new_lo.is_some() {
            lo = lo.max(new_lo);
        }
        if let Some(h) = new_hi {
            hi = Some(hi.map_or(h, |cur| cur.min(h)));
        }
    }
    KeyPredicate::Range { lo, hi }
}

fn endpoints_for(table: &RoutingTable, shards: BTreeSet<ShardId>) -> Result<Vec<ShardEndpoint>> {
    if shards.len() == 1 {
        let shard = shards.into_iter().next().ok_or_else(|| could_not_target(table, "no shards"))?;
        let version = table
            .shard_version(&shard)
            .ok_or_else(|| could_not_target(table, format!("shard {} owns no chunks", shard)))?;
        return Ok(vec![ShardEndpoint::new(shard, RoutingVersion::Versioned(version))]);
    }
    Ok(shards.into_iter().map(ShardEndpoint::ignored).collect())
}

fn could_not_target(table: &RoutingTable, reason: impl Into<String>) -> Error {
    Error::CouldNotTarget {
        namespace: table.ns.to_string(),
        reason: reason.into(),
    }
}

pub struct ChunkMapTargeter {
    ns: Namespace,
    catalog: RoutingCatalog,
    table: RwLock<RoutingTable>,
    needs_refresh: AtomicBool,
    refreshes: AtomicUsize,
}

impl ChunkMapTargeter {
    /// Load the current routing table of `ns` from `catalog`
    pub fn new(ns: impl Into<Namespace>, catalog: RoutingCatalog) -> Result<Self> {
        let ns = ns.into();
        let table = catalog
            .get(&ns)?
            .ok_or_else(|| Error::NamespaceDropped(ns.to_string()))?;
        Ok(Self {
            ns,
            catalog,
            table: RwLock::new(table),
            needs_refresh: AtomicBool::new(false),
            refreshes: AtomicUsize::new(0),
        })
    }

    /// Refreshes that actually reloaded the table
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn target_insert(&self, table: &RoutingTable, document: &Value) -> Result<Vec<ShardEndpoint>> {
        let field = table.pattern.field();
        let value = document.get(field).ok_or_else(|| {
            could_not_target(table, format!("document does not contain shard key {}", field))
        })?;
        let key = table
            .pattern
            .key_for(value)
            .ok_or_else(|| {
                could_not_target(table, format!("cannot place shard key value {}", value))
            })?;
        let chunk = table
            .chunk_for_key(key)
            .ok_or_else(|| could_not_target(table, format!("no chunk owns key {}", key)))?;
        endpoints_for(table, BTreeSet::from([chunk.shard.clone()]))
    }

    fn target_by_filter(
        &self,
        table: &RoutingTable,
        filter: &Value,
        upsert: bool,
    ) -> Result<Vec<ShardEndpoint>> {
        let predicate = analyze_filter(&table.pattern, filter);
        if upsert && !matches!(predicate, KeyPredicate::Exact(_)) {
            return Err(could_not_target(
                table,
                format!("upsert filter must contain an equality on {}", table.pattern.field()),
            ));
        }

        let shards = match predicate {
            KeyPredicate::Exact(key) => {
                let chunk = table
                    .chunk_for_key(key)
                    .ok_or_else(|| could_not_target(table, format!("no chunk owns key {}", key)))?;
                BTreeSet::from([chunk.shard.clone()])
            }
            KeyPredicate::Range { lo, hi } => {
                let shards = table.shards_for_range(lo, hi);
                if shards.is_empty() {
                    // Empty range: any one shard gives the right answer
                    table.chunks.first().map(|c| c.shard.clone()).into_iter().collect()
                } else {
                    shards
                }
            }
            KeyPredicate::Unknown => table.all_shards(),
        };
        endpoints_for(table, shards)
    }
}

#[async_trait]
impl Targeter for ChunkMapTargeter {
    fn namespace(&self) -> &Namespace {
        &self.ns
    }

    fn target(&self, op: &WriteOperation) -> Result<Vec<ShardEndpoint>> {
        let table = self
            .table
            .read()
            .map_err(|_| Error::Catalog("routing table lock poisoned".into()))?;
        match op {
            WriteOperation::Insert(insert) => self.target_insert(&table, &insert.document),
            WriteOperation::Update(update) => {
                self.target_by_filter(&table, &update.filter, update.upsert)
            }
            WriteOperation::Delete(delete) => self.target_by_filter(&table, &delete.filter, false),
        }
    }

    fn note_could_not_target(&self) {
        self.needs_refresh.store(true, Ordering::SeqCst);
    }

    fn note_stale_routing_response(&self, endpoint: &ShardEndpoint, stale: &Status) {
        debug!(
            ns = %self.ns,
            shard = %endpoint.shard_id,
            sent = %endpoint.version,
            wanted = ?stale.stale_info.as_ref().and_then(|info| info.wanted.as_deref()),
            "Stale routing response"
        );
        self.needs_refresh.store(true, Ordering::SeqCst);
    }

    async fn refresh(&self) -> Result<bool> {
        if !self.needs_refresh.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let latest = self
            .catalog
            .get(&self.ns)?
            .ok_or_else(|| Error::NamespaceDropped(self.ns.to_string()))?;

        let mut table = self
            .table
            .write()
            .map_err(|_| Error::Catalog("routing table lock poisoned".into()))?;
        if latest.epoch() != table.epoch() {
            // Dropped and recreated under the same name
            return Err(Error::NamespaceDropped(self.ns.to_string()));
        }

        let changed = *table != latest;
        debug!(
            ns = %self.ns,
            changed,
            version = ?latest.collection_version(),
            "Refreshed routing table"
        );
        *table = latest;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(changed)
    }
}
