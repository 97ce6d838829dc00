//! Authoritative routing tables
//!
//! The catalog maps each sharded namespace to a list of chunks: half-open
//! shard-key ranges owned by one shard, each carrying the [`ChunkVersion`] at
//! which it last moved or split. Targeters cache a snapshot and come back here
//! when a shard reports that snapshot as stale.

use crate::command::Namespace;
use crate::common::{Error, Result};
use crate::router::targeter::{ChunkVersion, ShardId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// How documents map to shard-key values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum ShardKeyPattern {
    /// Integer field, ranges over its value
    Range { field: String },
    /// Any field, ranges over a BLAKE3 hash of its value
    Hashed { field: String },
}

impl ShardKeyPattern {
    pub fn field(&self) -> &str {
        match self {
            ShardKeyPattern::Range { field } | ShardKeyPattern::Hashed { field } => field,
        }
    }

    pub fn is_hashed(&self) -> bool {
        matches!(self, ShardKeyPattern::Hashed { .. })
    }

    /// Shard-key value for a field value, if it can be placed
    pub fn key_for(&self, value: &Value) -> Option<i64> {
        match self {
            ShardKeyPattern::Range { .. } => value.as_i64(),
            ShardKeyPattern::Hashed { .. } => Some(hashed_key(value)),
        }
    }
}

/// Compute the hashed shard-key value of a JSON value
pub fn hashed_key(value: &Value) -> i64 {
    let hash = blake3::hash(value.to_string().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    i64::from_le_bytes(bytes)
}

/// A contiguous key range `[min, max)` owned by one shard. `None` bounds are
/// unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub shard: ShardId,
    pub version: ChunkVersion,
}

impl Chunk {
    pub fn contains(&self, key: i64) -> bool {
        self.min.map_or(true, |min| key >= min) && self.max.map_or(true, |max| key < max)
    }

    /// Whether the chunk intersects `[lo, hi)`
    pub fn overlaps(&self, lo: Option<i64>, hi: Option<i64>) -> bool {
        let below_max = match (lo, self.max) {
            (Some(lo), Some(max)) => lo < max,
            _ => true,
        };
        let above_min = match (self.min, hi) {
            (Some(min), Some(hi)) => min < hi,
            _ => true,
        };
        below_max && above_min
    }
}

/// Routing table of one namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub ns: Namespace,
    pub pattern: ShardKeyPattern,
    pub chunks: Vec<Chunk>,
}

impl RoutingTable {
    pub fn new(ns: impl Into<Namespace>, pattern: ShardKeyPattern, mut chunks: Vec<Chunk>) -> Self {
        chunks.sort_by_key(|c| c.min.unwrap_or(i64::MIN));
        Self {
            ns: ns.into(),
            pattern,
            chunks,
        }
    }

    /// Single chunk covering the whole key space
    pub fn single_shard(
        ns: impl Into<Namespace>,
        field: impl Into<String>,
        shard: impl Into<ShardId>,
        epoch: u64,
    ) -> Self {
        Self::new(
            ns,
            ShardKeyPattern::Range {
                field: field.into(),
            },
            vec![Chunk {
                min: None,
                max: None,
                shard: shard.into(),
                version: ChunkVersion::new(epoch, 1, 0),
            }],
        )
    }

    /// Two chunks split at `split`: `[-inf, split)` on `low`, `[split, +inf)` on `high`
    pub fn split_range(
        ns: impl Into<Namespace>,
        field: impl Into<String>,
        split: i64,
        low: impl Into<ShardId>,
        high: impl Into<ShardId>,
        epoch: u64,
    ) -> Self {
        Self::new(
            ns,
            ShardKeyPattern::Range {
                field: field.into(),
            },
            vec![
                Chunk {
                    min: None,
                    max: Some(split),
                    shard: low.into(),
                    version: ChunkVersion::new(epoch, 1, 0),
                },
                Chunk {
                    min: Some(split),
                    max: None,
                    shard: high.into(),
                    version: ChunkVersion::new(epoch, 1, 1),
                },
            ],
        )
    }

    pub fn epoch(&self) -> Option<u64> {
        self.chunks.first().map(|c| c.version.epoch)
    }

    /// Highest chunk version in the collection
    pub fn collection_version(&self) -> Option<ChunkVersion> {
        self.chunks.iter().map(|c| c.version).max()
    }

    /// Highest chunk version among the chunks `shard` owns
    pub fn shard_version(&self, shard: &ShardId) -> Option<ChunkVersion> {
        self.chunks
            .iter()
            .filter(|c| &c.shard == shard)
            .map(|c| c.version)
            .max()
    }

    pub fn chunk_for_key(&self, key: i64) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.contains(key))
    }

    pub fn shards_for_range(&self, lo: Option<i64>, hi: Option<i64>) -> BTreeSet<ShardId> {
        self.chunks
            .iter()
            .filter(|c| c.overlaps(lo, hi))
            .map(|c| c.shard.clone())
            .collect()
    }

    pub fn all_shards(&self) -> BTreeSet<ShardId> {
        self.chunks.iter().map(|c| c.shard.clone()).collect()
    }
}

/// Shared, in-memory catalog of routing tables
#[derive(Debug, Clone, Default)]
pub struct RoutingCatalog {
    tables: Arc<RwLock<HashMap<Namespace, RoutingTable>>>,
}

impl RoutingCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables(tables: Vec<RoutingTable>) -> Self {
        let catalog = Self::new();
        if let Ok(mut guard) = catalog.tables.write() {
            for table in tables {
                guard.insert(table.ns.clone(), table);
            }
        }
        catalog
    }

    /// Parse a JSON array of routing tables
    pub fn from_json(json: &str) -> Result<Self> {
        let tables: Vec<RoutingTable> = serde_json::from_str(json)?;
        Ok(Self::from_tables(tables))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<Namespace, RoutingTable>>> {
        self.tables
            .read()
            .map_err(|_| Error::Catalog("routing catalog lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<Namespace, RoutingTable>>> {
        self.tables
            .write()
            .map_err(|_| Error::Catalog("routing catalog lock poisoned".into()))
    }

    pub fn install(&self, table: RoutingTable) -> Result<()> {
        self.write()?.insert(table.ns.clone(), table);
        Ok(())
    }

    pub fn get(&self, ns: &Namespace) -> Result<Option<RoutingTable>> {
        Ok(self.read()?.get(ns).cloned())
    }

    pub fn namespaces(&self) -> Result<Vec<Namespace>> {
        let mut names: Vec<Namespace> = self.read()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn drop_collection(&self, ns: &Namespace) -> Result<bool> {
        Ok(self.write()?.remove(ns).is_some())
    }

    /// Move the chunk containing `key` to `to`, bumping the major version.
    /// Returns the new collection version.
    pub fn move_chunk(
        &self,
        ns: &Namespace,
        key: i64,
        to: impl Into<ShardId>,
    ) -> Result<ChunkVersion> {
        let mut tables = self.write()?;
        let table = tables
            .get_mut(ns)
            .ok_or_else(|| Error::NamespaceDropped(ns.to_string()))?;
        let current = table
            .collection_version()
            .ok_or_else(|| Error::Catalog(format!("{} has no chunks", ns)))?;
        let next = ChunkVersion::new(current.epoch, current.major + 1, 0);
        let chunk = table
            .chunks
            .iter_mut()
            .find(|c| c.contains(key))
            .ok_or_else(|| Error::Catalog(format!("no chunk of {} owns key {}", ns, key)))?;
        chunk.shard = to.into();
        chunk.version = next;
        Ok(next)
    }

    /// Split the chunk containing `at` into `[min, at)` and `[at, max)`,
    /// bumping the minor version of both halves.
    pub fn split_chunk(&self, ns: &Namespace, at: i64) -> Result<ChunkVersion> {
        let mut tables = self.write()?;
        let table = tables
            .get_mut(ns)
            .ok_or_else(|| Error::NamespaceDropped(ns.to_string()))?;
        let current = table
            .collection_version()
            .ok_or_else(|| Error::Catalog(format!("{} has no chunks", ns)))?;
        let pos = table
            .chunks
            .iter()
            .position(|c| c.contains(at) && c.min != Some(at))
            .ok_or_else(|| Error::Catalog(format!("cannot split {} at {}", ns, at)))?;

        let left_version = ChunkVersion::new(current.epoch, current.major, current.minor + 1);
        let right_version = ChunkVersion::new(current.epoch, current.major, current.minor + 2);
        let original = table.chunks[pos].clone();
        table.chunks[pos] = Chunk {
            max: Some(at),
            version: left_version,
            ..original.clone()
        };
        table.chunks.insert(
            pos + 1,
            Chunk {
                min: Some(at),
                version: right_version,
                ..original
            },
        );
        Ok(right_version)
    }
}
