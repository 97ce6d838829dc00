//! Targeting contract between the router and routing metadata
//!
//! A [`Targeter`] answers "which shards must receive this write" for one
//! namespace, and is told about stale routing so it can refresh before the
//! next round.

use crate::command::{Namespace, WriteOperation};
use crate::common::{Result, Status};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shard identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Placement version of a collection. `epoch` changes when the collection is
/// dropped and recreated; `major.minor` grow with chunk migrations and splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub epoch: u64,
    pub major: u32,
    pub minor: u32,
}

impl ChunkVersion {
    pub fn new(epoch: u64, major: u32, minor: u32) -> Self {
        Self {
            epoch,
            major,
            minor,
        }
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}

/// Version stamped on a write sent to a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingVersion {
    /// Multi-target writes are not pinned to a metadata snapshot
    Ignored,
    Versioned(ChunkVersion),
}

impl fmt::Display for RoutingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingVersion::Ignored => f.write_str("ignored"),
            RoutingVersion::Versioned(v) => v.fmt(f),
        }
    }
}

/// Where one piece of a write goes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardEndpoint {
    pub shard_id: ShardId,
    pub version: RoutingVersion,
}

impl ShardEndpoint {
    pub fn new(shard_id: impl Into<ShardId>, version: RoutingVersion) -> Self {
        Self {
            shard_id: shard_id.into(),
            version,
        }
    }

    pub fn ignored(shard_id: impl Into<ShardId>) -> Self {
        Self::new(shard_id, RoutingVersion::Ignored)
    }
}

/// Routing metadata for one namespace
#[async_trait]
pub trait Targeter: Send + Sync {
    fn namespace(&self) -> &Namespace;

    /// Endpoints that must receive `op`. More than one only for writes whose
    /// predicate spans several shards.
    fn target(&self, op: &WriteOperation) -> Result<Vec<ShardEndpoint>>;

    /// An op could not be targeted; refresh on the next `refresh` call.
    fn note_could_not_target(&self);

    /// A shard rejected `endpoint`'s version as stale.
    fn note_stale_routing_response(&self, endpoint: &ShardEndpoint, stale: &Status);

    /// Reload routing metadata if something was noted since the last refresh.
    /// Returns whether the metadata changed. Fails with
    /// [`crate::Error::NamespaceDropped`] when the collection no longer exists.
    async fn refresh(&self) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_compare() {
        let a = ShardEndpoint::new(
            "shard-a",
            RoutingVersion::Versioned(ChunkVersion::new(1, 2, 0)),
        );
        let a_ignored = ShardEndpoint::ignored("shard-a");
        assert_eq!(a.shard_id, a_ignored.shard_id);
        assert_ne!(a.version, a_ignored.version);
        assert_eq!(a.version.to_string(), "2|0||1");
    }

    #[test]
    fn test_version_serde() {
        let v = RoutingVersion::Versioned(ChunkVersion::new(7, 1, 3));
        let json = serde_json::to_string(&v).unwrap();
        let back: RoutingVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
        assert_eq!(serde_json::to_string(&RoutingVersion::Ignored).unwrap(), "\"ignored\"");
    }
}
