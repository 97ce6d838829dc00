//! Round batching
//!
//! [`BatchBuilder`] groups targeted writes into per-shard batches for one round.
//! Two writes share a shard batch only if they carry the same routing version
//! for their namespace on that shard, so a multi-target write (version
//! `Ignored`) never rides with a pinned single-target write.
//!
//! Ordered requests grow a single batch set until the first op that does not
//! fit: every op after the first must target the same single shard with the
//! same version, and a multi-target op always travels alone. Unordered
//! requests scan every op and only close the shards that conflict.

use crate::command::WriteOperation;
use crate::common::RouterConfig;
use crate::router::targeter::{RoutingVersion, ShardEndpoint, ShardId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Fixed per-op overhead on top of its JSON size
pub const PER_OP_OVERHEAD_BYTES: usize = 16;

/// Extra bytes when the op carries a statement id
pub const STMT_ID_OVERHEAD_BYTES: usize = 8;

/// Estimated size of `op` inside a child request
pub fn estimate_op_size(op: &WriteOperation, has_stmt_id: bool) -> usize {
    let body = serde_json::to_string(op).map(|s| s.len()).unwrap_or(0);
    let stmt = if has_stmt_id { STMT_ID_OVERHEAD_BYTES } else { 0 };
    body + PER_OP_OVERHEAD_BYTES + stmt
}

/// Dispatch path the retry loop must take for a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    Ordinary,
    /// A single non-multi update/delete sent to several shards
    WithoutShardKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_ops: usize,
    pub max_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self::from(&RouterConfig::default())
    }
}

impl From<&RouterConfig> for BatchLimits {
    fn from(config: &RouterConfig) -> Self {
        Self {
            max_ops: config.max_batch_ops,
            max_bytes: config.max_batch_bytes,
        }
    }
}

/// One op's piece destined for one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetedWrite {
    pub op_index: usize,
    /// Position of the endpoint among the op's endpoints this round
    pub child_index: usize,
    pub ns_index: usize,
    pub endpoint: ShardEndpoint,
}

/// Writes sent to one shard in one round, in original op order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetedWriteBatch {
    pub shard_id: ShardId,
    pub writes: Vec<TargetedWrite>,
    pub estimated_size_bytes: usize,
}

impl TargetedWriteBatch {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            writes: Vec::new(),
            estimated_size_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn op_indexes(&self) -> Vec<usize> {
        self.writes.iter().map(|w| w.op_index).collect()
    }
}

pub type TargetedBatchMap = BTreeMap<ShardId, TargetedWriteBatch>;

/// Verdict on one op
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Left Ready for a later round; keep scanning
    Deferred,
    /// Left Ready; the round is closed
    Stop,
}

#[derive(Debug)]
pub struct BatchBuilder {
    ordered: bool,
    limits: BatchLimits,
    batches: TargetedBatchMap,
    versions: HashMap<(ShardId, usize), RoutingVersion>,
    closed: BTreeSet<ShardId>,
    write_type: WriteType,
    /// An op with several endpoints is already buffered
    buffered_multi: bool,
    stopped: bool,
}

impl BatchBuilder {
    pub fn new(ordered: bool, limits: BatchLimits) -> Self {
        Self {
            ordered,
            limits,
            batches: TargetedBatchMap::new(),
            versions: HashMap::new(),
            closed: BTreeSet::new(),
            write_type: WriteType::Ordinary,
            buffered_multi: false,
            stopped: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Close the round; later `admit` calls return [`Admission::Stop`]
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Offer op `op_index` with its endpoints. `isolated` ops must travel
    /// alone in their round.
    pub fn admit(
        &mut self,
        op_index: usize,
        ns_index: usize,
        endpoints: &[ShardEndpoint],
        size_bytes: usize,
        isolated: bool,
    ) -> Admission {
        if self.stopped {
            return Admission::Stop;
        }

        if isolated {
            if self.batches.is_empty() {
                self.add(op_index, ns_index, endpoints, size_bytes);
                self.write_type = WriteType::WithoutShardKey;
                self.stopped = true;
                return Admission::Accepted;
            }
            if self.ordered {
                self.stopped = true;
                return Admission::Stop;
            }
            return Admission::Deferred;
        }

        let multi = endpoints.len() > 1 || self.buffered_multi;
        if self.ordered && multi && !self.batches.is_empty() {
            self.stopped = true;
            return Admission::Stop;
        }

        let conflicts = self.conflicting_shards(ns_index, endpoints, size_bytes);
        if conflicts.is_empty() {
            self.add(op_index, ns_index, endpoints, size_bytes);
            return Admission::Accepted;
        }

        if self.ordered {
            self.stopped = true;
            Admission::Stop
        } else {
            self.closed.extend(conflicts);
            Admission::Deferred
        }
    }

    fn conflicting_shards(
        &self,
        ns_index: usize,
        endpoints: &[ShardEndpoint],
        size_bytes: usize,
    ) -> Vec<ShardId> {
        let mut conflicts = Vec::new();
        for endpoint in endpoints {
            let shard = &endpoint.shard_id;
            let incompatible = match self.batches.get(shard) {
                // Ordered rounds never open a new shard once started
                None => self.ordered && !self.batches.is_empty(),
                Some(batch) => {
                    let version_mismatch = self
                        .versions
                        .get(&(shard.clone(), ns_index))
                        .map_or(false, |v| *v != endpoint.version);
                    version_mismatch || self.over_limits(batch, size_bytes)
                }
            };
            if incompatible || self.closed.contains(shard) {
                conflicts.push(shard.clone());
            }
        }
        conflicts
    }

    fn over_limits(&self, batch: &TargetedWriteBatch, size_bytes: usize) -> bool {
        if batch.is_empty() {
            return false;
        }
        batch.len() + 1 > self.limits.max_ops
            || batch.estimated_size_bytes + size_bytes > self.limits.max_bytes
    }

    fn add(
        &mut self,
        op_index: usize,
        ns_index: usize,
        endpoints: &[ShardEndpoint],
        size_bytes: usize,
    ) {
        self.buffered_multi |= endpoints.len() > 1;
        for (child_index, endpoint) in endpoints.iter().enumerate() {
            self.versions
                .insert((endpoint.shard_id.clone(), ns_index), endpoint.version);
            let batch = self
                .batches
                .entry(endpoint.shard_id.clone())
                .or_insert_with(|| TargetedWriteBatch::new(endpoint.shard_id.clone()));
            batch.writes.push(TargetedWrite {
                op_index,
                child_index,
                ns_index,
                endpoint: endpoint.clone(),
            });
            batch.estimated_size_bytes += size_bytes;
        }
    }

    pub fn finish(self) -> (TargetedBatchMap, WriteType) {
        (self.batches, self.write_type)
    }
}
