//! Coordinator for one client bulk write
//!
//! Owns the [`WriteOp`] array, turns Ready ops into per-shard batches each
//! round, projects batches into child requests and folds shard replies back
//! into op state.

use crate::command::{
    BulkWriteReplyInfo, BulkWriteRequest, NamespaceInfo, OpKind, ReplyItem, ShardWriteReply,
    ShardWriteRequest,
};
use crate::common::{Error, ErrorCode, Result, Status};
use crate::router::batch::{
    estimate_op_size, Admission, BatchBuilder, BatchLimits, TargetedBatchMap, TargetedWriteBatch,
    WriteType,
};
use crate::router::targeter::{ShardEndpoint, ShardId, Targeter};
use crate::router::tracked_errors::TrackedErrors;
use crate::router::write_op::{WriteOp, WriteOpState};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct BulkWriteOp<'a> {
    request: &'a BulkWriteRequest,
    write_ops: Vec<WriteOp>,
    limits: BatchLimits,
    retried_stmt_ids: BTreeSet<i32>,
    write_concern_errors: Vec<(ShardId, Status)>,
    aborted: bool,
    correlation_id: Uuid,
}

impl<'a> BulkWriteOp<'a> {
    pub fn new(request: &'a BulkWriteRequest, limits: BatchLimits) -> Self {
        Self {
            request,
            write_ops: (0..request.ops.len()).map(WriteOp::new).collect(),
            limits,
            retried_stmt_ids: BTreeSet::new(),
            write_concern_errors: Vec::new(),
            aborted: false,
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn request(&self) -> &BulkWriteRequest {
        self.request
    }

    pub fn write_op(&self, index: usize) -> Option<&WriteOp> {
        self.write_ops.get(index)
    }

    pub fn num_write_ops_in(&self, state: WriteOpState) -> usize {
        self.write_ops.iter().filter(|op| op.state() == state).count()
    }

    pub fn num_terminal(&self) -> usize {
        self.write_ops
            .iter()
            .filter(|op| op.state().is_terminal())
            .count()
    }

    /// Build this round's batches from the Ready ops. `targeters` is indexed
    /// like the request's `ns_info`.
    ///
    /// Without `record_target_errors` the first targeting failure is returned
    /// and no op changes state. With it, the failing op is terminated and the
    /// scan goes on (unordered) or closes the round (ordered).
    pub fn target(
        &mut self,
        targeters: &[Arc<dyn Targeter>],
        record_target_errors: bool,
    ) -> Result<(TargetedBatchMap, WriteType)> {
        let mut builder = BatchBuilder::new(self.request.ordered, self.limits);
        let mut accepted: Vec<(usize, Vec<ShardEndpoint>)> = Vec::new();
        let mut target_errors: Vec<(usize, Status)> = Vec::new();

        for (index, write_op) in self.write_ops.iter().enumerate() {
            if write_op.state() != WriteOpState::Ready {
                continue;
            }

            let op = &self.request.ops[index];
            let targeter = targeters
                .get(op.ns_index())
                .ok_or(Error::UnknownNamespace(op.ns_index()))?;

            let endpoints = match targeter.target(op) {
                Ok(endpoints) if endpoints.is_empty() => Err(Error::CouldNotTarget {
                    namespace: targeter.namespace().to_string(),
                    reason: "no shard owns the write".into(),
                }),
                other => other,
            };

            let endpoints = match endpoints {
                Ok(endpoints) => endpoints,
                Err(e) if !record_target_errors => return Err(e),
                Err(e) => {
                    debug!(op = index, error = %e, "Recording targeting error");
                    target_errors.push((index, e.to_status()));
                    if self.request.ordered {
                        builder.stop();
                        break;
                    }
                    continue;
                }
            };

            let isolated =
                endpoints.len() > 1 && op.kind() != OpKind::Insert && !op.is_multi();
            let size = estimate_op_size(op, self.request.statement_id(index).is_some());

            match builder.admit(index, op.ns_index(), &endpoints, size, isolated) {
                Admission::Accepted => accepted.push((index, endpoints)),
                Admission::Deferred => {}
                Admission::Stop => break,
            }
        }

        for (index, status) in target_errors {
            self.write_ops[index].set_op_error(status);
        }
        for (index, endpoints) in accepted {
            self.write_ops[index].mark_pending(endpoints);
        }

        let (batches, write_type) = builder.finish();
        debug!(
            batches = batches.len(),
            ops = batches.values().map(TargetedWriteBatch::len).sum::<usize>(),
            ?write_type,
            "Targeted round"
        );
        Ok((batches, write_type))
    }

    /// Project `batch` onto a self-contained request for its shard
    pub fn build_child_request(&self, batch: &TargetedWriteBatch) -> ShardWriteRequest {
        let mut ns_info: Vec<NamespaceInfo> = Vec::new();
        let mut remap: HashMap<usize, usize> = HashMap::new();
        let mut ops = Vec::with_capacity(batch.len());
        let mut stmt_ids = self.request.is_retryable().then(Vec::new);

        for write in &batch.writes {
            let child_ns = *remap.entry(write.ns_index).or_insert_with(|| {
                ns_info.push(NamespaceInfo {
                    ns: self.request.ns_info[write.ns_index].ns.clone(),
                    routing_version: Some(write.endpoint.version),
                });
                ns_info.len() - 1
            });

            let mut op = self.request.ops[write.op_index].clone();
            op.set_ns_index(child_ns);
            ops.push(op);

            if let (Some(ids), Some(id)) =
                (stmt_ids.as_mut(), self.request.statement_id(write.op_index))
            {
                ids.push(id);
            }
        }

        ShardWriteRequest {
            ops,
            ns_info,
            ordered: self.request.ordered,
            bypass_document_validation: self.request.bypass_document_validation,
            let_params: self.request.let_params.clone(),
            stmt_ids,
            correlation_id: self.correlation_id,
        }
    }

    /// Fold a shard's reply into op state. Stale-routing errors are added to
    /// `tracked` when given. An always-fatal error aborts the request.
    pub fn note_batch_response(
        &mut self,
        batch: &TargetedWriteBatch,
        reply: &ShardWriteReply,
        mut tracked: Option<&mut TrackedErrors>,
    ) -> Result<()> {
        let ordered = self.request.ordered;
        let mut first_error: Option<Status> = None;
        let mut last_stale: Option<Status> = None;
        let mut processed = 0;

        for (i, write) in batch.writes.iter().enumerate() {
            if ordered && first_error.is_some() {
                break;
            }
            let Some(item) = reply.items.get(i) else {
                break;
            };
            processed = i + 1;

            match item.error_status() {
                None => self.write_ops[write.op_index].note_write_complete(write.child_index, item),
                Some(status) => {
                    if status.code.is_always_fatal() {
                        warn!(shard = %batch.shard_id, error = %status, "Aborting bulk write");
                        self.abort(status.clone());
                        return Err(Error::AlwaysFatal(status));
                    }
                    if let Some(tracked) = tracked.as_deref_mut() {
                        tracked.add_error(
                            &self.request.ns_info[write.ns_index].ns,
                            &write.endpoint,
                            &status,
                        );
                    }
                    if status.code.is_stale_routing() {
                        last_stale = Some(status.clone());
                    }
                    self.write_ops[write.op_index]
                        .note_write_error(write.child_index, status.clone());
                    first_error.get_or_insert(status);
                }
            }
        }

        for write in &batch.writes[processed..] {
            if ordered && first_error.is_some() {
                self.write_ops[write.op_index].reset_to_ready();
            } else if let Some(stale) = &last_stale {
                if let Some(tracked) = tracked.as_deref_mut() {
                    tracked.add_error(
                        &self.request.ns_info[write.ns_index].ns,
                        &write.endpoint,
                        stale,
                    );
                }
                self.write_ops[write.op_index].note_write_error(write.child_index, stale.clone());
            } else {
                let status = Status::new(
                    ErrorCode::Internal,
                    format!(
                        "shard {} returned {} results for {} writes",
                        batch.shard_id,
                        reply.items.len(),
                        batch.len()
                    ),
                );
                self.write_ops[write.op_index].note_write_error(write.child_index, status);
            }
        }

        self.retried_stmt_ids
            .extend(reply.retried_stmt_ids.iter().copied());
        self.retried_stmt_ids
            .extend(reply.items.iter().filter_map(|item| item.retried_stmt_id));

        if let Some(wce) = &reply.write_concern_error {
            self.write_concern_errors
                .push((batch.shard_id.clone(), wce.clone()));
        }
        Ok(())
    }

    /// The batch never reached its shard. Emulates an error reply: ordered
    /// requests fail the first write and requeue the rest, unordered ones fail
    /// every write.
    pub fn note_local_batch_error(
        &mut self,
        batch: &TargetedWriteBatch,
        status: Status,
    ) -> Result<()> {
        let count = if self.request.ordered {
            batch.len().min(1)
        } else {
            batch.len()
        };
        let items = (0..count)
            .map(|i| ReplyItem::error(i, status.clone()))
            .collect();
        self.note_batch_response(batch, &ShardWriteReply::new(items), None)
    }

    /// Complete a batch that was deliberately not sent with `n = 0`
    pub fn note_batch_skipped(&mut self, batch: &TargetedWriteBatch) {
        for write in &batch.writes {
            let item = ReplyItem::success(write.child_index, 0);
            self.write_ops[write.op_index].note_write_complete(write.child_index, &item);
        }
    }

    /// Tell each namespace's targeter about the stale endpoints seen this round
    pub fn note_stale_responses(&self, targeters: &[Arc<dyn Targeter>], tracked: &TrackedErrors) {
        for (ns, errors) in tracked.iter() {
            let Some(targeter) = targeters.iter().find(|t| t.namespace() == ns) else {
                continue;
            };
            for (endpoint, status) in errors {
                targeter.note_stale_routing_response(endpoint, status);
            }
        }
    }

    /// Terminate every op that has not finished yet
    pub fn note_error_for_remaining_writes(&mut self, status: &Status) {
        for op in self.write_ops.iter_mut().filter(|op| !op.state().is_terminal()) {
            op.set_op_error(status.clone());
        }
    }

    fn abort(&mut self, status: Status) {
        self.note_error_for_remaining_writes(&status);
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_finished(&self) -> bool {
        if self.aborted {
            return true;
        }
        let mut has_ready = false;
        let mut has_error = false;
        for op in &self.write_ops {
            match op.state() {
                WriteOpState::Pending => return false,
                WriteOpState::Ready => has_ready = true,
                WriteOpState::Error => has_error = true,
                WriteOpState::Completed => {}
            }
        }
        (self.request.ordered && has_error) || !has_ready
    }

    /// Client reply for every finished op, in original order
    pub fn generate_reply_info(&self) -> BulkWriteReplyInfo {
        let mut items: Vec<ReplyItem> = self
            .write_ops
            .iter()
            .filter_map(WriteOp::reply_item)
            .collect();

        for item in items.iter_mut().filter(|item| item.ok) {
            if let Some(id) = self.request.statement_id(item.idx) {
                if self.retried_stmt_ids.contains(&id) {
                    item.retried_stmt_id = Some(id);
                }
            }
        }

        BulkWriteReplyInfo {
            num_errors: items.iter().filter(|item| !item.ok).count(),
            items,
            retried_stmt_ids: self.retried_stmt_ids.iter().copied().collect(),
            write_concern_error: self.merged_write_concern_error(),
        }
    }

    fn merged_write_concern_error(&self) -> Option<Status> {
        match self.write_concern_errors.as_slice() {
            [] => None,
            [(_, status)] => Some(status.clone()),
            many => {
                let reasons: Vec<String> = many
                    .iter()
                    .map(|(shard, status)| format!("{}: {}", shard, status))
                    .collect();
                Some(Status::new(
                    many[0].1.code,
                    format!("multiple write concern errors: {}", reasons.join("; ")),
                ))
            }
        }
    }
}
