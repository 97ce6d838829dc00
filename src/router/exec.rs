//! Round-based retry loop
//!
//! Each round targets the Ready ops, fans the batches out to their shards in
//! parallel, waits for every reply and only then folds them into op state.
//! Routing errors trigger a targeter refresh before the next round; the loop
//! gives up after too many consecutive rounds without progress.

use crate::command::{BulkWriteReplyInfo, BulkWriteRequest, ShardWriteReply};
use crate::common::{Error, Result, RouterConfig, RouterStats};
use crate::router::batch::{BatchLimits, TargetedBatchMap, TargetedWriteBatch, WriteType};
use crate::router::bulk_write_op::BulkWriteOp;
use crate::router::shard_client::ShardClient;
use crate::router::targeter::Targeter;
use crate::router::tracked_errors::TrackedErrors;
use crate::router::write_op::WriteOpState;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Execute `request` to completion.
///
/// `targeters[i]` routes `request.ns_info[i]`. Per-op failures, dropped
/// collections and lack of progress are reported in the reply; `Err` is
/// returned only for invalid requests, always-fatal shard errors and shutdown.
pub async fn execute(
    client: &dyn ShardClient,
    targeters: &[Arc<dyn Targeter>],
    request: &BulkWriteRequest,
    config: &RouterConfig,
    stats: &RouterStats,
) -> Result<BulkWriteReplyInfo> {
    request.validate()?;
    if targeters.len() != request.ns_info.len() {
        return Err(Error::InvalidRequest(format!(
            "{} targeters for {} namespaces",
            targeters.len(),
            request.ns_info.len()
        )));
    }
    for (info, targeter) in request.ns_info.iter().zip(targeters) {
        if targeter.namespace() != &info.ns {
            return Err(Error::InvalidRequest(format!(
                "targeter for {} given for namespace {}",
                targeter.namespace(),
                info.ns
            )));
        }
    }

    let correlation_id = Uuid::new_v4();
    let span = info_span!(
        "bulk_write",
        %correlation_id,
        ops = request.ops.len(),
        ordered = request.ordered
    );
    run_rounds(client, targeters, request, config, stats, correlation_id)
        .instrument(span)
        .await
}

async fn run_rounds(
    client: &dyn ShardClient,
    targeters: &[Arc<dyn Targeter>],
    request: &BulkWriteRequest,
    config: &RouterConfig,
    stats: &RouterStats,
    correlation_id: Uuid,
) -> Result<BulkWriteReplyInfo> {
    stats.requests.inc();
    info!("Starting bulk write");

    let mut bulk =
        BulkWriteOp::new(request, BatchLimits::from(config)).with_correlation_id(correlation_id);
    let mut record_target_errors = false;
    let mut rounds = 0usize;
    let mut rounds_without_progress = 0usize;

    while !bulk.is_finished() {
        let started = Instant::now();
        let terminal_before = bulk.num_terminal();
        let mut tracked = TrackedErrors::new();
        rounds += 1;

        match bulk.target(targeters, record_target_errors) {
            Ok((batches, write_type)) => {
                stats
                    .ops_targeted
                    .add(batches.values().map(|b| b.len() as u64).sum());
                match write_type {
                    WriteType::Ordinary => {
                        dispatch_batches(client, &mut bulk, &batches, &mut tracked, stats).await?
                    }
                    WriteType::WithoutShardKey => {
                        dispatch_without_shard_key(client, &mut bulk, &batches, &mut tracked, stats)
                            .await?
                    }
                }
            }
            Err(e) => {
                stats.target_errors.inc();
                debug!(error = %e, "Targeting failed, refreshing routing");
                match &e {
                    Error::CouldNotTarget { namespace, .. } => targeters
                        .iter()
                        .filter(|t| t.namespace().as_str() == namespace.as_str())
                        .for_each(|t| t.note_could_not_target()),
                    _ => targeters.iter().for_each(|t| t.note_could_not_target()),
                }
                record_target_errors = true;
            }
        }

        if !tracked.is_empty() {
            stats.stale_responses.add(tracked.len() as u64);
            bulk.note_stale_responses(targeters, &tracked);
        }

        if bulk.is_finished() {
            stats.record_round(started.elapsed());
            break;
        }

        let targeter_changed = match refresh_targeters(targeters).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(error = %e, "Collection dropped during bulk write");
                bulk.note_error_for_remaining_writes(&e.to_status());
                stats.record_round(started.elapsed());
                break;
            }
        };
        if targeter_changed {
            stats.refreshes.inc();
        }

        let progressed = targeter_changed || bulk.num_terminal() > terminal_before;
        rounds_without_progress = if progressed { 0 } else { rounds_without_progress + 1 };
        stats.record_round(started.elapsed());
        debug!(rounds, targeter_changed, progressed, "Round finished");

        if rounds_without_progress > config.max_rounds_without_progress {
            let err = Error::NoProgress {
                rounds: rounds_without_progress,
                completed: bulk.num_write_ops_in(WriteOpState::Completed),
            };
            warn!(error = %err, "Giving up on bulk write");
            stats.no_progress_aborts.inc();
            bulk.note_error_for_remaining_writes(&err.to_status());
            break;
        }
    }

    let reply = bulk.generate_reply_info();
    info!(
        rounds,
        items = reply.items.len(),
        errors = reply.num_errors,
        "Finished bulk write"
    );
    Ok(reply)
}

/// Refresh every targeter; true if any routing table changed. A dropped
/// collection wins over everything else, other failures only count as
/// "unchanged" for their namespace.
async fn refresh_targeters(targeters: &[Arc<dyn Targeter>]) -> Result<bool> {
    let mut changed = false;
    let mut dropped = None;
    for targeter in targeters {
        match targeter.refresh().await {
            Ok(c) => changed |= c,
            Err(e @ Error::NamespaceDropped(_)) => {
                dropped.get_or_insert(e);
            }
            Err(e) => {
                warn!(ns = %targeter.namespace(), error = %e, "Routing refresh failed");
            }
        }
    }
    match dropped {
        Some(e) => Err(e),
        None => Ok(changed),
    }
}

/// Send every batch at once and merge the replies after the last one arrives
async fn dispatch_batches(
    client: &dyn ShardClient,
    bulk: &mut BulkWriteOp<'_>,
    batches: &TargetedBatchMap,
    tracked: &mut TrackedErrors,
    stats: &RouterStats,
) -> Result<()> {
    let requests: Vec<_> = batches
        .values()
        .map(|batch| (batch, bulk.build_child_request(batch)))
        .collect();

    stats.inflight_batches.set(requests.len() as u64);
    let mut futs = FuturesUnordered::new();
    for (batch, request) in &requests {
        debug!(shard = %batch.shard_id, ops = batch.len(), "Sending batch");
        stats.batches_sent.inc();
        futs.push(async move { (*batch, client.bulk_write(&batch.shard_id, request).await) });
    }

    let mut outcomes = Vec::with_capacity(requests.len());
    while let Some(outcome) = futs.next().await {
        outcomes.push(outcome);
    }
    stats.inflight_batches.set(0);

    outcomes.sort_by(|a, b| a.0.shard_id.cmp(&b.0.shard_id));
    for (batch, outcome) in outcomes {
        apply_outcome(bulk, batch, outcome, tracked, stats)?;
    }
    Ok(())
}

/// Probe the shards one at a time until one of them applies the write or
/// fails; the rest are completed with `n = 0` without being contacted.
async fn dispatch_without_shard_key(
    client: &dyn ShardClient,
    bulk: &mut BulkWriteOp<'_>,
    batches: &TargetedBatchMap,
    tracked: &mut TrackedErrors,
    stats: &RouterStats,
) -> Result<()> {
    let mut settled = false;
    for batch in batches.values() {
        if settled {
            bulk.note_batch_skipped(batch);
            continue;
        }

        let request = bulk.build_child_request(batch);
        debug!(shard = %batch.shard_id, "Probing shard for write without shard key");
        stats.batches_sent.inc();
        let outcome = client.bulk_write(&batch.shard_id, &request).await;

        settled = match &outcome {
            Ok(reply) => reply
                .items
                .first()
                .map_or(true, |item| !item.ok || item.n > 0),
            Err(_) => true,
        };
        apply_outcome(bulk, batch, outcome, tracked, stats)?;
    }
    Ok(())
}

fn apply_outcome(
    bulk: &mut BulkWriteOp<'_>,
    batch: &TargetedWriteBatch,
    outcome: Result<ShardWriteReply>,
    tracked: &mut TrackedErrors,
    stats: &RouterStats,
) -> Result<()> {
    let result = match outcome {
        Ok(reply) => bulk.note_batch_response(batch, &reply, Some(tracked)),
        Err(e) if e.is_shutdown() => Err(e),
        Err(e) => {
            stats.shard_failures.inc();
            warn!(
                shard = %batch.shard_id,
                error = %e,
                retryable = e.is_retryable(),
                "Shard batch failed"
            );
            let status = e
                .to_status()
                .with_context(format!("results unavailable from {}", batch.shard_id));
            bulk.note_local_batch_error(batch, status)
        }
    };
    if matches!(&result, Err(e) if e.is_always_fatal()) {
        stats.fatal_aborts.inc();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Namespace, WriteOperation};
    use crate::common::Status;
    use crate::router::targeter::ShardEndpoint;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Refresh {
        Changed,
        Unchanged,
        Fails,
        Dropped,
    }

    struct ScriptedTargeter {
        ns: Namespace,
        refresh: Refresh,
        calls: AtomicUsize,
    }

    impl ScriptedTargeter {
        fn new(ns: &str, refresh: Refresh) -> Arc<Self> {
            Arc::new(Self {
                ns: ns.into(),
                refresh,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Targeter for ScriptedTargeter {
        fn namespace(&self) -> &Namespace {
            &self.ns
        }

        fn target(&self, _op: &WriteOperation) -> Result<Vec<ShardEndpoint>> {
            Ok(vec![ShardEndpoint::ignored("shard-a")])
        }

        fn note_could_not_target(&self) {}

        fn note_stale_routing_response(&self, _endpoint: &ShardEndpoint, _stale: &Status) {}

        async fn refresh(&self) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.refresh {
                Refresh::Changed => Ok(true),
                Refresh::Unchanged => Ok(false),
                Refresh::Fails => Err(Error::Catalog("catalog unavailable".into())),
                Refresh::Dropped => Err(Error::NamespaceDropped(self.ns.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_refresh_failure_does_not_hide_other_changes() {
        let failing = ScriptedTargeter::new("a.one", Refresh::Fails);
        let changed = ScriptedTargeter::new("a.two", Refresh::Changed);
        let targeters: Vec<Arc<dyn Targeter>> = vec![failing.clone(), changed.clone()];

        assert!(refresh_targeters(&targeters).await.unwrap());
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(changed.calls.load(Ordering::SeqCst), 1);

        let unchanged: Vec<Arc<dyn Targeter>> = vec![
            ScriptedTargeter::new("a.one", Refresh::Fails),
            ScriptedTargeter::new("a.two", Refresh::Unchanged),
        ];
        assert!(!refresh_targeters(&unchanged).await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_collection_reported_after_refreshing_all() {
        let failing = ScriptedTargeter::new("a.one", Refresh::Fails);
        let dropped = ScriptedTargeter::new("a.two", Refresh::Dropped);
        let last = ScriptedTargeter::new("a.three", Refresh::Changed);
        let targeters: Vec<Arc<dyn Targeter>> = vec![failing, dropped, last.clone()];

        let err = refresh_targeters(&targeters).await.unwrap_err();
        assert!(matches!(err, Error::NamespaceDropped(ref ns) if ns == "a.two"));
        assert_eq!(last.calls.load(Ordering::SeqCst), 1);
    }
}
