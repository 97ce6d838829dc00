//! Per-operation state machine
//!
//! `Ready -> Pending -> Completed | Error`. An op split across several shards
//! keeps one child per endpoint and stays Pending until every child has an
//! outcome. A stale-routing child error sends the op back to Ready so the next
//! round re-targets it.

use crate::command::ReplyItem;
use crate::common::{ErrorCode, Status};
use crate::router::targeter::ShardEndpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOpState {
    Ready,
    Pending,
    Completed,
    Error,
}

impl WriteOpState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WriteOpState::Completed | WriteOpState::Error)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ChildOutcome {
    Pending,
    Completed(ReplyItem),
    Error(Status),
}

/// One piece of an op, sent to one endpoint
#[derive(Debug, Clone)]
pub struct ChildWrite {
    pub endpoint: ShardEndpoint,
    outcome: ChildOutcome,
}

impl ChildWrite {
    pub fn is_pending(&self) -> bool {
        self.outcome == ChildOutcome::Pending
    }
}

#[derive(Debug, Clone)]
pub struct WriteOp {
    index: usize,
    state: WriteOpState,
    children: Vec<ChildWrite>,
    result: Option<ReplyItem>,
    error: Option<Status>,
}

impl WriteOp {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: WriteOpState::Ready,
            children: Vec::new(),
            result: None,
            error: None,
        }
    }

    pub fn state(&self) -> WriteOpState {
        self.state
    }

    pub fn error(&self) -> Option<&Status> {
        self.error.as_ref()
    }

    pub fn children(&self) -> &[ChildWrite] {
        &self.children
    }

    /// Assign the op to this round's endpoints. Child `i` corresponds to
    /// `endpoints[i]`.
    pub fn mark_pending(&mut self, endpoints: Vec<ShardEndpoint>) {
        debug_assert_eq!(self.state, WriteOpState::Ready);
        self.children = endpoints
            .into_iter()
            .map(|endpoint| ChildWrite {
                endpoint,
                outcome: ChildOutcome::Pending,
            })
            .collect();
        self.state = WriteOpState::Pending;
    }

    /// Record a child's success. Ignored unless the op is Pending, e.g. after
    /// an ordered batch reset it.
    pub fn note_write_complete(&mut self, child: usize, item: &ReplyItem) {
        self.note_child(child, ChildOutcome::Completed(item.clone()));
    }

    pub fn note_write_error(&mut self, child: usize, status: Status) {
        self.note_child(child, ChildOutcome::Error(status));
    }

    fn note_child(&mut self, child: usize, outcome: ChildOutcome) {
        if self.state != WriteOpState::Pending {
            return;
        }
        if let Some(c) = self.children.get_mut(child) {
            c.outcome = outcome;
            self.update_state();
        }
    }

    /// Forget this round's children and go back to Ready
    pub fn reset_to_ready(&mut self) {
        self.children.clear();
        self.result = None;
        self.state = WriteOpState::Ready;
    }

    /// Terminate the op with `status`, whatever its children reported
    pub fn set_op_error(&mut self, status: Status) {
        self.children.clear();
        self.result = None;
        self.error = Some(status);
        self.state = WriteOpState::Error;
    }

    fn update_state(&mut self) {
        if self.children.iter().any(ChildWrite::is_pending) {
            self.state = WriteOpState::Pending;
            return;
        }

        let mut errors = Vec::new();
        let mut stale = false;
        for child in &self.children {
            if let ChildOutcome::Error(status) = &child.outcome {
                if status.code.is_stale_routing() {
                    stale = true;
                } else {
                    errors.push((child.endpoint.shard_id.clone(), status.clone()));
                }
            }
        }

        match errors.len() {
            0 if stale => self.reset_to_ready(),
            0 => {
                self.result = Some(self.merge_results());
                self.state = WriteOpState::Completed;
            }
            1 => {
                self.error = errors.pop().map(|(_, status)| status);
                self.state = WriteOpState::Error;
            }
            _ => {
                let reasons: Vec<String> = errors
                    .iter()
                    .map(|(shard, status)| format!("{}: {}", shard, status))
                    .collect();
                self.error = Some(Status::new(
                    ErrorCode::MultipleErrorsOccurred,
                    format!("multiple errors for op {}: {}", self.index, reasons.join("; ")),
                ));
                self.state = WriteOpState::Error;
            }
        }
    }

    fn merge_results(&self) -> ReplyItem {
        let mut merged = ReplyItem::success(self.index, 0);
        for child in &self.children {
            if let ChildOutcome::Completed(item) = &child.outcome {
                merged.n += item.n;
                if let Some(modified) = item.n_modified {
                    merged.n_modified = Some(merged.n_modified.unwrap_or(0) + modified);
                }
                if merged.upserted.is_none() {
                    merged.upserted = item.upserted.clone();
                }
                if merged.retried_stmt_id.is_none() {
                    merged.retried_stmt_id = item.retried_stmt_id;
                }
            }
        }
        merged
    }

    /// Client reply item, once the op is terminal
    pub fn reply_item(&self) -> Option<ReplyItem> {
        match self.state {
            WriteOpState::Completed => self.result.clone(),
            WriteOpState::Error => self
                .error
                .clone()
                .map(|status| ReplyItem::error(self.index, status)),
            WriteOpState::Ready | WriteOpState::Pending => None,
        }
    }
}
