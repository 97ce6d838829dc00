//! Routing errors collected during one round, grouped by namespace

use crate::command::Namespace;
use crate::common::Status;
use crate::router::targeter::ShardEndpoint;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct TrackedErrors {
    errors: BTreeMap<Namespace, Vec<(ShardEndpoint, Status)>>,
}

impl TrackedErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `status` if it is a stale-routing error. Returns whether it was kept.
    pub fn add_error(&mut self, ns: &Namespace, endpoint: &ShardEndpoint, status: &Status) -> bool {
        if !status.code.is_stale_routing() {
            return false;
        }
        self.errors
            .entry(ns.clone())
            .or_default()
            .push((endpoint.clone(), status.clone()));
        true
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Namespace, &[(ShardEndpoint, Status)])> {
        self.errors.iter().map(|(ns, errors)| (ns, errors.as_slice()))
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }
}
