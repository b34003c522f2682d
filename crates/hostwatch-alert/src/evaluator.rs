use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::debounce::{Debounce, Transition};
use crate::evaluate::{Evaluation, Status};
use crate::rule::CompiledRule;

type HostDebounce = Arc<Mutex<HashMap<i64, Debounce>>>;

/// Debounce state of every (rule, host) pair, partitioned by host.
#[derive(Default)]
pub struct Evaluator {
    hosts: DashMap<String, HostDebounce>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn host(&self, host_uuid: &str) -> HostDebounce {
        if let Some(state) = self.hosts.get(host_uuid) {
            return Arc::clone(&state);
        }
        Arc::clone(&self.hosts.entry(host_uuid.to_string()).or_default())
    }

    /// Feeds one evaluation into the pair's debounce state. Skipped
    /// evaluations leave the state untouched.
    pub fn observe(
        &self,
        rule: &CompiledRule,
        host_uuid: &str,
        evaluation: &Evaluation,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        let status = evaluation.status()?;
        let host = self.host(host_uuid);
        let mut states = host.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let transition = states
            .entry(rule.id())
            .or_default()
            .observe(status, now, rule.timing());
        if let Some(t) = transition {
            tracing::debug!(
                rule_id = rule.id(),
                host_uuid,
                from = %t.from,
                to = %t.to,
                "Alert status changed"
            );
        }
        transition
    }

    pub fn is_tracked(&self, rule_id: i64, host_uuid: &str) -> bool {
        self.hosts.get(host_uuid).is_some_and(|host| {
            host.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains_key(&rule_id)
        })
    }

    /// Starts tracking a pair with an already reported status, e.g. one
    /// restored from an open incident.
    pub fn seed(&self, rule_id: i64, host_uuid: &str, reported: Status) {
        let host = self.host(host_uuid);
        host.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(rule_id)
            .or_insert_with(|| Debounce::new(reported));
    }

    /// Puts back a state taken with [`Evaluator::state`], undoing the
    /// observations made since.
    pub fn restore(&self, rule_id: i64, host_uuid: &str, state: Debounce) {
        let host = self.host(host_uuid);
        host.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(rule_id, state);
    }

    pub fn state(&self, rule_id: i64, host_uuid: &str) -> Option<Debounce> {
        let host = self.hosts.get(host_uuid)?;
        let states = host.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        states.get(&rule_id).cloned()
    }

    /// Drops the state of `rule_id` on every host.
    pub fn forget_rule(&self, rule_id: i64) {
        for host in self.hosts.iter() {
            host.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&rule_id);
        }
    }

    pub fn tracked_pairs(&self) -> usize {
        self.hosts
            .iter()
            .map(|host| host.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len())
            .sum()
    }
}
