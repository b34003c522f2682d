use arc_swap::ArcSwap;
use hostwatch_common::alert::{Alert, AlertChanges};
use hostwatch_common::types::SampleKind;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{RegistryError, ValidationError};
use crate::rule::{CompiledRule, RuleKey};

/// Which rules a caller is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Host(String),
    Cluster(Uuid),
}

impl Scope {
    fn admits(&self, alert: &Alert) -> bool {
        match self {
            Scope::All => true,
            Scope::Host(uuid) => alert.host_uuid == *uuid,
            Scope::Cluster(cid) => alert.cid == *cid,
        }
    }
}

/// Immutable view of the rule set at one revision.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    revision: u64,
    rules: BTreeMap<i64, Arc<CompiledRule>>,
}

impl RuleSnapshot {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, id: i64) -> Option<&Arc<CompiledRule>> {
        self.rules.get(&id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Every rule, active or not, by ascending id.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CompiledRule>> {
        self.rules.values()
    }

    /// Active rules admitted by `scope`, by ascending id.
    pub fn active<'a>(&'a self, scope: &'a Scope) -> impl Iterator<Item = &'a Arc<CompiledRule>> {
        self.rules
            .values()
            .filter(move |r| r.alert.active && scope.admits(&r.alert))
    }

    /// Distinct host uuids with at least one active rule.
    pub fn active_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .rules
            .values()
            .filter(|r| r.alert.active)
            .map(|r| r.alert.host_uuid.clone())
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }
}

/// Lazy iterator returned by [`AlertRegistry::list_active`]. Holds the
/// snapshot it was created from, so later mutations are not observed.
pub struct ActiveRules {
    snapshot: Arc<RuleSnapshot>,
    scope: Scope,
    cursor: Bound<i64>,
}

impl Iterator for ActiveRules {
    type Item = Arc<CompiledRule>;

    fn next(&mut self) -> Option<Self::Item> {
        let found = self
            .snapshot
            .rules
            .range((self.cursor, Bound::Unbounded))
            .find(|(_, r)| r.alert.active && self.scope.admits(&r.alert))
            .map(|(id, r)| (*id, Arc::clone(r)));
        match found {
            Some((id, rule)) => {
                self.cursor = Bound::Excluded(id);
                Some(rule)
            }
            None => {
                self.cursor = Bound::Excluded(i64::MAX);
                None
            }
        }
    }
}

/// A create or update request. `id: None` is a creation document, matched
/// against existing rules by key.
#[derive(Debug, Clone, Default)]
pub struct AlertUpsert {
    pub id: Option<i64>,
    pub changes: AlertChanges,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    pub alert: Alert,
    pub created: bool,
    /// The rule as it was before an update.
    pub previous: Option<Alert>,
}

/// The current set of alert rules.
///
/// Readers take a snapshot without locking; writers are serialized and
/// publish a new snapshot with a bumped revision.
pub struct AlertRegistry {
    current: ArcSwap<RuleSnapshot>,
    writer: Mutex<()>,
}

impl Default for AlertRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertRegistry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSnapshot::default()),
            writer: Mutex::new(()),
        }
    }

    /// Builds a registry from persisted rules. Rules that no longer compile
    /// are skipped and returned alongside the error.
    pub fn from_alerts(
        alerts: impl IntoIterator<Item = Alert>,
    ) -> (Self, Vec<(i64, ValidationError)>) {
        let mut rules = BTreeMap::new();
        let mut rejected = Vec::new();
        for alert in alerts {
            let id = alert.id;
            match CompiledRule::compile(alert) {
                Ok(rule) => {
                    rules.insert(id, Arc::new(rule));
                }
                Err(e) => {
                    tracing::warn!(rule_id = id, error = %e, "Skipping invalid stored alert rule");
                    rejected.push((id, e));
                }
            }
        }
        let registry = Self {
            current: ArcSwap::from_pointee(RuleSnapshot { revision: 1, rules }),
            writer: Mutex::new(()),
        };
        (registry, rejected)
    }

    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.current.load_full()
    }

    pub fn revision(&self) -> u64 {
        self.current.load().revision
    }

    pub fn get(&self, id: i64) -> Option<Alert> {
        self.current.load().get(id).map(|r| r.alert.clone())
    }

    pub fn list_active(&self, scope: Scope) -> ActiveRules {
        ActiveRules {
            snapshot: self.snapshot(),
            scope,
            cursor: Bound::Unbounded,
        }
    }

    pub fn upsert(&self, request: AlertUpsert) -> Result<Upserted, RegistryError> {
        self.mutate(|rules| {
            let (rule, created) = upsert_into(rules, request)?;
            let alert = rule.alert.clone();
            let previous = rules
                .insert(rule.id(), Arc::new(rule))
                .map(|old| old.alert.clone());
            Ok(Upserted {
                alert,
                created,
                previous,
            })
        })
    }

    /// Puts rule `id` back to `previous`, or removes it when `previous` is
    /// `None`. Used to undo a change that could not be persisted.
    pub fn restore(&self, id: i64, previous: Option<Alert>) -> Result<(), RegistryError> {
        self.mutate(|rules| {
            match previous {
                Some(alert) => {
                    rules.insert(id, Arc::new(CompiledRule::compile(alert)?));
                }
                None => {
                    rules.remove(&id);
                }
            }
            Ok(())
        })
    }

    pub fn activate(&self, id: i64) -> Result<Alert, RegistryError> {
        self.set_active(id, true)
    }

    pub fn deactivate(&self, id: i64) -> Result<Alert, RegistryError> {
        self.set_active(id, false)
    }

    fn set_active(&self, id: i64, active: bool) -> Result<Alert, RegistryError> {
        self.mutate(|rules| {
            let rule = rules.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
            let mut updated = CompiledRule::clone(rule);
            updated.alert.active = active;
            let alert = updated.alert.clone();
            *rule = Arc::new(updated);
            Ok(alert)
        })
    }

    /// Removes a rule. Returns the removed rule, or `None` for an unknown id,
    /// in which case no new snapshot is published.
    pub fn remove(&self, id: i64) -> Option<Alert> {
        let _guard = self.lock_writer();
        let current = self.current.load_full();
        let removed = current.rules.get(&id)?.alert.clone();
        let mut rules = current.rules.clone();
        rules.remove(&id);
        self.publish(&current, rules);
        Some(removed)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, current: &RuleSnapshot, rules: BTreeMap<i64, Arc<CompiledRule>>) {
        self.current.store(Arc::new(RuleSnapshot {
            revision: current.revision + 1,
            rules,
        }));
    }

    /// Applies `f` to a copy of the current rule map and publishes it.
    /// Nothing is published when `f` fails.
    fn mutate<T, E>(
        &self,
        f: impl FnOnce(&mut BTreeMap<i64, Arc<CompiledRule>>) -> Result<T, E>,
    ) -> Result<T, E> {
        let _guard = self.lock_writer();
        let current = self.current.load_full();
        let mut rules = current.rules.clone();
        let out = f(&mut rules)?;
        self.publish(&current, rules);
        Ok(out)
    }
}

fn upsert_into(
    rules: &BTreeMap<i64, Arc<CompiledRule>>,
    request: AlertUpsert,
) -> Result<(CompiledRule, bool), RegistryError> {
    let AlertUpsert { id, changes } = request;

    if let Some(existing) = id.and_then(|id| rules.get(&id)) {
        let mut alert = existing.alert.clone();
        changes.apply_to(&mut alert);
        let rule = CompiledRule::compile(alert)?;
        ensure_unique_key(rules, &rule)?;
        return Ok((rule, false));
    }

    let candidate = changes
        .build(id.unwrap_or_else(hostwatch_common::id::next_id))
        .map_err(ValidationError::from)?;
    let kind = SampleKind::from_table(&candidate.table)
        .ok_or_else(|| ValidationError::UnknownTable(candidate.table.clone()))?;
    let key = RuleKey::of(&candidate, kind);

    let (rule, created) = match rules.values().find(|r| r.key() == key) {
        Some(existing) => {
            let mut alert = existing.alert.clone();
            changes.apply_to(&mut alert);
            (CompiledRule::compile(alert)?, false)
        }
        None => (CompiledRule::compile(candidate)?, true),
    };
    ensure_unique_key(rules, &rule)?;
    Ok((rule, created))
}

/// Fails when another rule already has the key of `rule`.
fn ensure_unique_key(
    rules: &BTreeMap<i64, Arc<CompiledRule>>,
    rule: &CompiledRule,
) -> Result<(), ValidationError> {
    let key = rule.key();
    match rules.values().find(|r| r.id() != rule.id() && r.key() == key) {
        Some(other) => Err(ValidationError::DuplicateKey { existing: other.id() }),
        None => Ok(()),
    }
}
