use crate::clause::WhereClause;
use crate::debounce::Debounce;
use crate::engine::{AlertEngine, SampleSource};
use crate::error::{BoxError, IncidentError, RegistryError, ValidationError};
use crate::evaluate::{evaluate, Evaluation, SkipReason, Status};
use crate::incident::{BreachOutcome, IncidentManager, IncidentStore};
use crate::lookup::{parse_interval, Lookup};
use crate::registry::{AlertRegistry, AlertUpsert, Scope};
use crate::rule::CompiledRule;
use crate::threshold::{CompareOp, Thresholds};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hostwatch_common::alert::{Alert, AlertChanges, AlertField, Direction};
use hostwatch_common::incident::{Incident, IncidentStatus, NewIncident};
use hostwatch_common::types::{
    CpuTimes, Disk, Host, MetricSample, SampleData, SampleKind, Severity,
};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

fn make_host(uuid: &str) -> Host {
    Host {
        uuid: uuid.into(),
        system: "Linux".into(),
        os_version: "6.1".into(),
        hostname: format!("{uuid}.local"),
        uptime: 3600,
        sync_interval: Some(10),
        created_at: t0(),
        updated_at: t0(),
    }
}

fn cpu(host: &str, secs: i64, cuser: i64, idle: i64) -> MetricSample {
    MetricSample::new(
        host,
        at(secs),
        SampleData::CpuTimes(CpuTimes {
            cuser,
            nice: 0,
            system: 0,
            idle,
            iowait: 0,
            irq: 0,
            softirq: 0,
            steal: 0,
            guest: 0,
            guest_nice: 0,
        }),
    )
}

fn disk(host: &str, secs: i64, mount: &str, avail: i64, total: i64) -> MetricSample {
    MetricSample::new(
        host,
        at(secs),
        SampleData::Disk(Disk {
            disk_name: "sda1".into(),
            mount_point: mount.into(),
            total_space: total,
            avail_space: avail,
        }),
    )
}

fn make_alert(id: i64, table: &str, lookup: &str, warn: &str, crit: &str) -> Alert {
    Alert {
        id,
        active: true,
        name: format!("rule-{id}"),
        table: table.into(),
        lookup: lookup.into(),
        timing: 0,
        warn: warn.into(),
        crit: crit.into(),
        info: None,
        host_uuid: "host-a".into(),
        hostname: "web-01".into(),
        cid: Uuid::nil(),
        where_clause: None,
        direction: Direction::Above,
    }
}

fn compile(alert: Alert) -> CompiledRule {
    CompiledRule::compile(alert).unwrap()
}

fn creation(alert: &Alert) -> AlertUpsert {
    AlertUpsert {
        id: None,
        changes: AlertChanges::from(alert),
    }
}

#[derive(Default)]
struct MemoryIncidents {
    rows: Mutex<Vec<Incident>>,
    /// Number of upcoming inserts or updates that fail.
    failing_writes: Mutex<usize>,
}

impl MemoryIncidents {
    fn all(&self) -> Vec<Incident> {
        self.rows.lock().unwrap().clone()
    }

    fn fail_next_writes(&self, count: usize) {
        *self.failing_writes.lock().unwrap() = count;
    }

    fn write_fails(&self) -> bool {
        let mut failing = self.failing_writes.lock().unwrap();
        if *failing == 0 {
            return false;
        }
        *failing -= 1;
        true
    }
}

#[async_trait]
impl IncidentStore for MemoryIncidents {
    async fn find_open(
        &self,
        alerts_id: i64,
        host_uuid: &str,
    ) -> Result<Option<Incident>, IncidentError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .find(|i| i.alerts_id == alerts_id && i.host_uuid == host_uuid && i.is_open())
            .cloned())
    }

    async fn insert(&self, new: NewIncident) -> Result<Incident, IncidentError> {
        // Yield so concurrent callers interleave between lookup and insert.
        tokio::task::yield_now().await;
        if self.write_fails() {
            return Err(IncidentError::Store("database is locked".into()));
        }
        let mut rows = self.rows.lock().unwrap();
        if rows
            .iter()
            .any(|i| i.alerts_id == new.alerts_id && i.host_uuid == new.host_uuid && i.is_open())
        {
            return Err(IncidentError::Conflict {
                alerts_id: new.alerts_id,
                host_uuid: new.host_uuid,
            });
        }
        let incident = Incident {
            id: rows.len() as i64 + 1,
            result: new.result,
            started_at: new.started_at,
            updated_at: new.started_at,
            resolved_at: None,
            host_uuid: new.host_uuid,
            hostname: new.hostname,
            status: IncidentStatus::Open,
            severity: new.severity,
            alerts_id: new.alerts_id,
            cid: new.cid,
        };
        rows.push(incident.clone());
        Ok(incident)
    }

    async fn update(&self, incident: &Incident) -> Result<(), IncidentError> {
        if self.write_fails() {
            return Err(IncidentError::Store("database is locked".into()));
        }
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|i| i.id == incident.id)
            .ok_or_else(|| IncidentError::Store("no such incident".into()))?;
        *row = incident.clone();
        Ok(())
    }
}

#[derive(Default)]
struct MemorySamples {
    rows: Mutex<Vec<MetricSample>>,
    fail: Mutex<bool>,
}

impl MemorySamples {
    fn push(&self, sample: MetricSample) {
        self.rows.lock().unwrap().push(sample);
    }
}

#[async_trait]
impl SampleSource for MemorySamples {
    async fn recent_samples(
        &self,
        host_uuid: &str,
        kind: SampleKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, BoxError> {
        if *self.fail.lock().unwrap() {
            return Err("sample store offline".into());
        }
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.host_uuid == host_uuid && s.kind() == kind && s.created_at >= since)
            .cloned()
            .collect())
    }
}

// ---- thresholds ----

#[test]
fn bare_thresholds_follow_rule_direction() {
    let above = Thresholds::parse("80", "90", Direction::Above).unwrap();
    assert_eq!(above.crit.op, CompareOp::GreaterThan);
    assert!(above.crit.breached_by(91.0));
    assert!(!above.crit.breached_by(90.0));

    let below = Thresholds::parse("20", "10", Direction::Below).unwrap();
    assert_eq!(below.warn.op, CompareOp::LessThan);
    assert!(below.warn.breached_by(15.0));
    assert!(!below.warn.breached_by(25.0));
}

#[test]
fn explicit_operator_overrides_direction() {
    let t = Thresholds::parse("$this < 20", "< 10", Direction::Above).unwrap();
    assert_eq!(t.direction, Direction::Below);
    assert!(t.crit.breached_by(5.0));

    // A bare expression takes the direction of its explicit sibling.
    let t = Thresholds::parse("$this >= 50", "75", Direction::Below).unwrap();
    assert_eq!(t.crit.op, CompareOp::GreaterThan);
    assert!(t.warn.breached_by(50.0));
}

#[test]
fn mixed_threshold_directions_are_rejected() {
    assert_eq!(
        Thresholds::parse("> 50", "< 10", Direction::Above),
        Err(ValidationError::MixedDirections)
    );
}

#[test]
fn threshold_order_is_checked_per_direction() {
    assert!(matches!(
        Thresholds::parse("90", "80", Direction::Above),
        Err(ValidationError::ThresholdOrder { .. })
    ));
    assert!(matches!(
        Thresholds::parse("10", "20", Direction::Below),
        Err(ValidationError::ThresholdOrder { .. })
    ));
    assert!(Thresholds::parse("50", "50", Direction::Below).is_ok());
}

#[test]
fn malformed_threshold_is_a_validation_error() {
    let err = Thresholds::parse("$this", "90", Direction::Above).unwrap_err();
    assert!(matches!(err, ValidationError::Threshold { which: "warn", .. }));
    let err = Thresholds::parse("80", "= 90", Direction::Above).unwrap_err();
    assert!(matches!(err, ValidationError::Threshold { which: "crit", .. }));
}

// ---- lookup and where clause ----

#[test]
fn lookup_query_grammar() {
    let lookup = Lookup::parse("avg pct 10m of avail_space over total_space", SampleKind::Disk)
        .unwrap();
    match lookup {
        Lookup::Query(q) => {
            assert_eq!(q.interval, Duration::minutes(10));
            assert_eq!(q.fields, vec!["avail_space"]);
            assert_eq!(q.over, vec!["total_space"]);
        }
        other => panic!("expected a query, got {other:?}"),
    }

    let lookup = Lookup::parse("max abs 30s of cuser, system", SampleKind::CpuTimes).unwrap();
    assert_eq!(lookup.referenced_fields(), vec!["cuser", "system"]);

    assert!(Lookup::parse("avg pct 10m of avail_space", SampleKind::Disk).is_err());
    assert!(Lookup::parse("avg abs 10m of idle over cuser", SampleKind::CpuTimes).is_err());
    assert!(Lookup::parse("median abs 10m of idle", SampleKind::CpuTimes).is_err());
    assert!(matches!(
        Lookup::parse("steal_time", SampleKind::CpuTimes),
        Err(ValidationError::UnknownField { .. })
    ));
    assert!(matches!(
        Lookup::parse("mount_point", SampleKind::Disk),
        Err(ValidationError::NotNumeric { .. })
    ));
}

#[test]
fn interval_units() {
    assert_eq!(parse_interval("45"), Some(Duration::seconds(45)));
    assert_eq!(parse_interval("2h"), Some(Duration::hours(2)));
    assert_eq!(parse_interval("1d"), Some(Duration::days(1)));
    assert_eq!(parse_interval("0m"), None);
    assert_eq!(parse_interval("5y"), None);
}

#[test]
fn pct_query_averages_over_interval() {
    let rule = compile(make_alert(
        1,
        "disks",
        "avg pct 10m of avail_space over total_space",
        "$this < 30",
        "$this < 10",
    ));
    let samples = vec![
        // Outside the 10 minute window, ignored.
        disk("host-a", -900, "/", 0, 100),
        disk("host-a", -300, "/", 30, 100),
        disk("host-a", 0, "/", 10, 100),
    ];
    match evaluate(&rule, &samples, at(0)) {
        Evaluation::Observed {
            status,
            value: Some(value),
        } => {
            assert_eq!(status, Status::Warning);
            assert!((value - 20.0).abs() < 1e-9);
        }
        other => panic!("unexpected evaluation {other:?}"),
    }
}

#[test]
fn pct_query_with_zero_divisor_is_skipped() {
    let rule = compile(make_alert(
        1,
        "disks",
        "sum pct 5m of avail_space over total_space",
        "< 30",
        "< 10",
    ));
    let samples = vec![disk("host-a", 0, "/", 0, 0)];
    assert_eq!(
        evaluate(&rule, &samples, at(0)),
        Evaluation::Skipped(SkipReason::DivisionByZero)
    );
}

#[test]
fn where_clause_parsing_and_type_checks() {
    let clause =
        WhereClause::parse("mount_point = '/' AND (total_space > 0 OR avail_space >= 1)", SampleKind::Disk)
            .unwrap();
    assert!(clause.matches(&disk("h", 0, "/", 5, 10)).unwrap());
    assert!(!clause.matches(&disk("h", 0, "/boot", 5, 10)).unwrap());

    assert!(WhereClause::parse("interface = 'eth0'", SampleKind::Disk).is_err());
    assert!(WhereClause::parse("mount_point > '/'", SampleKind::Disk).is_err());
    assert!(WhereClause::parse("total_space = '/'", SampleKind::Disk).is_err());
    assert!(WhereClause::parse("mount_point = '/", SampleKind::Disk).is_err());
    assert!(WhereClause::parse("total_space > 0 total_space", SampleKind::Disk).is_err());
}

// ---- evaluate ----

#[test]
fn evaluate_above_checks_crit_before_warn() {
    let rule = compile(make_alert(1, "cputimes", "cuser", "80", "90"));
    let status = |v| evaluate(&rule, &[cpu("host-a", 0, v, 0)], at(0)).status();
    assert_eq!(status(95), Some(Status::Critical));
    assert_eq!(status(85), Some(Status::Warning));
    assert_eq!(status(80), Some(Status::Normal));
}

#[test]
fn evaluate_below_direction() {
    let mut alert = make_alert(1, "cpu_times", "idle", "20", "10");
    alert.direction = Direction::Below;
    let rule = compile(alert);
    let status = |v| evaluate(&rule, &[cpu("host-a", 0, 0, v)], at(0)).status();
    assert_eq!(status(5), Some(Status::Critical));
    assert_eq!(status(15), Some(Status::Warning));
    assert_eq!(status(50), Some(Status::Normal));
}

#[test]
fn evaluate_uses_latest_sample_of_own_host() {
    let rule = compile(make_alert(1, "cputimes", "cuser", "80", "90"));
    let samples = vec![
        cpu("host-a", -20, 10, 0),
        cpu("host-b", 0, 99, 0),
        cpu("host-a", -10, 95, 0),
    ];
    assert_eq!(
        evaluate(&rule, &samples, at(0)).status(),
        Some(Status::Critical)
    );
}

#[test]
fn evaluate_without_samples_is_skipped() {
    let rule = compile(make_alert(1, "cputimes", "cuser", "80", "90"));
    assert_eq!(
        evaluate(&rule, &[], at(0)),
        Evaluation::Skipped(SkipReason::NoSample)
    );
    // Samples of another table do not count.
    let samples = vec![disk("host-a", 0, "/", 1, 2)];
    assert_eq!(
        evaluate(&rule, &samples, at(0)),
        Evaluation::Skipped(SkipReason::NoSample)
    );
}

#[test]
fn where_clause_without_match_forces_normal() {
    let mut alert = make_alert(1, "disks", "avail_space", "< 20", "< 10");
    alert.where_clause = Some("mount_point = '/data'".into());
    let rule = compile(alert);
    let samples = vec![disk("host-a", 0, "/", 1, 100)];
    assert_eq!(
        evaluate(&rule, &samples, at(0)),
        Evaluation::Observed {
            status: Status::Normal,
            value: None
        }
    );

    let samples = vec![disk("host-a", 0, "/", 1, 100), disk("host-a", 0, "/data", 5, 100)];
    assert_eq!(
        evaluate(&rule, &samples, at(0)).status(),
        Some(Status::Critical)
    );
}

// ---- debounce ----

#[test]
fn debounce_reports_after_sustained_timing() {
    let mut d = Debounce::default();
    let timing = Duration::seconds(30);
    assert_eq!(d.observe(Status::Warning, at(0), timing), None);
    assert_eq!(d.observe(Status::Warning, at(20), timing), None);
    let t = d.observe(Status::Warning, at(30), timing).unwrap();
    assert_eq!((t.from, t.to), (Status::Normal, Status::Warning));
    assert_eq!(d.reported(), Status::Warning);

    // Escalation is debounced as well, and interrupted by a different status.
    assert_eq!(d.observe(Status::Critical, at(40), timing), None);
    assert_eq!(d.observe(Status::Warning, at(50), timing), None);
    assert_eq!(d.observe(Status::Critical, at(60), timing), None);
    assert_eq!(d.observe(Status::Critical, at(80), timing), None);
    assert!(d.observe(Status::Critical, at(90), timing).is_some());
}

#[test]
fn breach_onset_spans_warning_and_critical_readings() {
    let mut d = Debounce::default();
    let timing = Duration::seconds(30);
    assert_eq!(d.observe(Status::Warning, at(0), timing), None);
    assert_eq!(d.observe(Status::Critical, at(10), timing), None);
    assert_eq!(d.observe(Status::Warning, at(20), timing), None);
    let t = d.observe(Status::Critical, at(30), timing).unwrap();
    assert_eq!((t.from, t.to), (Status::Normal, Status::Critical));

    // A normal reading ends the breach onset.
    let mut d = Debounce::default();
    d.observe(Status::Warning, at(0), timing);
    d.observe(Status::Normal, at(10), timing);
    assert_eq!(d.observe(Status::Critical, at(30), timing), None);
    assert_eq!(d.pending(), Some((Status::Critical, at(30))));
}

#[test]
fn zero_timing_reports_immediately() {
    let mut d = Debounce::default();
    let t = d.observe(Status::Critical, at(0), Duration::zero()).unwrap();
    assert_eq!(t.to, Status::Critical);
    assert_eq!(d.observe(Status::Critical, at(1), Duration::zero()), None);
    assert!(d.observe(Status::Normal, at(2), Duration::zero()).is_some());
}

// ---- registry ----

#[test]
fn registry_creation_requires_mandatory_fields() {
    let registry = AlertRegistry::new();
    let changes = AlertChanges::new()
        .with(AlertField::Name("load".into()))
        .with(AlertField::Table("loadavg".into()));
    let err = registry
        .upsert(AlertUpsert { id: None, changes })
        .unwrap_err();
    assert_eq!(
        err,
        RegistryError::Validation(ValidationError::MissingField("lookup"))
    );
    assert_eq!(registry.revision(), 0);
}

#[test]
fn registry_invalid_document_leaves_rules_unchanged() {
    let registry = AlertRegistry::new();
    let created = registry
        .upsert(creation(&make_alert(0, "cputimes", "cuser", "80", "90")))
        .unwrap();
    let revision = registry.revision();

    let err = registry
        .upsert(AlertUpsert {
            id: Some(created.alert.id),
            changes: AlertChanges::new().with(AlertField::Crit("70".into())),
        })
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Validation(ValidationError::ThresholdOrder { .. })
    ));
    assert_eq!(registry.revision(), revision);
    assert_eq!(registry.get(created.alert.id).unwrap().crit, "90");
}

#[test]
fn registry_partial_update_changes_only_warn() {
    let registry = AlertRegistry::new();
    let mut alert = make_alert(0, "disks", "avail_space", "< 20", "< 10");
    alert.info = Some("root volume".into());
    alert.where_clause = Some("mount_point = '/'".into());
    let before = registry.upsert(creation(&alert)).unwrap().alert;

    let after = registry
        .upsert(AlertUpsert {
            id: Some(before.id),
            changes: AlertChanges::new().with(AlertField::Warn("< 25".into())),
        })
        .unwrap();
    assert!(!after.created);

    let mut expected = before.clone();
    expected.warn = "< 25".into();
    assert_eq!(after.alert, expected);
}

#[test]
fn registry_creation_with_existing_key_updates_in_place() {
    let registry = AlertRegistry::new();
    let alert = make_alert(0, "cputimes", "cuser", "80", "90");
    let first = registry.upsert(creation(&alert)).unwrap();
    assert!(first.created);

    let mut again = alert.clone();
    again.warn = "85".into();
    again.table = "cpu_times".into();
    let second = registry.upsert(creation(&again)).unwrap();
    assert!(!second.created);
    assert_eq!(second.alert.id, first.alert.id);
    assert_eq!(second.alert.warn, "85");
    assert_eq!(registry.snapshot().len(), 1);

    // A different where clause is a different rule.
    let mut filtered = alert;
    filtered.where_clause = Some("cuser > 0".into());
    assert!(registry.upsert(creation(&filtered)).unwrap().created);
    assert_eq!(registry.snapshot().len(), 2);
}

#[test]
fn registry_activation_and_removal() {
    let registry = AlertRegistry::new();
    let id = registry
        .upsert(creation(&make_alert(0, "cputimes", "cuser", "80", "90")))
        .unwrap()
        .alert
        .id;

    assert_eq!(registry.deactivate(42), Err(RegistryError::NotFound(42)));
    assert!(!registry.deactivate(id).unwrap().active);
    assert_eq!(registry.list_active(Scope::All).count(), 0);
    assert!(registry.activate(id).unwrap().active);
    assert_eq!(registry.list_active(Scope::All).count(), 1);

    assert_eq!(registry.remove(id).map(|a| a.id), Some(id));
    assert!(registry.remove(id).is_none());
    assert!(registry.get(id).is_none());
}

#[test]
fn removing_unknown_rule_keeps_revision() {
    let registry = AlertRegistry::new();
    registry
        .upsert(creation(&make_alert(0, "cputimes", "cuser", "80", "90")))
        .unwrap();
    let revision = registry.revision();
    let snapshot = registry.snapshot();

    assert!(registry.remove(4242).is_none());
    assert_eq!(registry.revision(), revision);
    assert!(Arc::ptr_eq(&snapshot, &registry.snapshot()));
}

#[test]
fn update_cannot_take_the_key_of_another_rule() {
    let registry = AlertRegistry::new();
    let cuser = registry
        .upsert(creation(&make_alert(0, "cputimes", "cuser", "80", "90")))
        .unwrap()
        .alert;
    let idle = registry
        .upsert(creation(&make_alert(0, "cputimes", "idle", "80", "90")))
        .unwrap()
        .alert;
    let revision = registry.revision();

    let err = registry
        .upsert(AlertUpsert {
            id: Some(idle.id),
            changes: AlertChanges::new().with(AlertField::Lookup("cuser".into())),
        })
        .unwrap_err();
    assert_eq!(
        err,
        RegistryError::Validation(ValidationError::DuplicateKey {
            existing: cuser.id
        })
    );
    assert_eq!(registry.revision(), revision);
    assert_eq!(registry.get(idle.id).unwrap().lookup, "idle");

    // Rewriting a rule with its own key is an ordinary update.
    registry
        .upsert(AlertUpsert {
            id: Some(cuser.id),
            changes: AlertChanges::new().with(AlertField::Table("cpu_times".into())),
        })
        .unwrap();
}

#[test]
fn list_active_is_ordered_and_scoped() {
    let registry = AlertRegistry::new();
    let cluster = Uuid::new_v4();
    for (id, host, lookup) in [(30, "host-b", "cuser"), (10, "host-a", "cuser"), (20, "host-a", "idle")] {
        let mut alert = make_alert(id, "cputimes", lookup, "80", "90");
        alert.host_uuid = host.into();
        if host == "host-b" {
            alert.cid = cluster;
        }
        registry
            .upsert(AlertUpsert {
                id: Some(id),
                changes: AlertChanges::from(&alert),
            })
            .unwrap();
    }
    assert_eq!(registry.revision(), 3);

    let ids: Vec<i64> = registry.list_active(Scope::All).map(|r| r.id()).collect();
    assert_eq!(ids, vec![10, 20, 30]);
    let ids: Vec<i64> = registry
        .list_active(Scope::Host("host-a".into()))
        .map(|r| r.id())
        .collect();
    assert_eq!(ids, vec![10, 20]);
    let ids: Vec<i64> = registry
        .list_active(Scope::Cluster(cluster))
        .map(|r| r.id())
        .collect();
    assert_eq!(ids, vec![30]);

    // An iterator keeps reading the snapshot it started from.
    let iter = registry.list_active(Scope::All);
    registry.deactivate(20).unwrap();
    assert_eq!(iter.count(), 3);
    assert_eq!(registry.snapshot().active_hosts(), vec!["host-a", "host-b"]);
}

// ---- incidents ----

#[tokio::test]
async fn breach_opens_once_and_updates_on_severity_change() {
    let manager = IncidentManager::new(MemoryIncidents::default());
    let alert = make_alert(7, "cputimes", "cuser", "80", "90");

    let opened = manager
        .on_breach(&alert, "host-a", Severity::Warning, "85".into(), at(0))
        .await
        .unwrap();
    assert!(matches!(opened, BreachOutcome::Opened(_)));

    let same = manager
        .on_breach(&alert, "host-a", Severity::Warning, "86".into(), at(10))
        .await
        .unwrap();
    assert!(matches!(same, BreachOutcome::Unchanged(_)));
    assert_eq!(same.incident().updated_at, at(0));
    assert_eq!(same.incident().result, "85");

    let escalated = manager
        .on_breach(&alert, "host-a", Severity::Critical, "95".into(), at(20))
        .await
        .unwrap();
    match escalated {
        BreachOutcome::SeverityChanged { incident, previous } => {
            assert_eq!(previous, Severity::Warning);
            assert_eq!(incident.id, opened.incident().id);
            assert_eq!(incident.updated_at, at(20));
            assert_eq!(incident.started_at, at(0));
        }
        other => panic!("expected a severity change, got {other:?}"),
    }
    assert_eq!(manager.store().all().len(), 1);
}

#[tokio::test]
async fn resolve_twice_is_resolve_once() {
    let manager = IncidentManager::new(MemoryIncidents::default());
    let alert = make_alert(7, "cputimes", "cuser", "80", "90");

    assert!(manager.on_resolve(&alert, "host-a", at(0)).await.unwrap().is_none());

    manager
        .on_breach(&alert, "host-a", Severity::Critical, "95".into(), at(0))
        .await
        .unwrap();
    let resolved = manager
        .on_resolve(&alert, "host-a", at(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.resolved_at, Some(at(30)));
    assert_eq!(resolved.status, IncidentStatus::Resolved);
    assert_eq!(resolved.severity, Severity::Critical);
    let after_first = manager.store().all();

    assert!(manager.on_resolve(&alert, "host-a", at(60)).await.unwrap().is_none());
    assert_eq!(manager.store().all(), after_first);

    // A new breach after resolution opens a fresh incident.
    let reopened = manager
        .on_breach(&alert, "host-a", Severity::Warning, "85".into(), at(90))
        .await
        .unwrap();
    assert!(matches!(reopened, BreachOutcome::Opened(_)));
    assert_ne!(reopened.incident().id, resolved.id);
}

#[tokio::test]
async fn acknowledged_incident_stays_open() {
    let manager = IncidentManager::new(MemoryIncidents::default());
    let alert = make_alert(7, "cputimes", "cuser", "80", "90");

    assert!(manager.acknowledge("host-a", 7, at(0)).await.unwrap().is_none());
    manager
        .on_breach(&alert, "host-a", Severity::Warning, "85".into(), at(0))
        .await
        .unwrap();
    let acked = manager.acknowledge("host-a", 7, at(5)).await.unwrap().unwrap();
    assert_eq!(acked.status, IncidentStatus::Acknowledged);
    assert!(acked.is_open());

    let escalated = manager
        .on_breach(&alert, "host-a", Severity::Critical, "95".into(), at(10))
        .await
        .unwrap();
    assert_eq!(escalated.incident().status, IncidentStatus::Acknowledged);
    assert_eq!(escalated.incident().id, acked.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_breaches_open_a_single_incident() {
    let manager = Arc::new(IncidentManager::new(MemoryIncidents::default()));
    let alert = Arc::new(make_alert(7, "cputimes", "cuser", "80", "90"));

    let mut handles = Vec::new();
    for i in 0..32 {
        let manager = Arc::clone(&manager);
        let alert = Arc::clone(&alert);
        let severity = if i % 2 == 0 {
            Severity::Warning
        } else {
            Severity::Critical
        };
        handles.push(tokio::spawn(async move {
            manager
                .on_breach(&alert, "host-a", severity, format!("signal {i}"), at(i))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let rows = manager.store().all();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].is_open());
}

#[tokio::test]
async fn conflicting_insert_adopts_existing_incident() {
    let store = Arc::new(MemoryIncidents::default());
    let first = IncidentManager::new(Arc::clone(&store));
    let second = IncidentManager::new(Arc::clone(&store));
    let alert = make_alert(7, "cputimes", "cuser", "80", "90");

    // Warm the second manager's cache while nothing is open.
    assert!(second.open_incident(7, "host-a").await.unwrap().is_none());
    first
        .on_breach(&alert, "host-a", Severity::Warning, "85".into(), at(0))
        .await
        .unwrap();

    let outcome = second
        .on_breach(&alert, "host-a", Severity::Critical, "95".into(), at(10))
        .await
        .unwrap();
    assert!(matches!(outcome, BreachOutcome::SeverityChanged { .. }));
    assert_eq!(store.all().len(), 1);
    assert_eq!(store.all()[0].severity, Severity::Critical);
}

// ---- engine ----

fn engine() -> AlertEngine<Arc<MemoryIncidents>> {
    AlertEngine::new(Arc::new(MemoryIncidents::default()), Duration::hours(1))
}

#[tokio::test]
async fn sustained_breach_opens_after_timing() {
    let engine = engine();
    let samples = MemorySamples::default();
    let host = make_host("host-a");
    let registry = AlertRegistry::new();
    let mut alert = make_alert(1, "cputimes", "cuser", "80", "90");
    alert.timing = 60;
    registry
        .upsert(AlertUpsert {
            id: Some(1),
            changes: AlertChanges::from(&alert),
        })
        .unwrap();
    let snapshot = registry.snapshot();

    // 95, 95, then a dip to 40 restarts the period; 95 from t=30 on.
    let readings = [(0, 95), (10, 95), (20, 40), (30, 95), (40, 95), (50, 95), (60, 95), (70, 95), (80, 95)];
    for (secs, value) in readings {
        samples.push(cpu("host-a", secs, value, 0));
        let report = engine.run_host(&snapshot, &host, &samples, at(secs)).await.unwrap();
        assert_eq!(report.opened, 0, "opened too early at t={secs}");
    }
    assert!(engine.incidents().store().all().is_empty());

    samples.push(cpu("host-a", 90, 95, 0));
    let report = engine.run_host(&snapshot, &host, &samples, at(90)).await.unwrap();
    assert_eq!(report.opened, 1);
    let rows = engine.incidents().store().all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].severity, Severity::Critical);
    assert_eq!(rows[0].started_at, at(90));
    assert_eq!(rows[0].hostname, "web-01");
}

#[tokio::test]
async fn idle_headroom_escalates_the_same_incident() {
    let engine = engine();
    let samples = MemorySamples::default();
    let host = make_host("host-a");
    let registry = AlertRegistry::new();
    let changes: AlertChanges = serde_json::from_value(serde_json::json!({
        "name": "cpu idle",
        "table": "cpu_times",
        "lookup": "idle",
        "warn": 20,
        "crit": 10,
        "timing": 30,
        "direction": "below",
        "host_uuid": "host-a",
        "cid": Uuid::nil(),
    }))
    .unwrap();
    registry.upsert(AlertUpsert { id: None, changes }).unwrap();
    let snapshot = registry.snapshot();

    let tick = |secs: i64, idle: i64| {
        samples.push(cpu("host-a", secs, 0, idle));
        secs
    };

    for secs in [0, 10, 20] {
        let now = tick(secs, 15);
        engine.run_host(&snapshot, &host, &samples, at(now)).await.unwrap();
    }
    assert!(engine.incidents().store().all().is_empty());
    let now = tick(30, 15);
    let report = engine.run_host(&snapshot, &host, &samples, at(now)).await.unwrap();
    assert_eq!(report.opened, 1);
    let opened = engine.incidents().store().all()[0].clone();
    assert_eq!(opened.severity, Severity::Warning);
    assert_eq!(opened.hostname, "host-a");

    for secs in [40, 50, 60] {
        let now = tick(secs, 5);
        engine.run_host(&snapshot, &host, &samples, at(now)).await.unwrap();
    }
    let now = tick(70, 5);
    let report = engine.run_host(&snapshot, &host, &samples, at(now)).await.unwrap();
    assert_eq!(report.severity_changed, 1);

    let rows = engine.incidents().store().all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, opened.id);
    assert_eq!(rows[0].severity, Severity::Critical);
    assert_eq!(rows[0].updated_at, at(70));
}

#[tokio::test]
async fn recovery_resolves_and_missing_samples_hold_state() {
    let engine = engine();
    let samples = MemorySamples::default();
    let host = make_host("host-a");
    let registry = AlertRegistry::new();
    registry
        .upsert(AlertUpsert {
            id: Some(1),
            changes: AlertChanges::from(&make_alert(1, "cputimes", "cuser", "80", "90")),
        })
        .unwrap();
    let snapshot = registry.snapshot();

    samples.push(cpu("host-a", 0, 99, 0));
    assert_eq!(engine.run_host(&snapshot, &host, &samples, at(0)).await.unwrap().opened, 1);

    // Ten minutes without data: the field lookup finds nothing and the
    // incident stays open.
    let report = engine.run_host(&snapshot, &host, &samples, at(600)).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert!(engine.incidents().store().all()[0].is_open());

    samples.push(cpu("host-a", 610, 10, 0));
    let report = engine.run_host(&snapshot, &host, &samples, at(610)).await.unwrap();
    assert_eq!(report.resolved, 1);
    assert!(!engine.incidents().store().all()[0].is_open());
}

#[tokio::test]
async fn sample_source_failure_aborts_the_host_pass() {
    let engine = engine();
    let samples = MemorySamples::default();
    *samples.fail.lock().unwrap() = true;
    let registry = AlertRegistry::new();
    registry
        .upsert(creation(&make_alert(0, "cputimes", "cuser", "80", "90")))
        .unwrap();

    let err = engine
        .run_host(&registry.snapshot(), &make_host("host-a"), &samples, at(0))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("host-a"));
}

#[tokio::test]
async fn open_incident_restores_reported_status() {
    let store = Arc::new(MemoryIncidents::default());
    let alert = make_alert(1, "cputimes", "cuser", "80", "90");
    IncidentManager::new(Arc::clone(&store))
        .on_breach(&alert, "host-a", Severity::Critical, "95".into(), at(0))
        .await
        .unwrap();

    // A fresh engine, as after a restart, keeps the incident while the
    // breach persists and resolves it on recovery.
    let engine = AlertEngine::new(Arc::clone(&store), Duration::hours(1));
    let registry = AlertRegistry::new();
    registry
        .upsert(AlertUpsert {
            id: Some(1),
            changes: AlertChanges::from(&alert),
        })
        .unwrap();
    let samples = MemorySamples::default();
    let host = make_host("host-a");

    samples.push(cpu("host-a", 100, 99, 0));
    let report = engine.run_host(&registry.snapshot(), &host, &samples, at(100)).await.unwrap();
    assert_eq!((report.opened, report.severity_changed), (0, 0));

    samples.push(cpu("host-a", 110, 1, 0));
    let report = engine.run_host(&registry.snapshot(), &host, &samples, at(110)).await.unwrap();
    assert_eq!(report.resolved, 1);
    assert_eq!(store.all().len(), 1);
}

#[tokio::test]
async fn refresh_drops_state_of_changed_rules() {
    let engine = engine();
    let samples = MemorySamples::default();
    let host = make_host("host-a");
    let registry = AlertRegistry::new();
    let mut alert = make_alert(1, "cputimes", "cuser", "80", "90");
    alert.timing = 60;
    registry
        .upsert(AlertUpsert {
            id: Some(1),
            changes: AlertChanges::from(&alert),
        })
        .unwrap();
    engine.refresh(&registry.snapshot()).await;

    samples.push(cpu("host-a", 0, 95, 0));
    engine.run_host(&registry.snapshot(), &host, &samples, at(0)).await.unwrap();
    assert!(engine.evaluator().state(1, "host-a").unwrap().pending().is_some());

    // Unchanged snapshot: nothing dropped.
    engine.refresh(&registry.snapshot()).await;
    assert!(engine.evaluator().is_tracked(1, "host-a"));

    registry
        .upsert(AlertUpsert {
            id: Some(1),
            changes: AlertChanges::new().with(AlertField::Warn("85".into())),
        })
        .unwrap();
    engine.refresh(&registry.snapshot()).await;
    assert!(!engine.evaluator().is_tracked(1, "host-a"));
    assert_eq!(engine.evaluator().tracked_pairs(), 0);
}

#[tokio::test]
async fn inactive_rules_are_not_evaluated() {
    let engine = engine();
    let samples = MemorySamples::default();
    let registry = AlertRegistry::new();
    let id = registry
        .upsert(creation(&make_alert(0, "cputimes", "cuser", "80", "90")))
        .unwrap()
        .alert
        .id;
    registry.deactivate(id).unwrap();

    samples.push(cpu("host-a", 0, 99, 0));
    let report = engine
        .run_host(&registry.snapshot(), &make_host("host-a"), &samples, at(0))
        .await
        .unwrap();
    assert_eq!(report.evaluated, 0);
    assert!(engine.incidents().store().all().is_empty());
}

fn single_rule(alert: &Alert) -> Arc<crate::registry::RuleSnapshot> {
    let registry = AlertRegistry::new();
    registry
        .upsert(AlertUpsert {
            id: Some(alert.id),
            changes: AlertChanges::from(alert),
        })
        .unwrap();
    registry.snapshot()
}

#[tokio::test]
async fn readings_between_warn_and_crit_open_after_timing() {
    let engine = engine();
    let samples = MemorySamples::default();
    let host = make_host("host-a");
    let mut alert = make_alert(1, "cputimes", "cuser", "80", "90");
    alert.timing = 30;
    let snapshot = single_rule(&alert);

    // Above warn the whole time, crossing crit on every other reading.
    for (secs, value) in [(0, 85), (10, 95), (20, 85)] {
        samples.push(cpu("host-a", secs, value, 0));
        engine.run_host(&snapshot, &host, &samples, at(secs)).await.unwrap();
    }
    assert!(engine.incidents().store().all().is_empty());

    samples.push(cpu("host-a", 30, 95, 0));
    let report = engine.run_host(&snapshot, &host, &samples, at(30)).await.unwrap();
    assert_eq!(report.opened, 1);
    assert_eq!(engine.incidents().store().all()[0].severity, Severity::Critical);
}

#[tokio::test]
async fn recovery_waits_for_sustained_normal_readings() {
    let engine = engine();
    let samples = MemorySamples::default();
    let host = make_host("host-a");
    let mut alert = make_alert(1, "cputimes", "cuser", "80", "90");
    alert.timing = 30;
    let snapshot = single_rule(&alert);

    for secs in [0, 10, 20, 30] {
        samples.push(cpu("host-a", secs, 95, 0));
        engine.run_host(&snapshot, &host, &samples, at(secs)).await.unwrap();
    }
    assert!(engine.incidents().store().all()[0].is_open());

    // One normal reading, then the breach is back.
    samples.push(cpu("host-a", 40, 10, 0));
    let report = engine.run_host(&snapshot, &host, &samples, at(40)).await.unwrap();
    assert_eq!(report.resolved, 0);
    samples.push(cpu("host-a", 50, 95, 0));
    engine.run_host(&snapshot, &host, &samples, at(50)).await.unwrap();
    assert!(engine.incidents().store().all()[0].is_open());

    for secs in [60, 70, 80] {
        samples.push(cpu("host-a", secs, 10, 0));
        let report = engine.run_host(&snapshot, &host, &samples, at(secs)).await.unwrap();
        assert_eq!(report.resolved, 0, "resolved too early at t={secs}");
    }
    samples.push(cpu("host-a", 90, 10, 0));
    let report = engine.run_host(&snapshot, &host, &samples, at(90)).await.unwrap();
    assert_eq!(report.resolved, 1);

    let rows = engine.incidents().store().all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].resolved_at, Some(at(90)));
}

#[tokio::test]
async fn failed_incident_insert_is_retried_next_pass() {
    let engine = engine();
    let samples = MemorySamples::default();
    let host = make_host("host-a");
    let snapshot = single_rule(&make_alert(1, "cputimes", "cuser", "80", "90"));

    engine.incidents().store().fail_next_writes(1);
    samples.push(cpu("host-a", 10, 99, 0));
    assert!(engine.run_host(&snapshot, &host, &samples, at(10)).await.is_err());
    assert!(engine.incidents().store().all().is_empty());
    assert_eq!(
        engine.evaluator().state(1, "host-a").unwrap().reported(),
        Status::Normal
    );

    samples.push(cpu("host-a", 20, 99, 0));
    let report = engine.run_host(&snapshot, &host, &samples, at(20)).await.unwrap();
    assert_eq!(report.opened, 1);
    assert_eq!(engine.incidents().store().all().len(), 1);
}

#[tokio::test]
async fn failed_resolve_is_retried_next_pass() {
    let engine = engine();
    let samples = MemorySamples::default();
    let host = make_host("host-a");
    let mut alert = make_alert(1, "cputimes", "cuser", "80", "90");
    alert.timing = 20;
    let snapshot = single_rule(&alert);

    for secs in [0, 10, 20] {
        samples.push(cpu("host-a", secs, 99, 0));
        engine.run_host(&snapshot, &host, &samples, at(secs)).await.unwrap();
    }
    assert!(engine.incidents().store().all()[0].is_open());

    for secs in [30, 40] {
        samples.push(cpu("host-a", secs, 1, 0));
        engine.run_host(&snapshot, &host, &samples, at(secs)).await.unwrap();
    }
    engine.incidents().store().fail_next_writes(1);
    samples.push(cpu("host-a", 50, 1, 0));
    assert!(engine.run_host(&snapshot, &host, &samples, at(50)).await.is_err());
    assert!(engine.incidents().store().all()[0].is_open());

    // The recovery that started at t=30 still counts.
    samples.push(cpu("host-a", 60, 1, 0));
    let report = engine.run_host(&snapshot, &host, &samples, at(60)).await.unwrap();
    assert_eq!(report.resolved, 1);
    let rows = engine.incidents().store().all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].resolved_at, Some(at(60)));
}
