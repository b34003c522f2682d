#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use hostwatch_alert::AlertUpsert;
use hostwatch_common::alert::{Alert, AlertChanges};
use hostwatch_common::types::{CpuTimes, Host, MetricSample, SampleData};
use hostwatch_server::config::ServerConfig;
use hostwatch_server::state::AppState;
use serde_json::Value;
use tempfile::TempDir;

pub struct TestContext {
    pub temp_dir: TempDir,
    pub state: AppState,
}

pub fn test_config(temp_dir: &TempDir) -> ServerConfig {
    ServerConfig {
        data_dir: temp_dir.path().join("data").to_string_lossy().to_string(),
        ..Default::default()
    }
}

pub async fn build_test_context() -> Result<TestContext> {
    hostwatch_common::id::init(1, 1);
    let temp_dir = tempfile::tempdir()?;
    let state = AppState::build(test_config(&temp_dir)).await?;
    Ok(TestContext { temp_dir, state })
}

impl TestContext {
    /// A second server instance over the same data directory.
    pub async fn restart(&self) -> Result<AppState> {
        AppState::build(test_config(&self.temp_dir)).await
    }
}

pub fn make_host(uuid: &str, hostname: &str) -> Host {
    let now = Utc::now();
    Host {
        uuid: uuid.to_string(),
        system: "Linux".to_string(),
        os_version: "6.1".to_string(),
        hostname: hostname.to_string(),
        uptime: 3600,
        sync_interval: Some(10),
        created_at: now,
        updated_at: now,
    }
}

pub fn cpu_sample(host: &str, at: DateTime<Utc>, idle: i64) -> MetricSample {
    MetricSample::new(
        host,
        at,
        SampleData::CpuTimes(CpuTimes {
            cuser: 100 - idle,
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

/// Reports one cpu sample for the host, `secs_before` seconds before `now`.
pub async fn report_idle(
    state: &AppState,
    host: &Host,
    now: DateTime<Utc>,
    secs_before: i64,
    idle: i64,
) -> Result<()> {
    let sample = cpu_sample(&host.uuid, now - Duration::seconds(secs_before), idle);
    state.ingest(host, &[sample]).await
}

pub async fn create_rule(state: &AppState, doc: Value) -> Result<Alert> {
    let changes: AlertChanges = serde_json::from_value(doc)?;
    let upserted = state
        .upsert_alert(AlertUpsert { id: None, changes })
        .await?;
    Ok(upserted.alert)
}

pub fn idle_rule(host_uuid: &str) -> Value {
    serde_json::json!({
        "name": "cpu idle",
        "table": "cputimes",
        "lookup": "idle",
        "timing": 0,
        "warn": 20,
        "crit": 10,
        "direction": "below",
        "host_uuid": host_uuid,
        "hostname": "web-01",
        "cid": "00000000-0000-0000-0000-000000000000",
    })
}
