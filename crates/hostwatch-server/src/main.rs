use anyhow::Result;
use hostwatch_server::config::ServerConfig;
use hostwatch_server::rule_seed;
use hostwatch_server::scheduler::EvaluationScheduler;
use hostwatch_server::state::AppState;
use hostwatch_storage::SampleStorage;
use std::path::Path;
use tokio::signal;
use tokio::time::{interval, Duration};
use tracing_subscriber::EnvFilter;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  hostwatch-server [config.toml]                             Start the evaluation scheduler");
    eprintln!("  hostwatch-server init-rules <config.toml> <rules-dir>      Load alert rule seeds for known hosts");
}

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("hostwatch=info".parse()?);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    hostwatch_common::id::init(1, 1);

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("init-rules") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-rules requires <config.toml> and <rules-dir> arguments")
            })?;
            let rules_dir = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-rules requires <rules-dir> argument")
            })?;
            let config = ServerConfig::load(config_path)?;
            init_logging(config.log.json)?;
            run_init_rules(config, rules_dir).await
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/server.toml");
            let config = ServerConfig::load(config_path)?;
            init_logging(config.log.json)?;
            run_server(config).await
        }
    }
}

/// Load alert rule seed documents and attach them to the registered hosts.
async fn run_init_rules(config: ServerConfig, rules_dir: &str) -> Result<()> {
    let state = AppState::build(config).await?;
    let configs = rule_seed::load_seed_dir(Path::new(rules_dir))?;
    tracing::info!(documents = configs.len(), dir = %rules_dir, "Seeding alert rules");
    let report = rule_seed::apply_seeds(&state, &configs).await?;
    if report.rejected > 0 {
        anyhow::bail!("{} alert seed(s) were rejected", report.rejected);
    }
    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<()> {
    tracing::info!(
        data_dir = %config.data_dir,
        db = %config.redacted_url(),
        "hostwatch-server starting"
    );

    let state = AppState::build(config).await?;

    // Periodic cleanup task
    let retention_days = state.config.retention_days;
    let cleanup_samples = state.samples.clone();
    let cleanup_handle = tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(3600)); // Every hour
        loop {
            tick.tick().await;
            match cleanup_samples.cleanup(retention_days) {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "Cleaned up expired partitions")
                }
                Err(e) => tracing::error!(error = %e, "Cleanup failed"),
                _ => {}
            }
        }
    });

    let scheduler = EvaluationScheduler::new(state.clone());
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run().await;
    });

    tracing::info!(rules = state.registry.snapshot().len(), "Server started");

    signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully");

    scheduler_handle.abort();
    cleanup_handle.abort();
    state.store.close().await?;
    tracing::info!("Server stopped");

    Ok(())
}
