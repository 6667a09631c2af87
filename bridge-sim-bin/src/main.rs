mod scenario;

use bridge_runtime::BridgeError;
use scenario::{Scenario, Simulation};

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}

#[tokio::main]
async fn main() -> Result<(), BridgeError> {
    dotenvy::dotenv().ok();
    setup_log();

    // ── 1. Scenario ──────────────────────────────────────────────────────────
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BRIDGE_SCENARIO").ok())
        .ok_or_else(|| {
            BridgeError::ConfigError(
                "usage: bridge-sim <scenario.toml> (or set BRIDGE_SCENARIO)".into(),
            )
        })?;
    let scenario = Scenario::from_file(&path)?;
    tracing::info!(%path, steps = scenario.steps.len(), "Loaded scenario");

    // ── 2. Replay ────────────────────────────────────────────────────────────
    let mut sim = Simulation::build(&scenario).await?;
    let report = sim.run(&scenario.steps).await;
    let failed = report.steps.iter().filter(|s| !s.ok).count();
    tracing::info!(
        processor = %sim.processor().address(),
        failed,
        "Scenario finished"
    );

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
