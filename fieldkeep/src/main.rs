use std::sync::Arc;

use fieldkeep::clock::{SharedClock, SystemClock};
use fieldkeep::components::{self, build_plan};
use fieldkeep::config::OrchestratorConfig;
use fieldkeep::plan::{PlanState, StartOutcome};
use fieldkeep::queue::LogNotificationSink;
use fieldkeep::{Orchestrator, logging, panic_hook};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let config = OrchestratorConfig::from_env_or_default();

    let log_handle = logging::init_logging(&config)?;
    panic_hook::install(&config.log_dir);

    info!(
        data_dir = %config.data_dir.display(),
        plans_dir = %config.plans_dir.display(),
        health_test_interval_secs = config.health_test_interval.as_secs(),
        "fieldkeep starting"
    );

    let clock: SharedClock = Arc::new(SystemClock);
    let (orchestrator, firings) =
        Orchestrator::bootstrap(config.clone(), Arc::clone(&clock), Arc::new(LogNotificationSink))
            .await?;
    log_handle.start_retention_cleanup(orchestrator.cancellation_token());

    let mut autostart = Vec::new();
    for definition in components::load_definitions(&config.plans_dir).await? {
        let registered = build_plan(&definition, &config.data_dir, orchestrator.queue(), &clock)
            .and_then(|plan| orchestrator.add_plan(plan));
        match registered {
            Ok(_) if definition.autostart => autostart.push(definition.id),
            Ok(_) => {}
            Err(e) => warn!(plan_id = %definition.id, error = %e, "Skipping plan"),
        }
    }

    let restored = orchestrator.restore().await;
    info!(plans = orchestrator.registry().len(), restored, "Plans loaded");

    for id in autostart {
        let Ok(plan) = orchestrator.plan(&id) else {
            continue;
        };
        if plan.state() != PlanState::Stopped {
            continue;
        }
        match orchestrator.start_plan(&id, false).await {
            Ok(StartOutcome::Scheduled { at }) => {
                info!(plan_id = %id, start_at = %at, "Plan waiting for its start time")
            }
            Ok(_) => {}
            Err(e) => warn!(plan_id = %id, error = %e.user_message(), "Plan failed to start"),
        }
    }

    orchestrator.start_supervision();
    let run_loop = tokio::spawn(Arc::clone(&orchestrator).run(firings));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    orchestrator.shutdown().await;
    if let Err(e) = run_loop.await {
        warn!(error = %e, "Run loop ended abnormally");
    }

    info!("fieldkeep stopped");
    Ok(())
}
