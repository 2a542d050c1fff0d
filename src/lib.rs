pub mod agent_engine;
pub mod config;
pub mod errors;
pub mod executor;
pub mod llm;
pub mod perception;
pub mod protocol;
pub mod supervisor;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

use std::sync::Arc;
use std::time::Duration;

use crate::agent_engine::{Collaborators, RunManager, RunStatus};
use crate::config::AppConfig;
use crate::errors::MirrorClawResult;
use crate::llm::registry::ProviderRegistry;
use crate::llm::ModelClient;
use crate::supervisor::Supervisor;

const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// `fmt` subscriber filtered by `RUST_LOG`, `info` when unset. Safe to call twice.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Loads `.env` and `config.toml`; a missing or broken file falls back to defaults.
pub fn bootstrap_config() -> AppConfig {
    // Load .env file if present (ignore error if not found)
    let _ = dotenvy::dotenv();
    match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "using default configuration");
            AppConfig::default()
        }
    }
}

#[cfg(feature = "desktop")]
fn desktop_collaborators(cfg: &AppConfig, model: Arc<dyn ModelClient>) -> MirrorClawResult<Collaborators> {
    Ok(Collaborators {
        perception: Arc::new(perception::screenshot::XcapWindowCapture::new(cfg.perception.clone())),
        model,
        executor: Arc::new(executor::input::EnigoExecutor::new()),
    })
}

#[cfg(not(feature = "desktop"))]
fn desktop_collaborators(_cfg: &AppConfig, _model: Arc<dyn ModelClient>) -> MirrorClawResult<Collaborators> {
    Err(errors::MirrorClawError::Config(
        "built without the `desktop` feature: no capture or input backend available".into(),
    ))
}

/// Runs one instruction against the mirrored device, serving the control plane
/// alongside when enabled. Ctrl-C requests a stop and waits for the run to settle.
pub async fn run(config: AppConfig, instruction: String) -> MirrorClawResult<RunStatus> {
    let config = Arc::new(config);
    let registry = ProviderRegistry::from_config(&config);
    let model = registry.get_active()?;
    tracing::info!(provider = %model.name(), "model provider selected");
    let collab = desktop_collaborators(&config, model)?;

    let manager = Arc::new(RunManager::new(config.clone()));
    let _sweeper = manager.spawn_sweeper(SWEEP_PERIOD);
    let supervisor = Supervisor::new(manager.clone());

    if config.supervisor.enabled {
        let server = supervisor.clone();
        let sup_cfg = config.supervisor.clone();
        let token = config.supervisor_token();
        tokio::spawn(async move {
            if let Err(e) = supervisor::serve(server, &sup_cfg, token).await {
                tracing::error!(error = %e, "supervisor server stopped");
            }
        });
    }

    let entry = manager.start_run(instruction, collab).await?;
    tracing::info!(run_id = %entry.run_id, "run started");

    let status = tokio::select! {
        status = entry.wait_finished() => status,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(run_id = %entry.run_id, "interrupt received, stopping run");
            supervisor.stop(&entry.run_id).await?;
            entry.wait_finished().await
        }
    };

    tracing::info!(
        run_id = %status.run_id,
        state = %status.state,
        turns = status.turns,
        reason = status.termination_reason.as_deref().unwrap_or(""),
        "run finished"
    );
    Ok(status)
}
