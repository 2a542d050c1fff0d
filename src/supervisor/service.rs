use std::sync::Arc;

use crate::agent_engine::state::ControlCommand;
use crate::agent_engine::{
    CommandReceipt, ControlKind, EventSubscription, RunManager, RunStatus, Turn,
};
use crate::errors::SupervisorError;

/// Control-plane handle over every run the manager tracks. Cloning is cheap; every
/// method returns without waiting on a worker.
#[derive(Clone)]
pub struct Supervisor {
    runs: Arc<RunManager>,
}

impl Supervisor {
    pub fn new(runs: Arc<RunManager>) -> Self {
        Self { runs }
    }

    pub fn manager(&self) -> &Arc<RunManager> {
        &self.runs
    }

    /// Last `n` committed turns, oldest first.
    pub async fn get_recent_turns(&self, run_id: &str, n: usize) -> Result<Vec<Turn>, SupervisorError> {
        let entry = self.runs.get(run_id).await?;
        Ok(entry.turns.recent(n))
    }

    /// Retained events with `seq >= from_seq`, then live ones.
    pub async fn subscribe_events(
        &self,
        run_id: &str,
        from_seq: u64,
    ) -> Result<EventSubscription, SupervisorError> {
        let entry = self.runs.get(run_id).await?;
        Ok(entry.events.subscribe(from_seq))
    }

    pub async fn pause(&self, run_id: &str) -> Result<CommandReceipt, SupervisorError> {
        self.submit(run_id, ControlKind::Pause, None).await
    }

    pub async fn resume(&self, run_id: &str) -> Result<CommandReceipt, SupervisorError> {
        self.submit(run_id, ControlKind::Resume, None).await
    }

    pub async fn stop(&self, run_id: &str) -> Result<CommandReceipt, SupervisorError> {
        self.submit(run_id, ControlKind::Stop, None).await
    }

    /// Queues guidance for the next prompt. Blank text is rejected.
    pub async fn inject(&self, run_id: &str, text: &str) -> Result<CommandReceipt, SupervisorError> {
        self.submit(run_id, ControlKind::Inject, Some(text.to_string())).await
    }

    /// Single entry point for transports that carry the command kind as data.
    pub async fn submit(
        &self,
        run_id: &str,
        kind: ControlKind,
        payload: Option<String>,
    ) -> Result<CommandReceipt, SupervisorError> {
        let entry = self.runs.get(run_id).await?;
        let payload = match kind {
            ControlKind::Inject => {
                let text = payload.map(|t| t.trim().to_string()).unwrap_or_default();
                if text.is_empty() {
                    return Err(SupervisorError::InvalidCommand(
                        "inject requires non-empty text".into(),
                    ));
                }
                Some(text)
            }
            _ => None,
        };
        let receipt = entry.control.submit(ControlCommand {
            run_id: entry.run_id.clone(),
            kind,
            payload,
        });
        tracing::info!(
            run_id = %receipt.run_id,
            command = kind.as_str(),
            outcome = ?receipt.outcome,
            state = %receipt.state,
            "control command received"
        );
        Ok(receipt)
    }

    pub async fn status(&self, run_id: &str) -> Result<RunStatus, SupervisorError> {
        Ok(self.runs.get(run_id).await?.status())
    }

    pub async fn list_runs(&self) -> Vec<RunStatus> {
        self.runs.list().await
    }
}
