use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::agent_engine::control::ControlQueue;
use crate::agent_engine::engine::{Collaborators, RunChannels, RunWorker};
use crate::agent_engine::event_bus::{EventBus, EventKind};
use crate::agent_engine::recorder::{RunMeta, RunRecorder, TurnLog};
use crate::agent_engine::state::{RunState, RunStatus};
use crate::config::AppConfig;
use crate::errors::{MirrorClawResult, SupervisorError};

/// Everything the control plane may touch for one run. None of it blocks the worker.
pub struct RunEntry {
    pub run_id: String,
    pub control: Arc<ControlQueue>,
    pub events: Arc<EventBus>,
    pub turns: TurnLog,
    status: watch::Receiver<RunStatus>,
}

impl RunEntry {
    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    /// Resolves once the run reaches `Stopped` or `Errored`.
    pub async fn wait_finished(&self) -> RunStatus {
        let mut rx = self.status.clone();
        let done = rx
            .wait_for(|s| s.state.is_terminal())
            .await
            .map(|s| s.clone());
        match done {
            Ok(status) => status,
            // Worker gone: its last published status is final.
            Err(_) => rx.borrow().clone(),
        }
    }
}

/// Makes a worker that died without finishing show up as `errored`.
async fn reap_worker(
    worker: JoinHandle<RunStatus>,
    status: Arc<watch::Sender<RunStatus>>,
    control: Arc<ControlQueue>,
    events: Arc<EventBus>,
) {
    let Err(e) = worker.await else {
        return;
    };
    let from = status.borrow().state;
    if from.is_terminal() {
        return;
    }
    tracing::error!(run_id = %events.run_id(), error = %e, state = %from, "run worker died");
    status.send_modify(|s| {
        s.state = RunState::Errored;
        s.termination_reason = Some("worker_panicked".into());
        s.finished_at = Some(chrono::Utc::now());
    });
    control.sync_state(RunState::Errored);
    events.publish(
        EventKind::StateChanged,
        serde_json::json!({
            "from": from.as_str(),
            "to": RunState::Errored.as_str(),
            "reason": "worker_panicked",
        }),
    );
}

/// Owns the map of tracked runs.
pub struct RunManager {
    config: Arc<AppConfig>,
    record_root: PathBuf,
    runs: RwLock<HashMap<String, Arc<RunEntry>>>,
}

impl RunManager {
    pub fn new(config: Arc<AppConfig>) -> Self {
        let record_root = config.recorder.resolved_dir();
        Self {
            config,
            record_root,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    /// Creates the run's record directory and spawns its worker task.
    pub async fn start_run(
        &self,
        instruction: impl Into<String>,
        collab: Collaborators,
    ) -> MirrorClawResult<Arc<RunEntry>> {
        let instruction = instruction.into();
        let run_id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now();

        let meta = RunMeta {
            run_id: run_id.clone(),
            instruction: instruction.clone(),
            created_at,
            config: serde_json::to_value(self.config.redacted())?,
        };
        let recorder = RunRecorder::create(&self.record_root, &meta, self.config.recorder.save_snapshots)?;

        let sup = &self.config.supervisor;
        let events = Arc::new(EventBus::new(
            run_id.clone(),
            sup.event_buffer,
            sup.replay_capacity,
            sup.overflow,
        ));
        let control = Arc::new(ControlQueue::new());
        let (status_tx, status_rx) = watch::channel(RunStatus {
            run_id: run_id.clone(),
            instruction: instruction.clone(),
            created_at,
            state: RunState::Idle,
            turns: 0,
            step_budget: self.config.agent.max_steps,
            termination_reason: None,
            pending_injections: 0,
            finished_at: None,
        });
        let status_tx = Arc::new(status_tx);

        let entry = Arc::new(RunEntry {
            run_id: run_id.clone(),
            control: control.clone(),
            events: events.clone(),
            turns: recorder.log(),
            status: status_rx,
        });
        self.runs.write().await.insert(run_id.clone(), entry.clone());

        let worker = RunWorker::new(
            instruction,
            self.config.clone(),
            collab,
            recorder,
            RunChannels {
                control: control.clone(),
                events: events.clone(),
                status: status_tx.clone(),
            },
        );
        tracing::info!(run_id = %run_id, "spawning run worker");
        let worker = tokio::spawn(worker.run());
        tokio::spawn(reap_worker(worker, status_tx, control, events));
        Ok(entry)
    }

    pub async fn get(&self, run_id: &str) -> Result<Arc<RunEntry>, SupervisorError> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownRun(run_id.to_string()))
    }

    /// Status of every tracked run, oldest first.
    pub async fn list(&self) -> Vec<RunStatus> {
        let mut statuses: Vec<RunStatus> =
            self.runs.read().await.values().map(|e| e.status()).collect();
        statuses.sort_by_key(|s| s.created_at);
        statuses
    }

    /// Forgets finished runs older than the retention window. Returns how many were dropped.
    pub async fn sweep_expired(&self, now: chrono::DateTime<chrono::Utc>) -> usize {
        let retention = chrono::Duration::seconds(self.config.supervisor.retention_secs as i64);
        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|_, entry| match entry.status().finished_at {
            Some(finished) => now - finished < retention,
            None => true,
        });
        let dropped = before - runs.len();
        if dropped > 0 {
            tracing::debug!(dropped, remaining = runs.len(), "expired runs swept");
        }
        dropped
    }

    /// Periodically sweeps expired runs until the manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.sweep_expired(chrono::Utc::now()).await;
            }
        })
    }
}
