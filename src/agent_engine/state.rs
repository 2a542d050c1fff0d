use serde::{Deserialize, Serialize};

use crate::protocol::Action;

/// Lifecycle states of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
    Errored,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Stopped | RunState::Errored)
    }

    /// Legal edges of the run state machine. Everything is monotone except Paused ⇄ Running.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::{Errored, Idle, Paused, Running, Stopped, Stopping};
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopping)
                | (Paused, Stopping)
                | (Stopping, Stopped)
                | (Running, Errored)
                | (Stopping, Errored)
                | (Paused, Errored)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Stopping => "stopping",
            RunState::Stopped => "stopped",
            RunState::Errored => "errored",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Pause,
    Resume,
    Stop,
    Inject,
}

impl ControlKind {
    /// State the run holds after this command is applied in `from`, or `None` when the
    /// command is meaningless there. `Idle` behaves like `Running` because the worker
    /// leaves `Idle` before its first checkpoint.
    pub fn apply_to(self, from: RunState) -> Option<RunState> {
        use RunState::{Idle, Paused, Running};
        match (self, from) {
            (ControlKind::Pause, Idle | Running) => Some(Paused),
            (ControlKind::Resume, Paused) => Some(Running),
            (ControlKind::Stop, Idle | Running | Paused) => Some(RunState::Stopping),
            (ControlKind::Inject, Idle | Running | Paused) => Some(from),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlKind::Pause => "pause",
            ControlKind::Resume => "resume",
            ControlKind::Stop => "stop",
            ControlKind::Inject => "inject",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub run_id: String,
    pub kind: ControlKind,
    /// Supplementary instruction text for `inject`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Accepted,
    NoOp,
}

/// Answer to a control command: whether it was queued and the state the run will hold
/// once its queued commands are applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReceipt {
    pub run_id: String,
    pub command: ControlKind,
    pub outcome: CommandOutcome,
    pub state: RunState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub detail: String,
}

impl ExecutionResult {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
        }
    }
}

/// One capture → inference → parse → execute → record cycle. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub index: u32,
    pub snapshot_ref: String,
    pub raw_output: String,
    pub thought: String,
    pub action: Action,
    pub execution: ExecutionResult,
    /// Supervisor instructions merged into this turn's prompt.
    #[serde(default)]
    pub injected: Vec<String>,
    /// Model calls needed to get a well-formed reply (1 when the first reply parsed,
    /// 0 for a cached replay).
    pub parse_attempts: u32,
    /// Replayed from the action cache without consulting the model.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cached: bool,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

/// Read-only view of a run published by its worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub instruction: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub state: RunState,
    pub turns: u32,
    pub step_budget: u32,
    pub termination_reason: Option<String>,
    pub pending_injections: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}
