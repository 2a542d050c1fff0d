use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ExecutionError;
use crate::protocol::Action;

/// An action whose coordinates have been mapped onto the screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedAction {
    pub action: Action,
    /// Screen point the gesture starts at.
    pub point: Option<(f64, f64)>,
    /// Screen point a drag or swipe ends at.
    pub end_point: Option<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub detail: String,
}

impl ExecutionReport {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
        }
    }
}

/// Synthesizes input on the mirrored surface.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &CalibratedAction) -> Result<ExecutionReport, ExecutionError>;
}
