use std::time::{Duration, Instant};

use crate::config::{AgentConfig, RetryConfig};

/// Why a run stopped taking turns on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetExhausted {
    Steps,
    Time,
}

impl BudgetExhausted {
    pub fn reason(self) -> &'static str {
        match self {
            BudgetExhausted::Steps => "step_budget_exhausted",
            BudgetExhausted::Time => "time_budget_exhausted",
        }
    }
}

/// Step and wall-clock budgets of one run.
pub struct LoopController {
    max_steps: u32,
    max_duration: Option<Duration>,
    start_time: Instant,
}

impl LoopController {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            max_duration: config
                .max_duration_minutes
                .map(|m| Duration::from_secs(u64::from(m) * 60)),
            start_time: Instant::now(),
        }
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    /// Checked before every turn, so a spent budget never starts another one.
    pub fn exhausted(&self, turns_recorded: u32) -> Option<BudgetExhausted> {
        if turns_recorded >= self.max_steps {
            return Some(BudgetExhausted::Steps);
        }
        match self.max_duration {
            Some(limit) if self.start_time.elapsed() >= limit => Some(BudgetExhausted::Time),
            _ => None,
        }
    }
}

/// Bounded exponential backoff for retryable collaborator failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    initial: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1 << shift).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_budget_counts_recorded_turns() {
        let cfg = AgentConfig {
            max_steps: 2,
            ..AgentConfig::default()
        };
        let ctl = LoopController::new(&cfg);
        assert_eq!(ctl.exhausted(1), None);
        assert_eq!(ctl.exhausted(2), Some(BudgetExhausted::Steps));
    }

    #[test]
    fn zero_minute_budget_is_immediately_exhausted() {
        let cfg = AgentConfig {
            max_duration_minutes: Some(0),
            ..AgentConfig::default()
        };
        let ctl = LoopController::new(&cfg);
        assert_eq!(ctl.exhausted(0), Some(BudgetExhausted::Time));
        assert_eq!(BudgetExhausted::Time.reason(), "time_budget_exhausted");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(&RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 800,
            max_backoff_ms: 2000,
        });
        assert_eq!(policy.delay_for(1), Duration::from_millis(800));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1600));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(2000));
    }
}
