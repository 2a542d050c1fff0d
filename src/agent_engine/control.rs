//! Command queue between the supervisor and a run's worker.
//!
//! Commands are only drained at the worker's checkpoint. The queue also tracks the
//! *projected* state (the worker's state with every queued command applied) so a
//! caller can be told synchronously whether its command changes anything.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::agent_engine::state::{
    CommandOutcome, CommandReceipt, ControlCommand, ControlKind, RunState,
};

struct Inner {
    pending: VecDeque<ControlCommand>,
    projected: RunState,
}

pub struct ControlQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl ControlQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                projected: RunState::Idle,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Critical sections never panic; recover the data if one somehow did.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues `cmd` if it is meaningful in the projected state.
    pub fn submit(&self, cmd: ControlCommand) -> CommandReceipt {
        let mut inner = self.lock();
        let run_id = cmd.run_id.clone();
        let kind = cmd.kind;
        match kind.apply_to(inner.projected) {
            Some(next) => {
                inner.projected = next;
                inner.pending.push_back(cmd);
                drop(inner);
                self.notify.notify_one();
                tracing::debug!(run_id = %run_id, command = kind.as_str(), state = %next, "control command queued");
                CommandReceipt {
                    run_id,
                    command: kind,
                    outcome: CommandOutcome::Accepted,
                    state: next,
                }
            }
            None => {
                let state = inner.projected;
                tracing::debug!(run_id = %run_id, command = kind.as_str(), state = %state, "control command is a no-op");
                CommandReceipt {
                    run_id,
                    command: kind,
                    outcome: CommandOutcome::NoOp,
                    state,
                }
            }
        }
    }

    /// Takes every queued command. Worker side only.
    pub fn drain(&self) -> Vec<ControlCommand> {
        self.lock().pending.drain(..).collect()
    }

    /// Waits until at least one command is queued.
    pub async fn wait_for_command(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.lock().pending.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Waits until a `stop` is queued. Other commands leave it waiting.
    pub async fn wait_for_stop(&self) {
        loop {
            let notified = self.notify.notified();
            if self.stop_pending() {
                return;
            }
            notified.await;
        }
    }

    /// True when a `stop` is waiting for the next checkpoint.
    pub fn stop_pending(&self) -> bool {
        self.lock()
            .pending
            .iter()
            .any(|c| c.kind == ControlKind::Stop)
    }

    /// Re-bases the projection on a state the worker entered on its own
    /// (budget exhaustion, terminal action, error).
    pub fn sync_state(&self, state: RunState) {
        let mut inner = self.lock();
        let mut projected = state;
        for cmd in &inner.pending {
            if let Some(next) = cmd.kind.apply_to(projected) {
                projected = next;
            }
        }
        inner.projected = projected;
    }

    pub fn projected(&self) -> RunState {
        self.lock().projected
    }
}

impl Default for ControlQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn cmd(kind: ControlKind) -> ControlCommand {
        ControlCommand {
            run_id: "r".into(),
            kind,
            payload: None,
        }
    }

    #[test]
    fn pause_then_resume_before_checkpoint_cancels_out() {
        let q = ControlQueue::new();
        q.sync_state(RunState::Running);
        let r1 = q.submit(cmd(ControlKind::Pause));
        assert_eq!(r1.outcome, CommandOutcome::Accepted);
        assert_eq!(r1.state, RunState::Paused);
        let r2 = q.submit(cmd(ControlKind::Resume));
        assert_eq!(r2.outcome, CommandOutcome::Accepted);
        assert_eq!(r2.state, RunState::Running);
        assert_eq!(q.drain().len(), 2);
    }

    #[test]
    fn duplicate_pause_is_reported_as_no_op() {
        let q = ControlQueue::new();
        q.sync_state(RunState::Running);
        q.submit(cmd(ControlKind::Pause));
        let again = q.submit(cmd(ControlKind::Pause));
        assert_eq!(again.outcome, CommandOutcome::NoOp);
        assert_eq!(again.state, RunState::Paused);
        assert_eq!(q.drain().len(), 1);
    }

    #[test]
    fn resume_on_stopped_run_is_no_op() {
        let q = ControlQueue::new();
        q.sync_state(RunState::Stopped);
        let receipt = q.submit(cmd(ControlKind::Resume));
        assert_eq!(receipt.outcome, CommandOutcome::NoOp);
        assert_eq!(receipt.state, RunState::Stopped);
        assert!(q.drain().is_empty());
    }

    #[test]
    fn stop_is_visible_before_drain() {
        let q = ControlQueue::new();
        q.sync_state(RunState::Running);
        assert!(!q.stop_pending());
        q.submit(cmd(ControlKind::Stop));
        assert!(q.stop_pending());
        q.drain();
        assert!(!q.stop_pending());
    }

    #[test]
    fn sync_state_replays_pending_commands() {
        let q = ControlQueue::new();
        q.sync_state(RunState::Running);
        q.submit(cmd(ControlKind::Pause));
        q.sync_state(RunState::Stopping);
        assert_eq!(q.projected(), RunState::Stopping);
    }

    #[tokio::test]
    async fn waiter_wakes_on_submit() {
        let q = Arc::new(ControlQueue::new());
        q.sync_state(RunState::Paused);
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.wait_for_command().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.submit(cmd(ControlKind::Resume));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn stop_waiter_ignores_other_commands() {
        let q = Arc::new(ControlQueue::new());
        q.sync_state(RunState::Running);
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.wait_for_stop().await })
        };
        q.submit(cmd(ControlKind::Pause));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        q.submit(cmd(ControlKind::Stop));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stop observed")
            .unwrap();
    }
}
