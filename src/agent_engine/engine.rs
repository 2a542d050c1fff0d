use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::agent_engine::action_cache::ActionCache;
use crate::agent_engine::control::ControlQueue;
use crate::agent_engine::conversation::{push_correction, PromptBuilder};
use crate::agent_engine::event_bus::{EventBus, EventKind};
use crate::agent_engine::loop_control::{LoopController, RetryPolicy};
use crate::agent_engine::recorder::RunRecorder;
use crate::agent_engine::state::{ControlCommand, ControlKind, ExecutionResult, RunState, RunStatus, Turn};
use crate::config::AppConfig;
use crate::errors::{CaptureError, ModelError};
use crate::executor::{calibrate, ActionExecutor};
use crate::llm::types::ChatMessage;
use crate::llm::ModelClient;
use crate::perception::fingerprint::dhash;
use crate::perception::image_prep::model_image_url;
use crate::perception::{Capture, PerceptionAdapter, SurfaceSelector};
use crate::protocol::{parse_response, ActionKind, ParsedResponse};

/// The three external contracts a run drives.
#[derive(Clone)]
pub struct Collaborators {
    pub perception: Arc<dyn PerceptionAdapter>,
    pub model: Arc<dyn ModelClient>,
    pub executor: Arc<dyn ActionExecutor>,
}

/// Shared pieces a worker publishes through.
pub struct RunChannels {
    pub control: Arc<ControlQueue>,
    pub events: Arc<EventBus>,
    pub status: Arc<watch::Sender<RunStatus>>,
}

/// Why a turn did not produce a recorded Turn.
enum Interrupt {
    /// A `stop` is pending; the checkpoint will end the run.
    Stopped,
    /// The run cannot continue; carries the termination reason.
    Errored(&'static str),
}

enum TurnOutcome {
    Recorded(ActionKind),
    Discarded,
    Errored(&'static str),
}

/// A cached action replayed on screen `screen`, settled by the next capture.
struct PendingReplay {
    entry: u64,
    screen: u64,
}

/// Owns one run and drives it through capture → infer → parse → execute → record.
pub struct RunWorker {
    run_id: String,
    instruction: String,
    config: Arc<AppConfig>,
    collab: Collaborators,
    control: Arc<ControlQueue>,
    events: Arc<EventBus>,
    status_tx: Arc<watch::Sender<RunStatus>>,
    recorder: RunRecorder,
    history: Vec<Turn>,
    pending_injections: VecDeque<String>,
    state: RunState,
    termination_reason: Option<String>,
    loop_ctl: LoopController,
    retry: RetryPolicy,
    prompt: PromptBuilder,
    selector: SurfaceSelector,
    cache: Option<ActionCache>,
    pending_replay: Option<PendingReplay>,
}

impl RunWorker {
    pub fn new(
        instruction: String,
        config: Arc<AppConfig>,
        collab: Collaborators,
        recorder: RunRecorder,
        channels: RunChannels,
    ) -> Self {
        let run_id = channels.events.run_id().to_string();
        Self {
            loop_ctl: LoopController::new(&config.agent),
            retry: RetryPolicy::new(&config.agent.retry),
            prompt: PromptBuilder::new(&config.agent.language, config.agent.history_tail_rounds),
            selector: SurfaceSelector::from_config(&config.perception),
            cache: config
                .agent
                .cache
                .enabled
                .then(|| ActionCache::new(&config.agent.cache)),
            pending_replay: None,
            run_id,
            instruction,
            config,
            collab,
            control: channels.control,
            events: channels.events,
            status_tx: channels.status,
            recorder,
            history: Vec::new(),
            pending_injections: VecDeque::new(),
            state: RunState::Idle,
            termination_reason: None,
        }
    }

    /// Runs until `Stopped` or `Errored` and returns the final status.
    pub async fn run(mut self) -> RunStatus {
        tracing::info!(run_id = %self.run_id, instruction = %self.instruction, "run started");
        self.enter(RunState::Running, None);

        loop {
            self.checkpoint();

            match self.state {
                RunState::Paused => {
                    tracing::debug!(run_id = %self.run_id, "paused, waiting for a command");
                    self.control.wait_for_command().await;
                    continue;
                }
                RunState::Stopping => {
                    self.enter(RunState::Stopped, None);
                    break;
                }
                RunState::Stopped | RunState::Errored => break,
                RunState::Idle | RunState::Running => {}
            }

            let turns = self.history.len() as u32;
            if let Some(budget) = self.loop_ctl.exhausted(turns) {
                tracing::info!(run_id = %self.run_id, turns, reason = budget.reason(), "budget exhausted");
                self.enter(RunState::Stopping, Some(budget.reason()));
                continue;
            }

            match self.run_turn().await {
                TurnOutcome::Recorded(kind) if kind.is_terminal() => {
                    if self.hangs_on(kind) {
                        self.hang(kind);
                    } else {
                        self.enter(RunState::Stopping, Some(kind.name()));
                    }
                }
                TurnOutcome::Recorded(_) => {
                    if self.loop_ctl.exhausted(self.history.len() as u32).is_none() {
                        self.settle().await;
                    }
                }
                TurnOutcome::Discarded => {
                    tracing::info!(run_id = %self.run_id, "turn discarded, stop pending");
                }
                TurnOutcome::Errored(reason) => {
                    self.enter(RunState::Errored, Some(reason));
                    break;
                }
            }
        }

        tracing::info!(
            run_id = %self.run_id,
            state = %self.state,
            reason = ?self.termination_reason,
            turns = self.history.len(),
            "run finished"
        );
        self.status_tx.borrow().clone()
    }

    /// Applies every queued command. The only place supervisor commands take effect.
    fn checkpoint(&mut self) {
        let commands = self.control.drain();
        if commands.is_empty() {
            return;
        }
        for cmd in commands {
            self.apply(cmd);
        }
        self.control.sync_state(self.state);
        self.publish_status();
    }

    fn apply(&mut self, cmd: ControlCommand) {
        let Some(next) = cmd.kind.apply_to(self.state) else {
            tracing::debug!(run_id = %self.run_id, command = cmd.kind.as_str(), state = %self.state, "command ignored");
            self.events.publish(
                EventKind::CommandIgnored,
                serde_json::json!({"command": cmd.kind.as_str(), "state": self.state.as_str()}),
            );
            return;
        };
        match cmd.kind {
            ControlKind::Inject => {
                let text = cmd.payload.unwrap_or_default();
                tracing::info!(run_id = %self.run_id, chars = text.len(), "instruction injected");
                self.pending_injections.push_back(text);
            }
            ControlKind::Stop => self.set_state(next, Some("stopped_by_supervisor"), false),
            ControlKind::Pause | ControlKind::Resume => self.set_state(next, None, false),
        }
    }

    /// Transition made by the worker itself; re-bases the command projection.
    fn enter(&mut self, next: RunState, reason: Option<&str>) {
        self.set_state(next, reason, true);
    }

    /// Status and projection are updated before the event goes out, so a subscriber
    /// reacting to `state_changed` never reads an older state.
    fn set_state(&mut self, next: RunState, reason: Option<&str>, resync: bool) {
        if !self.state.can_transition_to(next) {
            tracing::warn!(run_id = %self.run_id, from = %self.state, to = %next, "illegal transition skipped");
            return;
        }
        let from = self.state;
        self.state = next;
        if let Some(reason) = reason {
            self.termination_reason = Some(reason.to_string());
        }
        if resync {
            self.control.sync_state(next);
        }
        self.publish_status();
        tracing::info!(run_id = %self.run_id, from = %from, to = %next, reason = ?reason, "state changed");
        self.events.publish(
            EventKind::StateChanged,
            serde_json::json!({
                "from": from.as_str(),
                "to": next.as_str(),
                "reason": self.termination_reason,
            }),
        );
    }

    fn publish_status(&self) {
        let status = RunStatus {
            run_id: self.run_id.clone(),
            instruction: self.instruction.clone(),
            created_at: self.status_tx.borrow().created_at,
            state: self.state,
            turns: self.history.len() as u32,
            step_budget: self.loop_ctl.max_steps(),
            termination_reason: self.termination_reason.clone(),
            pending_injections: self.pending_injections.len(),
            finished_at: self.state.is_terminal().then(chrono::Utc::now),
        };
        self.status_tx.send_replace(status);
    }

    fn hangs_on(&self, kind: ActionKind) -> bool {
        match kind {
            ActionKind::Finished => self.config.agent.hang_on_finished,
            ActionKind::CallUser => self.config.agent.hang_on_call_user,
            _ => false,
        }
    }

    /// Parks the run in `paused` after a terminal action so a human can take over.
    /// `resume` lets the model continue, `stop` ends the run.
    fn hang(&mut self, kind: ActionKind) {
        tracing::info!(run_id = %self.run_id, action = kind.name(), "waiting for supervision");
        self.enter(RunState::Paused, None);
        self.events.publish(
            EventKind::Hang,
            serde_json::json!({
                "reason": kind.name(),
                "turn": self.history.len().saturating_sub(1),
            }),
        );
    }

    /// Pause between turns so the device UI settles; a queued command cuts it short.
    async fn settle(&self) {
        let interval = Duration::from_millis(self.config.agent.loop_interval_ms);
        if interval.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.control.wait_for_command() => {}
        }
    }

    async fn run_turn(&mut self) -> TurnOutcome {
        let index = self.history.len() as u32;
        let started_at = chrono::Utc::now();

        let capture = match self.capture(index).await {
            Ok(c) => c,
            Err(interrupt) => return self.interrupted(interrupt),
        };
        let snapshot_ref = match self.recorder.save_snapshot(
            index,
            &capture.snapshot.bytes,
            &capture.snapshot.mime,
        ) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(run_id = %self.run_id, turn = index, error = %e, "snapshot write failed");
                return TurnOutcome::Errored("recorder_failed");
            }
        };

        let screen = self.fingerprint(&capture);
        self.settle_replay(index, screen);
        // Pending guidance must reach the model, so it disables replays.
        let replay = match screen {
            Some(fp) if self.pending_injections.is_empty() => {
                self.cache.as_ref().and_then(|c| c.lookup(fp)).cloned()
            }
            _ => None,
        };
        let replayed_from = replay.as_ref().map(|e| e.fingerprint);

        let (parsed, raw_output, parse_attempts, injected) = match replay {
            Some(entry) => {
                tracing::info!(run_id = %self.run_id, turn = index, action = %entry.action, "replaying cached action");
                let raw_action = entry.action.to_string();
                let parsed = ParsedResponse {
                    thought: entry.thought,
                    action: entry.action,
                    raw_action,
                };
                (parsed, entry.raw_output, 0, Vec::new())
            }
            None => {
                let injected: Vec<String> = self.pending_injections.drain(..).collect();
                let image_url = model_image_url(
                    &capture.snapshot,
                    self.config.perception.min_pixels,
                    self.config.perception.max_pixels,
                );
                let messages = self.prompt.build(&self.instruction, &self.history, &injected, image_url);
                match self.infer(index, messages).await {
                    Ok((parsed, raw, attempts)) => (parsed, raw, attempts, injected),
                    Err(interrupt) => {
                        if matches!(interrupt, Interrupt::Stopped) {
                            // Not consumed by any recorded turn.
                            for text in injected.into_iter().rev() {
                                self.pending_injections.push_front(text);
                            }
                        }
                        return self.interrupted(interrupt);
                    }
                }
            }
        };

        let kind = parsed.action.kind;
        let (execution, fatal) = self.execute(index, &parsed, &capture).await;
        self.update_cache(index, screen, replayed_from, &parsed, &raw_output, execution.success);

        let turn = Turn {
            index,
            snapshot_ref,
            raw_output,
            thought: parsed.thought,
            action: parsed.action,
            execution,
            injected,
            parse_attempts,
            cached: replayed_from.is_some(),
            started_at,
            finished_at: chrono::Utc::now(),
        };
        if let Err(e) = self.recorder.append(turn.clone()) {
            tracing::error!(run_id = %self.run_id, turn = index, error = %e, "turn write failed");
            return TurnOutcome::Errored("recorder_failed");
        }
        tracing::info!(
            run_id = %self.run_id,
            turn = index,
            action = %turn.action,
            success = turn.execution.success,
            "turn completed"
        );
        let payload = serde_json::json!({
            "turn": index,
            "thought": turn.thought,
            "action": turn.action,
            "execution": turn.execution,
            "parse_attempts": turn.parse_attempts,
            "cached": turn.cached,
            "snapshot_ref": turn.snapshot_ref,
        });
        let injected_count = turn.injected.len();
        self.history.push(turn);
        self.publish_status();
        if injected_count > 0 {
            self.events.publish(
                EventKind::InjectionApplied,
                serde_json::json!({"turn": index, "count": injected_count}),
            );
        }
        self.events.publish(EventKind::TurnCompleted, payload);

        if fatal {
            TurnOutcome::Errored("surface_unreachable")
        } else {
            TurnOutcome::Recorded(kind)
        }
    }

    /// Screen fingerprint for the action cache; `None` when caching is off.
    fn fingerprint(&self, capture: &Capture) -> Option<u64> {
        self.cache.as_ref()?;
        dhash(&capture.snapshot.bytes, self.config.agent.cache.status_bar_frac)
    }

    /// Counts last turn's replay as a hit when the screen moved on, evicts it otherwise.
    fn settle_replay(&mut self, index: u32, screen: Option<u64>) {
        let (Some(pending), Some(cache), Some(after)) =
            (self.pending_replay.take(), self.cache.as_mut(), screen)
        else {
            return;
        };
        let took_effect = cache.verify(pending.entry, pending.screen, after, index);
        tracing::debug!(run_id = %self.run_id, turn = index, took_effect, stats = ?cache.stats(), "cached replay settled");
    }

    fn update_cache(
        &mut self,
        index: u32,
        screen: Option<u64>,
        replayed_from: Option<u64>,
        parsed: &ParsedResponse,
        raw_output: &str,
        success: bool,
    ) {
        let (Some(cache), Some(screen)) = (self.cache.as_mut(), screen) else {
            return;
        };
        match replayed_from {
            Some(entry) if success => self.pending_replay = Some(PendingReplay { entry, screen }),
            Some(entry) => {
                tracing::debug!(run_id = %self.run_id, turn = index, "cached action failed, disabling entry");
                cache.mark_failed(entry);
            }
            None if success => cache.store(
                screen,
                parsed.action.clone(),
                parsed.thought.clone(),
                raw_output.to_string(),
                index,
            ),
            None => {}
        }
    }

    fn interrupted(&self, interrupt: Interrupt) -> TurnOutcome {
        match interrupt {
            Interrupt::Stopped => TurnOutcome::Discarded,
            Interrupt::Errored(reason) => TurnOutcome::Errored(reason),
        }
    }

    async fn capture(&self, index: u32) -> Result<Capture, Interrupt> {
        let timeout_ms = self.config.agent.timeouts.capture_ms;
        let mut attempt = 1;
        loop {
            let result = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.collab.perception.capture(&self.selector),
            )
            .await
            .unwrap_or(Err(CaptureError::Timeout(timeout_ms)));

            match result {
                Ok(capture) => return Ok(capture),
                Err(e) => {
                    tracing::warn!(run_id = %self.run_id, turn = index, attempt, error = %e, "capture failed");
                    self.schedule_retry(index, "capture", attempt, &e.to_string(), "capture_failed")
                        .await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Calls the model until it yields a well-formed reply.
    /// Returns the parsed reply, its raw text and the number of replies consumed.
    async fn infer(
        &self,
        index: u32,
        mut messages: Vec<ChatMessage>,
    ) -> Result<(ParsedResponse, String, u32), Interrupt> {
        let timeout_ms = self.config.agent.timeouts.model_ms;
        let limit = self.config.agent.parse_retry_limit.max(1);
        let mut parse_failures = 0u32;
        let mut attempt = 1;

        loop {
            let result = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.collab.model.complete(&messages),
            )
            .await
            .unwrap_or(Err(ModelError::Timeout(timeout_ms)));

            let (raw, error, notice) = match result {
                Ok(raw) => match parse_response(&raw) {
                    Ok(parsed) => return Ok((parsed, raw, parse_failures + 1)),
                    Err(e) => (Some(raw), e.to_string(), e.correction_notice()),
                },
                Err(e @ ModelError::InvalidResponse(_)) => {
                    let notice = format!(
                        "Your previous reply was empty or unreadable ({e}). \
                         Reply with one `Thought:` line and one `Action:` line."
                    );
                    (None, e.to_string(), notice)
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(run_id = %self.run_id, turn = index, attempt, error = %e, "model call failed");
                    self.schedule_retry(index, "model", attempt, &e.to_string(), "model_unavailable")
                        .await?;
                    attempt += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(run_id = %self.run_id, turn = index, error = %e, "model rejected request");
                    return Err(Interrupt::Errored("model_rejected"));
                }
            };

            parse_failures += 1;
            attempt = 1;
            tracing::warn!(run_id = %self.run_id, turn = index, failures = parse_failures, error = %error, "unusable model reply");
            self.events.publish(
                EventKind::ParseFailed,
                serde_json::json!({
                    "turn": index,
                    "attempt": parse_failures,
                    "limit": limit,
                    "error": error,
                    "raw_output": raw,
                }),
            );
            if parse_failures >= limit {
                return Err(Interrupt::Errored("parse_failed"));
            }
            if self.control.stop_pending() {
                return Err(Interrupt::Stopped);
            }
            match raw {
                Some(raw) => push_correction(&mut messages, &raw, &notice),
                None => messages.push(ChatMessage::user(notice)),
            }
        }
    }

    /// Backs off before retry `attempt + 1`, or explains why there will be none.
    async fn schedule_retry(
        &self,
        index: u32,
        stage: &str,
        attempt: u32,
        error: &str,
        exhausted: &'static str,
    ) -> Result<(), Interrupt> {
        if attempt >= self.retry.max_attempts {
            tracing::error!(run_id = %self.run_id, turn = index, stage, attempt, "retries exhausted");
            return Err(Interrupt::Errored(exhausted));
        }
        if self.control.stop_pending() {
            return Err(Interrupt::Stopped);
        }
        let delay = self.retry.delay_for(attempt);
        self.events.publish(
            EventKind::RetryScheduled,
            serde_json::json!({
                "turn": index,
                "stage": stage,
                "attempt": attempt + 1,
                "max_attempts": self.retry.max_attempts,
                "delay_ms": delay.as_millis() as u64,
                "error": error,
            }),
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.control.wait_for_stop() => {}
        }
        if self.control.stop_pending() {
            return Err(Interrupt::Stopped);
        }
        Ok(())
    }

    /// Returns the execution result and whether the surface is gone.
    async fn execute(&self, index: u32, parsed: &ParsedResponse, capture: &Capture) -> (ExecutionResult, bool) {
        let action = &parsed.action;
        if action.kind.is_terminal() {
            let detail = action
                .text("content")
                .or_else(|| action.text("reason"))
                .unwrap_or(action.kind.name());
            return (ExecutionResult::success(detail), false);
        }

        let calibrated = calibrate(action, &capture.transform);
        let timeout_ms = self.config.agent.timeouts.execute_ms;
        let (result, fatal) = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.collab.executor.execute(&calibrated),
        )
        .await
        {
            Ok(Ok(report)) => (
                ExecutionResult {
                    success: report.success,
                    detail: report.detail,
                },
                false,
            ),
            Ok(Err(e)) => (ExecutionResult::failure(e.to_string()), e.is_fatal()),
            Err(_) => (
                ExecutionResult::failure(format!("execution timed out after {timeout_ms} ms")),
                false,
            ),
        };

        if !result.success {
            tracing::warn!(run_id = %self.run_id, turn = index, fatal, detail = %result.detail, "execution failed");
            self.events.publish(
                EventKind::ExecutionFailed,
                serde_json::json!({
                    "turn": index,
                    "action": action,
                    "error": result.detail,
                    "fatal": fatal,
                }),
            );
        }
        (result, fatal)
    }
}
