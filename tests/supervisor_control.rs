//! Supervisor commands and event subscriptions against live runs.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use mirrorclaw::agent_engine::{
    Collaborators, CommandOutcome, Event, EventKind, RunEntry, RunManager, RunState, RunStatus,
};
use mirrorclaw::config::AppConfig;
use mirrorclaw::errors::{CaptureError, ModelError, SupervisorError};
use mirrorclaw::llm::{ChatMessage, ModelClient};
use mirrorclaw::protocol::Action;
use mirrorclaw::supervisor::{router, Supervisor};
use mirrorclaw::test_support::{
    collaborators, reply, test_config, FakePerception, RecordingExecutor, ScriptedModel,
};

struct Setup {
    _dir: tempfile::TempDir,
    manager: Arc<RunManager>,
    supervisor: Supervisor,
}

fn setup(tweak: impl FnOnce(&mut AppConfig)) -> Setup {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = test_config(dir.path());
    tweak(&mut cfg);
    let manager = Arc::new(RunManager::new(Arc::new(cfg)));
    Setup {
        _dir: dir,
        supervisor: Supervisor::new(manager.clone()),
        manager,
    }
}

impl Setup {
    async fn start(&self, model: ScriptedModel) -> (Arc<RunEntry>, Arc<ScriptedModel>) {
        self.start_with(model, FakePerception::new()).await
    }

    async fn start_with(
        &self,
        model: ScriptedModel,
        perception: FakePerception,
    ) -> (Arc<RunEntry>, Arc<ScriptedModel>) {
        let model = Arc::new(model);
        let entry = self
            .manager
            .start_run(
                "open settings",
                collaborators(
                    Arc::new(perception),
                    model.clone(),
                    Arc::new(RecordingExecutor::new()),
                ),
            )
            .await
            .expect("run started");
        (entry, model)
    }
}

/// Waits on the worker's published status.
async fn wait_state(entry: &RunEntry, state: RunState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while entry.status().state != state {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("state reached in time");
}

async fn wait_turns(entry: &RunEntry, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while entry.turns.len() < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("turns recorded in time");
}

async fn wait_event(entry: &RunEntry, kind: EventKind) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(e) = entry.events.retained_since(0).into_iter().find(|e| e.kind == kind) {
                return e;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("event published in time")
}

async fn wait_model_calls(model: &ScriptedModel, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while model.calls() < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("model called in time");
}

async fn finished(entry: &RunEntry) -> RunStatus {
    tokio::time::timeout(Duration::from_secs(10), entry.wait_finished())
        .await
        .expect("run finished in time")
}

fn waiting_model() -> ScriptedModel {
    ScriptedModel::replies(Vec::<String>::new())
        .with_fallback(reply("waiting", "wait()"))
        .with_delay(Duration::from_millis(5))
}

fn script() -> Vec<String> {
    vec![
        reply("tap Settings", "click(x=0.5,y=0.3)"),
        reply("search", "type(content='wifi')"),
        reply("open it", "click(x=0.2,y=0.6)"),
        reply("done", "finished()"),
    ]
}

#[tokio::test]
async fn pause_then_resume_yields_the_uninterrupted_sequence() {
    let s = setup(|_| {});

    let (plain, _) = s.start(ScriptedModel::replies(script())).await;
    finished(&plain).await;
    let expected: Vec<Action> = plain.turns.replay().into_iter().map(|t| t.action).collect();

    let (paused, _) = s.start(ScriptedModel::replies(script())).await;
    let receipt = s.supervisor.pause(&paused.run_id).await.unwrap();
    assert_eq!(receipt.outcome, CommandOutcome::Accepted);
    assert_eq!(receipt.state, RunState::Paused);
    wait_state(&paused, RunState::Paused).await;

    let held = paused.turns.len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(paused.turns.len(), held, "no turn starts while paused");

    let receipt = s.supervisor.resume(&paused.run_id).await.unwrap();
    assert_eq!(receipt.state, RunState::Running);
    let status = finished(&paused).await;
    assert_eq!(status.state, RunState::Stopped);

    let actual: Vec<Action> = paused.turns.replay().into_iter().map(|t| t.action).collect();
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn duplicate_and_invalid_commands_are_no_ops() {
    let s = setup(|_| {});
    let (entry, _) = s.start(waiting_model()).await;

    assert_eq!(s.supervisor.pause(&entry.run_id).await.unwrap().outcome, CommandOutcome::Accepted);
    let again = s.supervisor.pause(&entry.run_id).await.unwrap();
    assert_eq!(again.outcome, CommandOutcome::NoOp);
    assert_eq!(again.state, RunState::Paused);

    assert_eq!(s.supervisor.resume(&entry.run_id).await.unwrap().outcome, CommandOutcome::Accepted);
    let resumed_twice = s.supervisor.resume(&entry.run_id).await.unwrap();
    assert_eq!(resumed_twice.outcome, CommandOutcome::NoOp);
    assert_eq!(resumed_twice.state, RunState::Running);

    s.supervisor.stop(&entry.run_id).await.unwrap();
    let status = finished(&entry).await;
    assert_eq!(status.state, RunState::Stopped);
    assert_eq!(status.termination_reason.as_deref(), Some("stopped_by_supervisor"));

    let late = s.supervisor.resume(&entry.run_id).await.unwrap();
    assert_eq!(late.outcome, CommandOutcome::NoOp);
    assert_eq!(late.state, RunState::Stopped);
    let late_stop = s.supervisor.stop(&entry.run_id).await.unwrap();
    assert_eq!(late_stop.outcome, CommandOutcome::NoOp);
}

#[tokio::test]
async fn stop_while_paused_ends_the_run() {
    let s = setup(|_| {});
    let (entry, _) = s.start(waiting_model()).await;
    s.supervisor.pause(&entry.run_id).await.unwrap();
    wait_state(&entry, RunState::Paused).await;

    s.supervisor.stop(&entry.run_id).await.unwrap();
    assert_eq!(finished(&entry).await.state, RunState::Stopped);
}

#[tokio::test]
async fn stop_cuts_a_retry_backoff_short() {
    let s = setup(|cfg| {
        cfg.agent.retry.max_attempts = 10;
        cfg.agent.retry.initial_backoff_ms = 30_000;
        cfg.agent.retry.max_backoff_ms = 30_000;
    });
    let perception = FakePerception::new()
        .failing_first((0..10).map(|_| CaptureError::Unavailable("no window".into())).collect());
    let (entry, _) = s.start_with(waiting_model(), perception).await;

    // The first failure schedules a 30 s backoff.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !entry
            .events
            .retained_since(0)
            .iter()
            .any(|e| e.kind == EventKind::RetryScheduled)
        {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("retry scheduled");

    s.supervisor.stop(&entry.run_id).await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(2), entry.wait_finished())
        .await
        .expect("stop honoured during backoff");
    assert_eq!(status.state, RunState::Stopped);
    assert_eq!(status.turns, 0);
}

#[tokio::test]
async fn injected_guidance_reaches_exactly_one_prompt() {
    let s = setup(|_| {});
    let (entry, model) = s.start(waiting_model()).await;

    s.supervisor.pause(&entry.run_id).await.unwrap();
    wait_state(&entry, RunState::Paused).await;
    let receipt = s.supervisor.inject(&entry.run_id, "tap the Wi-Fi row").await.unwrap();
    assert_eq!(receipt.outcome, CommandOutcome::Accepted);
    assert_eq!(receipt.state, RunState::Paused);
    s.supervisor.resume(&entry.run_id).await.unwrap();

    let before = entry.turns.len();
    wait_turns(&entry, before + 3).await;
    s.supervisor.stop(&entry.run_id).await.unwrap();
    finished(&entry).await;

    let framed = "[Supervisor Guidance]\ntap the Wi-Fi row";
    let carrying = model
        .prompts()
        .iter()
        .filter(|p| p.iter().any(|m| m.text() == framed))
        .count();
    assert_eq!(carrying, 1);

    let turns = entry.turns.replay();
    let with_guidance: Vec<_> = turns.iter().filter(|t| !t.injected.is_empty()).collect();
    assert_eq!(with_guidance.len(), 1);
    assert_eq!(with_guidance[0].injected, vec!["tap the Wi-Fi row".to_string()]);

    let applied: Vec<Event> = entry
        .events
        .retained_since(0)
        .into_iter()
        .filter(|e| e.kind == EventKind::InjectionApplied)
        .collect();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].payload["turn"], with_guidance[0].index);
}

#[tokio::test]
async fn guidance_sent_mid_turn_reaches_the_next_prompt() {
    let s = setup(|_| {});
    let slow = ScriptedModel::replies(Vec::<String>::new())
        .with_fallback(reply("waiting", "wait()"))
        .with_delay(Duration::from_millis(200));
    let (entry, model) = s.start(slow).await;

    wait_model_calls(&model, 1).await;
    s.supervisor.inject(&entry.run_id, "tap the Wi-Fi row").await.unwrap();
    wait_turns(&entry, 2).await;
    s.supervisor.stop(&entry.run_id).await.unwrap();
    finished(&entry).await;

    let framed = "[Supervisor Guidance]\ntap the Wi-Fi row";
    let prompts = model.prompts();
    let carries = |i: usize| prompts[i].iter().any(|m| m.text() == framed);
    assert!(!carries(0), "the in-flight turn keeps its prompt");
    assert!(carries(1));

    let turns = entry.turns.replay();
    assert!(turns[0].injected.is_empty());
    assert_eq!(turns[1].injected, vec!["tap the Wi-Fi row".to_string()]);
}

#[tokio::test]
async fn stop_during_retry_keeps_drawn_guidance_pending() {
    let s = setup(|cfg| {
        cfg.agent.retry.max_attempts = 10;
        cfg.agent.retry.initial_backoff_ms = 30_000;
        cfg.agent.retry.max_backoff_ms = 30_000;
    });
    let flaky = ScriptedModel::new(vec![
        Ok(reply("waiting", "wait()")),
        Err(ModelError::Unavailable("503".into())),
    ])
    .with_delay(Duration::from_millis(100));
    let (entry, model) = s.start(flaky).await;

    wait_model_calls(&model, 1).await;
    s.supervisor.inject(&entry.run_id, "tap the Wi-Fi row").await.unwrap();
    wait_event(&entry, EventKind::RetryScheduled).await;
    s.supervisor.stop(&entry.run_id).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(2), entry.wait_finished())
        .await
        .expect("stop honoured during backoff");
    assert_eq!(status.state, RunState::Stopped);
    assert_eq!(status.turns, 1);
    assert_eq!(status.pending_injections, 1);

    // Drawn into the discarded turn's prompt, but never applied.
    let framed = "[Supervisor Guidance]\ntap the Wi-Fi row";
    assert!(model.prompts()[1].iter().any(|m| m.text() == framed));
    assert!(entry.turns.replay().iter().all(|t| t.injected.is_empty()));
    assert!(!entry
        .events
        .retained_since(0)
        .iter()
        .any(|e| e.kind == EventKind::InjectionApplied));
}

#[tokio::test]
async fn call_user_parks_the_run_until_resumed() {
    let s = setup(|_| {});
    let (entry, model) = s
        .start(ScriptedModel::replies([
            reply("A passcode is required.", "call_user(content='enter the passcode')"),
            reply("Unlocked.", "finished()"),
        ]))
        .await;

    let hang = wait_event(&entry, EventKind::Hang).await;
    assert_eq!(hang.payload["reason"], "call_user");
    assert_eq!(hang.payload["turn"], 0);
    let status = entry.status();
    assert_eq!(status.state, RunState::Paused);
    assert_eq!(status.turns, 1);
    assert_eq!(status.termination_reason, None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(model.calls(), 1, "no turn starts while hanging");

    let receipt = s.supervisor.resume(&entry.run_id).await.unwrap();
    assert_eq!(receipt.outcome, CommandOutcome::Accepted);
    let status = finished(&entry).await;
    assert_eq!(status.state, RunState::Stopped);
    assert_eq!(status.termination_reason.as_deref(), Some("finished"));
    assert_eq!(status.turns, 2);
}

#[tokio::test]
async fn hang_on_finished_waits_for_a_stop() {
    let s = setup(|cfg| cfg.agent.hang_on_finished = true);
    let (entry, _) = s
        .start(ScriptedModel::replies([reply("done", "finished(content='opened settings')")]))
        .await;

    let hang = wait_event(&entry, EventKind::Hang).await;
    assert_eq!(hang.payload["reason"], "finished");
    assert_eq!(entry.status().state, RunState::Paused);

    s.supervisor.stop(&entry.run_id).await.unwrap();
    let status = finished(&entry).await;
    assert_eq!(status.state, RunState::Stopped);
    assert_eq!(status.termination_reason.as_deref(), Some("stopped_by_supervisor"));
    assert_eq!(status.turns, 1);
}

struct PanickingModel;

#[async_trait::async_trait]
impl ModelClient for PanickingModel {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, ModelError> {
        panic!("model client bug")
    }
}

#[tokio::test]
async fn panicking_worker_ends_the_run_as_errored() {
    let s = setup(|_| {});
    let entry = s
        .manager
        .start_run(
            "open settings",
            Collaborators {
                perception: Arc::new(FakePerception::new()),
                model: Arc::new(PanickingModel),
                executor: Arc::new(RecordingExecutor::new()),
            },
        )
        .await
        .expect("run started");

    let status = finished(&entry).await;
    assert_eq!(status.state, RunState::Errored);
    assert_eq!(status.termination_reason.as_deref(), Some("worker_panicked"));
    assert!(status.finished_at.is_some());

    let last = entry.events.retained_since(0).pop().expect("terminal event");
    assert!(last.is_terminal());
    assert_eq!(last.payload["reason"], "worker_panicked");
    let receipt = s.supervisor.pause(&entry.run_id).await.unwrap();
    assert_eq!(receipt.outcome, CommandOutcome::NoOp);
}

#[tokio::test]
async fn sse_reconnect_after_the_terminal_event_closes() {
    let s = setup(|_| {});
    let (entry, _) = s.start(ScriptedModel::replies([reply("done", "finished()")])).await;
    finished(&entry).await;
    let last = entry.events.next_seq() - 1;

    let resp = router(s.supervisor.clone(), None)
        .oneshot(
            Request::get(format!("/api/runs/{}/events", entry.run_id))
                .header("last-event-id", last.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = tokio::time::timeout(
        Duration::from_secs(2),
        axum::body::to_bytes(resp.into_body(), usize::MAX),
    )
    .await
    .expect("stream closes")
    .unwrap();
    assert!(!String::from_utf8_lossy(&body).contains("id: "));
}

#[tokio::test]
async fn blank_injection_is_rejected() {
    let s = setup(|_| {});
    let (entry, _) = s.start(waiting_model()).await;
    let err = s.supervisor.inject(&entry.run_id, "   ").await.unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidCommand(_)));
    s.supervisor.stop(&entry.run_id).await.unwrap();
    finished(&entry).await;
}

#[tokio::test]
async fn unknown_run_is_reported_for_every_operation() {
    let s = setup(|_| {});
    let unknown = |r: Result<_, SupervisorError>| matches!(r, Err(SupervisorError::UnknownRun(id)) if id == "ghost");
    assert!(unknown(s.supervisor.pause("ghost").await.map(|_| ())));
    assert!(unknown(s.supervisor.resume("ghost").await.map(|_| ())));
    assert!(unknown(s.supervisor.stop("ghost").await.map(|_| ())));
    assert!(unknown(s.supervisor.inject("ghost", "hi").await.map(|_| ())));
    assert!(unknown(s.supervisor.get_recent_turns("ghost", 5).await.map(|_| ())));
    assert!(unknown(s.supervisor.subscribe_events("ghost", 0).await.map(|_| ())));
    assert!(unknown(s.supervisor.status("ghost").await.map(|_| ())));
}

#[tokio::test]
async fn recent_turns_are_the_ordered_tail() {
    let s = setup(|_| {});
    let (entry, _) = s.start(ScriptedModel::replies(script())).await;
    finished(&entry).await;

    let tail = s.supervisor.get_recent_turns(&entry.run_id, 2).await.unwrap();
    let indices: Vec<u32> = tail.iter().map(|t| t.index).collect();
    assert_eq!(indices, vec![2, 3]);
    let all = s.supervisor.get_recent_turns(&entry.run_id, 100).await.unwrap();
    assert_eq!(all.len(), 4);
}

async fn drain(mut sub: mirrorclaw::agent_engine::EventSubscription) -> Vec<Event> {
    let mut out = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("event or end of stream")
    {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn subscription_replays_then_follows_live_events_exactly_once() {
    let s = setup(|_| {});
    let (entry, _) = s.start(ScriptedModel::replies(script()).with_delay(Duration::from_millis(5))).await;

    let live = s.supervisor.subscribe_events(&entry.run_id, 0).await.unwrap();
    wait_turns(&entry, 1).await;
    let late = s.supervisor.subscribe_events(&entry.run_id, 0).await.unwrap();

    let (live, late) = tokio::join!(drain(live), drain(late));
    let seqs = |events: &[Event]| events.iter().map(|e| e.seq).collect::<Vec<_>>();
    let expected: Vec<u64> = (0..live.len() as u64).collect();
    assert_eq!(seqs(&live), expected);
    assert_eq!(seqs(&late), expected);
    assert!(live.last().map(Event::is_terminal).unwrap_or(false));

    let resumed = drain(s.supervisor.subscribe_events(&entry.run_id, 3).await.unwrap()).await;
    assert_eq!(resumed.first().map(|e| e.seq), Some(3));
    assert_eq!(resumed.len(), live.len() - 3);
}

#[tokio::test]
async fn expired_runs_are_swept() {
    let s = setup(|cfg| cfg.supervisor.retention_secs = 60);
    let (entry, _) = s.start(ScriptedModel::replies([reply("done", "finished()")])).await;
    finished(&entry).await;

    assert_eq!(s.manager.sweep_expired(chrono::Utc::now()).await, 0);
    let later = chrono::Utc::now() + chrono::Duration::seconds(120);
    assert_eq!(s.manager.sweep_expired(later).await, 1);
    assert!(matches!(
        s.supervisor.status(&entry.run_id).await,
        Err(SupervisorError::UnknownRun(_))
    ));
    assert!(s.supervisor.list_runs().await.is_empty());
}

#[tokio::test]
async fn sse_endpoint_streams_events_with_seq_ids() {
    let s = setup(|_| {});
    let (entry, _) = s.start(ScriptedModel::replies([reply("done", "finished()")])).await;
    finished(&entry).await;
    let app = router(s.supervisor.clone(), None);

    let resp = app
        .clone()
        .oneshot(
            Request::get(format!("/api/runs/{}/events", entry.run_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("id: 0"));
    assert!(text.contains("event: state_changed"));
    assert!(text.contains("event: turn_completed"));

    let resp = app
        .oneshot(
            Request::get(format!("/api/runs/{}/events", entry.run_id))
                .header("last-event-id", "0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8_lossy(&body);
    assert!(!text.contains("id: 0\n"));
    assert!(text.contains("id: 1\n"));
}
