use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::agent_engine::state::RunState;
use crate::config::OverflowPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateChanged,
    TurnCompleted,
    ParseFailed,
    RetryScheduled,
    ExecutionFailed,
    InjectionApplied,
    CommandIgnored,
    /// The run parked itself in `paused` after a terminal action and waits for a human.
    Hang,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::StateChanged => "state_changed",
            EventKind::TurnCompleted => "turn_completed",
            EventKind::ParseFailed => "parse_failed",
            EventKind::RetryScheduled => "retry_scheduled",
            EventKind::ExecutionFailed => "execution_failed",
            EventKind::InjectionApplied => "injection_applied",
            EventKind::CommandIgnored => "command_ignored",
            EventKind::Hang => "hang",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub run_id: String,
    pub seq: u64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub ts: chrono::DateTime<chrono::Utc>,
}

impl Event {
    /// A `state_changed` event into `stopped` or `errored` is the last event of a run.
    pub fn is_terminal(&self) -> bool {
        self.kind == EventKind::StateChanged
            && self.payload["to"]
                .as_str()
                .is_some_and(|to| to == RunState::Stopped.as_str() || to == RunState::Errored.as_str())
    }
}

struct BusInner {
    next_seq: u64,
    retained: VecDeque<Event>,
}

/// Per-run event log with live fan-out.
///
/// Sequence numbers are assigned under the bus lock, so retained history and live
/// delivery agree on ordering. Live delivery goes through a bounded broadcast ring:
/// publishing never waits on subscribers.
pub struct EventBus {
    run_id: String,
    inner: Mutex<BusInner>,
    tx: broadcast::Sender<Event>,
    replay_capacity: usize,
    overflow: OverflowPolicy,
}

impl EventBus {
    pub fn new(
        run_id: impl Into<String>,
        live_buffer: usize,
        replay_capacity: usize,
        overflow: OverflowPolicy,
    ) -> Self {
        let (tx, _) = broadcast::channel(live_buffer.max(1));
        Self {
            run_id: run_id.into(),
            inner: Mutex::new(BusInner {
                next_seq: 0,
                retained: VecDeque::new(),
            }),
            tx,
            replay_capacity: replay_capacity.max(1),
            overflow,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Assigns the next sequence number, retains the event and fans it out.
    pub fn publish(&self, kind: EventKind, payload: serde_json::Value) -> Event {
        let mut inner = self.lock();
        let event = Event {
            run_id: self.run_id.clone(),
            seq: inner.next_seq,
            kind,
            payload,
            ts: chrono::Utc::now(),
        };
        inner.next_seq += 1;
        if inner.retained.len() == self.replay_capacity {
            inner.retained.pop_front();
        }
        inner.retained.push_back(event.clone());
        // No receivers is not an error for a fire-and-forget bus.
        let _ = self.tx.send(event.clone());
        drop(inner);
        tracing::debug!(run_id = %self.run_id, seq = event.seq, kind = ?event.kind, "event published");
        event
    }

    /// Retained events with `seq >= from_seq`, oldest first.
    pub fn retained_since(&self, from_seq: u64) -> Vec<Event> {
        self.lock()
            .retained
            .iter()
            .filter(|e| e.seq >= from_seq)
            .cloned()
            .collect()
    }

    pub fn next_seq(&self) -> u64 {
        self.lock().next_seq
    }

    /// Replays retained events from `from_seq`, then follows live events.
    pub fn subscribe(self: &std::sync::Arc<Self>, from_seq: u64) -> EventSubscription {
        // Snapshot and registration under one lock: nothing published in between is lost
        // or seen twice.
        let inner = self.lock();
        let replay: VecDeque<Event> = inner
            .retained
            .iter()
            .filter(|e| e.seq >= from_seq)
            .cloned()
            .collect();
        let rx = self.tx.subscribe();
        let next_expected = inner.next_seq.max(from_seq);
        // Past the terminal event there is nothing left to deliver.
        let finished = replay.is_empty() && inner.retained.back().is_some_and(Event::is_terminal);
        drop(inner);
        EventSubscription {
            bus: self.clone(),
            replay,
            rx,
            next_expected,
            from_seq,
            finished,
        }
    }
}

/// Ordered event stream for one subscriber.
pub struct EventSubscription {
    bus: std::sync::Arc<EventBus>,
    replay: VecDeque<Event>,
    rx: broadcast::Receiver<Event>,
    /// Lowest live seq not yet delivered.
    next_expected: u64,
    from_seq: u64,
    finished: bool,
}

impl EventSubscription {
    /// Next event in sequence order; `None` after the run's terminal event, on
    /// disconnect, or when the bus is gone.
    pub async fn next(&mut self) -> Option<Event> {
        if self.finished {
            return None;
        }
        if let Some(event) = self.replay.pop_front() {
            return Some(self.deliver(event));
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.seq < self.next_expected || event.seq < self.from_seq {
                        continue;
                    }
                    self.next_expected = event.seq + 1;
                    return Some(self.deliver(event));
                }
                Err(RecvError::Lagged(skipped)) => match self.bus.overflow {
                    OverflowPolicy::Disconnect => {
                        tracing::warn!(run_id = %self.bus.run_id, skipped, "subscriber lagged, disconnecting");
                        self.finished = true;
                        return None;
                    }
                    OverflowPolicy::DropOldest => {
                        let backfill = self.bus.retained_since(self.next_expected);
                        let lost = backfill
                            .first()
                            .map_or(0, |e| e.seq.saturating_sub(self.next_expected));
                        tracing::warn!(
                            run_id = %self.bus.run_id,
                            skipped,
                            recovered = backfill.len(),
                            lost,
                            "subscriber lagged, backfilling from retained events"
                        );
                        if let Some(last) = backfill.last() {
                            self.next_expected = last.seq + 1;
                        }
                        self.replay.extend(backfill);
                        if let Some(event) = self.replay.pop_front() {
                            return Some(self.deliver(event));
                        }
                    }
                },
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    fn deliver(&mut self, event: Event) -> Event {
        if event.seq >= self.next_expected {
            self.next_expected = event.seq + 1;
        }
        if event.is_terminal() {
            self.finished = true;
        }
        event
    }
}
