//! Server-Sent Events stream of one run's events.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures_util::stream::Stream;
use serde::Deserialize;

use crate::agent_engine::Event;
use crate::errors::SupervisorError;
use crate::supervisor::Supervisor;

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub from_seq: Option<u64>,
}

/// Where to start the stream. A reconnecting client's `Last-Event-ID` wins over the
/// query string: it resumes right after the last event it saw.
pub(crate) fn resume_from(headers: &HeaderMap, query: &EventsQuery) -> u64 {
    let last_seen = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    match last_seen {
        Some(seq) => seq + 1,
        None => query.from_seq.unwrap_or(0),
    }
}

fn to_sse(event: &Event) -> Option<SseEvent> {
    let json = serde_json::to_string(event).ok()?;
    Some(
        SseEvent::default()
            .id(event.seq.to_string())
            .event(event.kind.as_str())
            .data(json),
    )
}

/// GET /api/runs/{run_id}/events
pub async fn events_handler(
    State(supervisor): State<Supervisor>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, SupervisorError> {
    let from_seq = resume_from(&headers, &query);
    let mut subscription = supervisor.subscribe_events(&run_id, from_seq).await?;
    tracing::debug!(run_id = %run_id, from_seq, "SSE subscriber attached");

    let stream = async_stream::stream! {
        while let Some(event) = subscription.next().await {
            if let Some(sse) = to_sse(&event) {
                yield Ok(sse);
            }
        }
        tracing::debug!(run_id = %run_id, "SSE stream finished");
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn last_event_id_resumes_after_the_seen_event() {
        let mut headers = HeaderMap::new();
        headers.insert("last-event-id", HeaderValue::from_static("41"));
        let query = EventsQuery { from_seq: Some(3) };
        assert_eq!(resume_from(&headers, &query), 42);
    }

    #[test]
    fn query_or_zero_without_header() {
        let headers = HeaderMap::new();
        assert_eq!(resume_from(&headers, &EventsQuery { from_seq: Some(7) }), 7);
        assert_eq!(resume_from(&headers, &EventsQuery::default()), 0);
    }

    #[test]
    fn garbage_last_event_id_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("last-event-id", HeaderValue::from_static("abc"));
        assert_eq!(resume_from(&headers, &EventsQuery { from_seq: Some(2) }), 2);
    }
}
