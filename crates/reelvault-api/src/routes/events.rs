//! Server-sent events
//!
//! Every connection gets an initial `jobs:status` frame, a fresh status
//! snapshot on a fixed interval, and all domain events in between. When
//! the subscriber's buffer overflowed, the next frame is a full snapshot
//! so the client can resync without replay.

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::Stream;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::state::AppState;
use reelvault_core::{Event, EventKind};

fn to_sse(event: &Event) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().event(event.kind.as_str()).data(data)
}

async fn status_event(state: &AppState) -> Option<Event> {
    match state.status_payload().await {
        Ok(payload) => Some(Event::new(
            EventKind::JobsStatus,
            payload,
            state.clock.now_ms(),
        )),
        Err(e) => {
            debug!("Status snapshot failed: {}", e);
            None
        }
    }
}

/// GET /events
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Result<SseEvent, Infallible>>(64);
    let mut subscriber = state.events.subscribe();

    tokio::spawn(async move {
        // Initial frame: the full picture.
        if let Some(event) = status_event(&state).await {
            if tx.send(Ok(to_sse(&event))).await.is_err() {
                return;
            }
        }

        let mut ticker = interval(state.status_interval);
        ticker.reset();
        let mut acknowledged_drops: u64 = 0;

        loop {
            let event = tokio::select! {
                _ = ticker.tick() => status_event(&state).await,
                received = subscriber.recv() => match received {
                    Some(event) => {
                        // Lost events mean the client's view is stale;
                        // replace this frame with a snapshot.
                        if subscriber.dropped() > acknowledged_drops {
                            acknowledged_drops = subscriber.dropped();
                            status_event(&state).await
                        } else {
                            Some(event)
                        }
                    }
                    None => break,
                },
            };

            let Some(event) = event else { continue };
            if tx.send(Ok(to_sse(&event))).await.is_err() {
                // Client disconnected.
                break;
            }
        }
        debug!(
            "SSE connection closed: subscriber={}, dropped={}",
            subscriber.id(),
            subscriber.dropped()
        );
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/events", get(events))
}
