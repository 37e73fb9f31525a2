// GET /sessions/:id/stream - the per-session SSE event stream
//
// Opens with `connected`, then relays bus events in push order, interleaved
// with a 30 s heartbeat. Client disconnect drops the stream future; the
// guard then removes the subscriber and lets matchmaking clean up any
// waiting entry for the session.

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use futures::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::AgentRunner;
use crate::bus::EventBus;
use crate::error::ApiError;
use crate::events::SessionEvent;
use crate::matchmaking::Matchmaker;
use crate::server::state::AppState;

/// Interval between heartbeat events on an open stream.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Cleans up after a closed stream, however it closed.
struct StreamGuard {
    bus: Arc<EventBus>,
    matchmaker: Arc<Matchmaker>,
    agents: Arc<AgentRunner>,
    session_id: String,
    subscriber_id: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.session_id, self.subscriber_id);
        self.matchmaker.handle_disconnect(&self.session_id);
        tracing::debug!(session_id = %self.session_id, "SSE stream closed");

        // Solo AI chat streams to the session itself; with the last tab gone
        // there is nobody left to stream to.
        if self.bus.subscriber_count(&self.session_id) == 0 {
            self.agents.cancel(&self.session_id);
        }
    }
}

pub async fn stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Unknown session ids get a 404, not an empty stream.
    state.sessions.get(&session_id).await?;

    let subscription = state.bus.subscribe(&session_id);
    tracing::debug!(session_id = %session_id, "SSE stream opened");

    // Built outside the stream body: the guard must run even when the
    // client disconnects before the stream is first polled.
    let guard = StreamGuard {
        bus: state.bus.clone(),
        matchmaker: state.matchmaker.clone(),
        agents: state.agents.clone(),
        session_id: session_id.clone(),
        subscriber_id: subscription.id,
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        let mut rx = subscription.rx;

        yield sse_event(&SessionEvent::Connected {
            session_id: session_id.clone(),
        });

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => yield sse_event(&event),
                    None => break,
                },
                _ = heartbeat.tick() => {
                    yield sse_event(&SessionEvent::Heartbeat {});
                }
            }
        }
    };

    Ok(Sse::new(stream))
}

fn sse_event(event: &SessionEvent) -> Result<Event, Infallible> {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Ok(Event::default().event(event.name()).data(data))
}
