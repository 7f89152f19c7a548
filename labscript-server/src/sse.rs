//! Server-Sent Events stream of iteration events.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use labscript::core::types::IterationEvent;
use labscript::io::reporter::EventSink;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::state::{AppState, SessionEvent};

/// Event sink that publishes a session's events to SSE subscribers.
pub struct BroadcastSink {
    session_id: u64,
    tx: Arc<broadcast::Sender<SessionEvent>>,
}

impl BroadcastSink {
    pub fn new(session_id: u64, tx: Arc<broadcast::Sender<SessionEvent>>) -> Self {
        Self { session_id, tx }
    }
}

impl EventSink for BroadcastSink {
    fn report(&mut self, event: &IterationEvent) {
        let tagged = SessionEvent {
            session_id: self.session_id,
            event: event.clone(),
        };
        if self.tx.send(tagged).is_err() {
            debug!(session_id = self.session_id, "no SSE subscribers");
        }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(session_event) => {
                    let name = session_event.event.event_type();
                    if let Ok(json) = serde_json::to_string(&session_event) {
                        yield Ok(Event::default().event(name).data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use labscript::core::types::EventKind;

    #[test]
    fn broadcast_sink_tags_events_with_the_session() {
        let (tx, mut rx) = broadcast::channel(8);
        let mut sink = BroadcastSink::new(3, Arc::new(tx));
        sink.report(&IterationEvent::new(
            1,
            EventKind::IterationLog {
                message: "Starting attempt 1 of 3".to_string(),
            },
        ));

        let received = rx.try_recv().expect("event");
        assert_eq!(received.session_id, 3);
        assert_eq!(received.event.event_type(), "iteration_log");
    }

    #[test]
    fn sending_without_subscribers_is_not_an_error() {
        let (tx, rx) = broadcast::channel(8);
        drop(rx);
        let mut sink = BroadcastSink::new(1, Arc::new(tx));
        sink.report(&IterationEvent::new(
            1,
            EventKind::LlmCallStart {
                message: "Generating protocol code (attempt 1)".to_string(),
            },
        ));
    }
}
