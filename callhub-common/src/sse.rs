//! Server-Sent Events (SSE) utilities
//!
//! Shared SSE framing for observer streams.

use crate::events::ObserverMessage;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Heartbeat interval for idle observer connections
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Frame one observer message as an SSE event
///
/// The message's `type` tag becomes the SSE event name. Returns `None` if the
/// message cannot be serialized (logged, never fatal to the stream).
pub fn to_sse_event(message: &ObserverMessage) -> Option<Event> {
    let event_type = message.event_type();
    match serde_json::to_string(message) {
        Ok(json) => Some(Event::default().event(event_type).data(json)),
        Err(e) => {
            warn!("SSE: Failed to serialize event {}: {}", event_type, e);
            None
        }
    }
}

/// Turn a subscriber queue into an SSE response
///
/// `guard` lives as long as the stream; dropping the stream (client gone)
/// drops the guard, which is how callers detach the subscription.
///
/// # Arguments
/// * `label` - Identifies the stream in logs (e.g., the session id)
/// * `rx` - Receiving half of the subscriber queue
/// * `guard` - Value released when the client disconnects
pub fn observer_sse_stream<G>(
    label: String,
    mut rx: mpsc::Receiver<ObserverMessage>,
    guard: G,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    G: Send + 'static,
{
    info!("New SSE observer connected to {}", label);

    let stream = async_stream::stream! {
        let _guard = guard;

        yield Ok(Event::default().event("ConnectionStatus").data("connected"));

        while let Some(message) = rx.recv().await {
            debug!("SSE: Forwarding {} to observer of {}", message.event_type(), label);
            if let Some(event) = to_sse_event(&message) {
                yield Ok(event);
            }
        }

        info!("SSE: Observer stream for {} closed by hub", label);
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL).text("heartbeat"))
}
