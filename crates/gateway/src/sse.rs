//! Agent events as a `text/event-stream` body.
//!
//! Each event is one `data: <json>\n\n` frame. Dropping the body (the client
//! went away) drops the stream, which cancels the turn.

use std::convert::Infallible;

use axum::http::HeaderValue;
use axum::http::header::CONNECTION;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use cortex_agent::{AgentEvent, PreparedStream};
use cortex_core::Error;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::api::with_session_header;

/// Start the turn and wrap its events in an SSE response.
pub fn stream_response(prepared: PreparedStream) -> Result<Response, Error> {
    let session_id = prepared.session_id.clone();
    let cancel = CancellationToken::new();
    let rx = prepared.start(cancel.clone())?;
    debug!(session_id = %session_id, "SSE stream opened");

    let mut response = Sse::new(event_stream(rx, cancel.drop_guard())).into_response();
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    Ok(with_session_header(&session_id, response))
}

/// Frames until the engine closes its channel. The guard lives as long as the stream.
fn event_stream(
    rx: mpsc::Receiver<AgentEvent>,
    guard: DropGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((Ok(frame(&event)), (rx, guard)))
    })
}

fn frame(event: &AgentEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            warn!(event_type = event.event_type(), error = %e, "Unserializable agent event");
            Event::default().data(r#"{"type":"error","error":"unserializable event"}"#)
        }
    }
}
