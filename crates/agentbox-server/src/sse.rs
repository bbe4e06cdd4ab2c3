//! Server-Sent Events support.

use agentbox_agent::{AgentEvent, AgentEventStream};
use agentbox_proxy::{EventStream, StreamEvent};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use futures::StreamExt;
use std::convert::Infallible;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive")
}

fn proxy_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(serde_json::to_string(event).unwrap_or_default())
}

fn agent_event(event: &AgentEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(serde_json::to_string(event).unwrap_or_default())
}

/// Translated proxy events as SSE.
///
/// `cancel` is cancelled when the response body is dropped, which aborts the
/// upstream read when the client disconnects.
pub fn proxy_events(
    events: EventStream,
    cancel: CancellationToken,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let guard = cancel.drop_guard();
    let stream = async_stream::stream! {
        let _guard = guard;
        let mut events = events;
        while let Some(event) = events.next().await {
            yield Ok(proxy_event(&event));
        }
    };
    Sse::new(stream).keep_alive(keep_alive())
}

/// Agent events as SSE. Dropping the body drops the agent stream, which
/// kills the agent process.
pub fn agent_events(events: AgentEventStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(events.map(|event| Ok(agent_event(&event)))).keep_alive(keep_alive())
}
