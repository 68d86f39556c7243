//! SSE feed endpoint — read-only change notifications.
//!
//! DESIGN
//! ======
//! Each connection subscribes a bounded mailbox with the change broadcaster
//! and streams it out as `update` events, after a leading `connected` event.
//! Keep-alive comments flow every 30 seconds so dead connections surface at
//! the transport layer. Dropping the response stream (client disconnect)
//! unsubscribes via the stream's drop guard.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::services::broadcast::{ChangeBroadcaster, ChangeEvent, SubscriberId};
use crate::state::AppState;

const KEEP_ALIVE_INTERVAL_SECS: u64 = 30;

// =============================================================================
// HANDLER
// =============================================================================

pub async fn handle_events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (id, rx) = state.feed.subscribe();
    info!(subscriber_id = %id, "events: feed client connected");

    let connected = stream::once(async {
        Ok::<_, Infallible>(Event::default().event("connected").data(r#"{"status":"connected"}"#))
    });

    let updates = FeedStream::new(state.feed.clone(), id, rx).map(|event| {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().event("update").data(payload))
    });

    Sse::new(connected.chain(updates)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEP_ALIVE_INTERVAL_SECS))
            .text("keepalive"),
    )
}

// =============================================================================
// FEED STREAM
// =============================================================================

/// Subscriber mailbox as a stream, unsubscribing from the broadcaster when
/// the connection goes away.
struct FeedStream {
    feed: ChangeBroadcaster,
    id: SubscriberId,
    rx: ReceiverStream<ChangeEvent>,
}

impl FeedStream {
    fn new(feed: ChangeBroadcaster, id: SubscriberId, rx: tokio::sync::mpsc::Receiver<ChangeEvent>) -> Self {
        Self { feed, id, rx: ReceiverStream::new(rx) }
    }
}

impl Stream for FeedStream {
    type Item = ChangeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().rx).poll_next(cx)
    }
}

impl Drop for FeedStream {
    fn drop(&mut self) {
        self.feed.unsubscribe(self.id);
        info!(subscriber_id = %self.id, "events: feed client disconnected");
    }
}

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;
