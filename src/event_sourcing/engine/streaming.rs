use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::watch;

use crate::error::Result;
use crate::event_sourcing::commit::TrackingToken;
use crate::event_sourcing::core::{TrackedEventData, TrackedEventMessage};
use super::EventStorageEngine;

// ============================================================================
// Streaming Reads
// ============================================================================
//
// A read is a loop of fetch_batch calls. Each fetched batch is delivered in
// full before the next fetch; the only suspension point besides fetching is
// the idle sleep of a follow-mode stream that has caught up. Cancellation is
// observed there and before every fetch, never in the middle of a batch.
//
// Every delivered event carries the token that resumes right after it, so a
// consumer that remembers the last token it processed can reopen the stream
// without gaps or repeats.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// End once every commit present at fetch time has been delivered.
    #[default]
    Finite,
    /// Keep polling for new commits until cancelled.
    Follow,
}

/// Cancellation handle for a [`TrackedEventStream`].
#[derive(Debug, Clone)]
pub struct EventSubscription {
    cancel: Arc<watch::Sender<bool>>,
}

impl EventSubscription {
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Stream of tracked events produced by [`EventStorageEngine::read_events`].
pub struct TrackedEventStream {
    inner: BoxStream<'static, Result<TrackedEventMessage>>,
    subscription: EventSubscription,
}

impl std::fmt::Debug for TrackedEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedEventStream")
            .field("cancelled", &self.subscription.is_cancelled())
            .finish()
    }
}

impl TrackedEventStream {
    pub(super) fn open(engine: EventStorageEngine, token: TrackingToken, mode: ReadMode) -> Self {
        let (sender, cancelled) = watch::channel(false);

        tracing::info!(token = %token, mode = ?mode, "📡 Opening event stream");

        let state = ReadState {
            batch_size: engine.config().batch_size,
            engine,
            token,
            mode,
            buffer: VecDeque::new(),
            cancelled,
            finished: false,
        };

        let inner = stream::unfold(state, |mut state| async move {
            let item = state.next_item().await?;
            Some((item, state))
        })
        .boxed();

        Self {
            inner,
            subscription: EventSubscription {
                cancel: Arc::new(sender),
            },
        }
    }

    /// Handle that can cancel this stream from elsewhere.
    pub fn subscription(&self) -> EventSubscription {
        self.subscription.clone()
    }

    pub fn cancel(&self) {
        self.subscription.cancel();
    }
}

impl Stream for TrackedEventStream {
    type Item = Result<TrackedEventMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

struct ReadState {
    engine: EventStorageEngine,
    token: TrackingToken,
    mode: ReadMode,
    batch_size: usize,
    buffer: VecDeque<TrackedEventData>,
    cancelled: watch::Receiver<bool>,
    finished: bool,
}

impl ReadState {
    async fn next_item(&mut self) -> Option<Result<TrackedEventMessage>> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(tracked) = self.buffer.pop_front() {
                let item = self.engine.to_tracked_message(tracked);
                match (&item, &self.engine.metrics) {
                    (Ok(_), Some(metrics)) => metrics.record_delivered(1),
                    (Err(_), _) => self.finished = true,
                    _ => {}
                }
                return Some(item);
            }

            let cancelled = *self.cancelled.borrow();
            if cancelled {
                tracing::info!(token = %self.token, "🛑 Event stream cancelled");
                return None;
            }

            let batch = match self.engine.fetch_batch(&self.token, self.batch_size).await {
                Ok(batch) => batch,
                Err(error) => {
                    tracing::warn!(token = %self.token, error = %error, "Event stream fetch failed");
                    self.finished = true;
                    return Some(Err(error));
                }
            };

            if let Some(scanned_to) = batch.scanned_to {
                self.token = scanned_to;
                self.buffer.extend(batch.events);
                continue;
            }

            match self.mode {
                ReadMode::Finite => return None,
                ReadMode::Follow => self.idle().await,
            }
        }
    }

    /// Wait for the next poll, waking early on cancellation.
    async fn idle(&mut self) {
        tracing::debug!(token = %self.token, "Caught up, waiting for new commits");
        if let Some(metrics) = &self.engine.metrics {
            metrics.poll_cycles.inc();
        }

        let poll_interval = self.engine.config().poll_interval;
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = self.cancelled.changed() => {}
        }
    }
}
