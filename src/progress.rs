//! Progress reporting.
//!
//! The engine hands every [`ProgressEvent`] to a [`ProgressReporter`], which
//! fans it out to the attached sinks. Reporting never influences execution:
//! each sink call is bounded by a timeout, and sink errors and timeouts are
//! logged and dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{ProgressEvent, Result};

/// Default channel capacity for broadcast sinks.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// A destination for progress events.
///
/// Implementations may be slow or fail; the reporter bounds and absorbs both.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Delivers one event.
    async fn report(&self, event: &ProgressEvent) -> Result<()>;
}

/// Fans events out to a set of sinks.
#[derive(Clone)]
pub struct ProgressReporter {
    sinks: Vec<Arc<dyn ProgressSink>>,
    timeout: Duration,
}

impl ProgressReporter {
    /// Creates a reporter without sinks.
    pub fn new(timeout: Duration) -> Self {
        Self {
            sinks: Vec::new(),
            timeout,
        }
    }

    /// Attaches a sink.
    pub fn add_sink(&mut self, sink: Arc<dyn ProgressSink>) {
        self.sinks.push(sink);
    }

    /// Number of attached sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Delivers `event` to every sink.
    ///
    /// Sinks are called concurrently, so the whole call takes at most about
    /// one timeout.
    pub async fn report(&self, event: ProgressEvent) {
        if self.sinks.is_empty() {
            return;
        }

        let deliveries = self.sinks.iter().map(|sink| {
            let event = &event;
            async move {
                match tokio::time::timeout(self.timeout, sink.report(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(chunk_id = event.chunk_id, error = %e, "progress sink failed");
                    }
                    Err(_) => {
                        warn!(
                            chunk_id = event.chunk_id,
                            timeout_ms = self.timeout.as_millis() as u64,
                            "progress sink timed out"
                        );
                    }
                }
            }
        });
        join_all(deliveries).await;
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("sinks", &self.sinks.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Writes events to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl ProgressSink for TracingSink {
    async fn report(&self, event: &ProgressEvent) -> Result<()> {
        info!(
            chunk_id = event.chunk_id,
            status = %event.status,
            stage = event.stage.map(|s| s.as_str()).unwrap_or("-"),
            kind = event.kind.as_str(),
            summary = event.summary.as_deref().unwrap_or(""),
            "progress"
        );
        Ok(())
    }
}

/// Publishes events on a tokio broadcast channel.
///
/// Events are not persisted; if a receiver is too slow, events may be
/// dropped for it.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastSink {
    /// Creates a sink with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CHANNEL_CAPACITY)
    }

    /// Creates a sink whose channel buffers up to `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns a receiver for all events published from now on.
    ///
    /// # Example
    ///
    /// ```
    /// # use storyreel::BroadcastSink;
    /// let sink = BroadcastSink::new();
    /// let mut events = sink.subscribe();
    ///
    /// // In a separate task:
    /// // while let Ok(event) = events.recv().await {
    /// //     println!("chunk {} is {}", event.chunk_id, event.status);
    /// // }
    /// # drop(events);
    /// ```
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressSink for BroadcastSink {
    async fn report(&self, event: &ProgressEvent) -> Result<()> {
        // No subscribers is not a failure.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Calls a closure for every event.
pub struct CallbackSink<F> {
    callback: F,
}

impl<F> CallbackSink<F>
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    /// Wraps `callback`.
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> fmt::Debug for CallbackSink<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> ProgressSink for CallbackSink<F>
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    async fn report(&self, event: &ProgressEvent) -> Result<()> {
        (self.callback)(event);
        Ok(())
    }
}
