//! Sink adapter boundary between the backpressure buffer and a recognition
//! engine's audio input.
//!
//! The buffer only ever talks to a [`AudioSink`]; the session swaps the
//! concrete adapter underneath it on every reconnect without touching the
//! queued audio.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

/// Errors a sink write can report.
///
/// Both variants are transient from the buffer's point of view: the chunk was
/// not consumed and stays queued for the next drain pass.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink cannot accept any data right now.
    #[error("sink is saturated")]
    Saturated,

    /// The sink's consumer is gone; the session will replace the adapter.
    #[error("sink is closed")]
    Closed,
}

/// Destination capability the buffer drains into.
///
/// `write` must not block. Return values:
/// - `Ok(true)`  - chunk consumed, sink still writable
/// - `Ok(false)` - chunk consumed, sink saturated; callers must hold further
///   writes until [`AudioSink::drain_notify`] fires
/// - `Err(_)`    - chunk **not** consumed; callers keep it queued and retry
pub trait AudioSink: Send + Sync {
    fn write(&self, chunk: Bytes) -> Result<bool, SinkError>;

    /// Notified when a previously saturated sink can accept writes again.
    fn drain_notify(&self) -> Arc<Notify>;
}

/// Adapter over a bounded audio channel feeding a recognition engine.
///
/// Saturation maps to the channel running out of permits; a watcher task
/// waits for capacity to return and fires the drain notification.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
    drain: Arc<Notify>,
    saturation: Arc<Notify>,
    watcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ChannelSink {
    /// Wrap the sender side of an engine's audio channel.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(tx: mpsc::Sender<Bytes>) -> Arc<Self> {
        let drain = Arc::new(Notify::new());
        let saturation = Arc::new(Notify::new());

        let watcher = tokio::spawn({
            let tx = tx.clone();
            let drain = drain.clone();
            let saturation = saturation.clone();
            async move {
                loop {
                    saturation.notified().await;
                    // A permit becomes available once the engine task has
                    // pulled audio off the channel; release it immediately
                    // so the buffer's next write can claim it.
                    match tx.reserve().await {
                        Ok(permit) => {
                            drop(permit);
                            drain.notify_one();
                        }
                        Err(_) => {
                            debug!("audio channel closed, drain watcher exiting");
                            break;
                        }
                    }
                }
            }
        });

        Arc::new(Self {
            tx,
            drain,
            saturation,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Stop the drain watcher. Called by the session when the adapter is
    /// retired; further writes report [`SinkError::Closed`] once the engine
    /// side drops the receiver.
    pub fn close(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}

impl AudioSink for ChannelSink {
    fn write(&self, chunk: Bytes) -> Result<bool, SinkError> {
        match self.tx.try_send(chunk) {
            Ok(()) => {
                if self.tx.capacity() == 0 {
                    self.saturation.notify_one();
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.saturation.notify_one();
                Err(SinkError::Saturated)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }

    fn drain_notify(&self) -> Arc<Notify> {
        self.drain.clone()
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}
