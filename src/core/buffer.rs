//! Bounded, backpressure-aware audio buffer.
//!
//! Sits between the chunk source and the recognition engine's sink adapter.
//! Absorbs bursts, signals the producer through edge-triggered watermarks,
//! and sheds the *oldest* audio once the hard ceiling is exceeded: for live
//! captioning, fresh audio is worth more than stale audio once the consumer
//! has fallen behind.
//!
//! The buffer is built once per process and outlives individual recognition
//! sessions; only its sink adapter is swapped across reconnects, so queued
//! bytes survive a session restart.
//!
//! # Ordering
//!
//! Bytes reach the sink in exact push order across both the direct-write fast
//! path and the queued path, because the fast path is only eligible when the
//! queue is empty.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::sink::{AudioSink, SinkError};

/// Hard ceiling on queued bytes (4s of 16kHz mono s16le).
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 64_000;

/// Watermark that trips the `High` flow-control signal (90% of the ceiling).
pub const DEFAULT_HIGH_WATER_BYTES: usize = 57_600;

/// Hysteresis floor that clears the latch and emits `Ok` (30% of the ceiling).
pub const DEFAULT_RESUME_WATER_BYTES: usize = 19_200;

/// Bytes written to the sink per drain pass (100ms of audio).
pub const DEFAULT_BATCH_BYTES: usize = 3_200;

/// Fixed drain tick, independent of data volume.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Interval between stats log lines.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Errors surfaced by buffer operations.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Pushed chunks must carry at least one byte.
    #[error("audio chunk must not be empty")]
    EmptyChunk,

    /// Capacity parameters violate `resume < high <= max`.
    #[error("invalid buffer configuration: {0}")]
    InvalidConfig(String),
}

/// Capacity and timing parameters for the buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub max_buffer_bytes: usize,
    pub high_water_bytes: usize,
    pub resume_water_bytes: usize,
    pub batch_bytes: usize,
    pub drain_interval: Duration,
    pub report_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            high_water_bytes: DEFAULT_HIGH_WATER_BYTES,
            resume_water_bytes: DEFAULT_RESUME_WATER_BYTES,
            batch_bytes: DEFAULT_BATCH_BYTES,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }
}

impl BufferConfig {
    /// Enforce `resume < high <= max` and a non-zero batch size.
    pub fn validate(&self) -> Result<(), BufferError> {
        if self.high_water_bytes > self.max_buffer_bytes {
            return Err(BufferError::InvalidConfig(format!(
                "high water {} exceeds capacity {}",
                self.high_water_bytes, self.max_buffer_bytes
            )));
        }
        if self.resume_water_bytes >= self.high_water_bytes {
            return Err(BufferError::InvalidConfig(format!(
                "resume water {} must be below high water {}",
                self.resume_water_bytes, self.high_water_bytes
            )));
        }
        if self.batch_bytes == 0 {
            return Err(BufferError::InvalidConfig(
                "batch size must be non-zero".to_string(),
            ));
        }
        if self.drain_interval.is_zero() {
            return Err(BufferError::InvalidConfig(
                "drain interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Edge-triggered flow-control signal for the chunk source.
///
/// Signals strictly alternate: `High` fires once per upward crossing of the
/// high watermark, `Ok` once per downward crossing of the resume watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    /// Queue crossed the high watermark; the source should pause intake.
    High,
    /// Queue drained back to the resume watermark; intake may continue.
    Ok,
}

/// Counters reported on the stats tick and through [`BackpressureBuffer::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub queued_bytes: usize,
    pub sent_bytes: u64,
    pub lost_bytes: u64,
}

struct BufferState {
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    sent_bytes: u64,
    lost_bytes: u64,
    /// Hysteresis latch: set on the upward high-water crossing, cleared on
    /// the downward resume-water crossing, never toggled in between.
    high_emitted: bool,
    sink: Option<Arc<dyn AudioSink>>,
    sink_saturated: bool,
}

/// Bounded FIFO of audio chunks with watermark flow control.
pub struct BackpressureBuffer {
    config: BufferConfig,
    state: Mutex<BufferState>,
    flow_tx: mpsc::UnboundedSender<FlowSignal>,
    shutdown: CancellationToken,
}

impl BackpressureBuffer {
    /// Build the buffer and spawn its drain/report driver.
    ///
    /// Returns the buffer and the flow-control receiver the chunk source must
    /// obey. Must be called from within a tokio runtime.
    pub fn new(
        config: BufferConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<FlowSignal>), BufferError> {
        config.validate()?;

        let (flow_tx, flow_rx) = mpsc::unbounded_channel();
        let buffer = Arc::new(Self {
            config,
            state: Mutex::new(BufferState {
                queue: VecDeque::new(),
                queued_bytes: 0,
                sent_bytes: 0,
                lost_bytes: 0,
                high_emitted: false,
                sink: None,
                sink_saturated: false,
            }),
            flow_tx,
            shutdown: CancellationToken::new(),
        });

        buffer.spawn_driver();
        Ok((buffer, flow_rx))
    }

    /// Accept one chunk from the source.
    ///
    /// Takes the direct-write fast path when nothing is queued and the sink
    /// is keeping up; otherwise enqueues, evicts overflow from the front, and
    /// checks the high watermark. Always follows up with a drain pass.
    pub fn push(&self, chunk: Bytes) -> Result<(), BufferError> {
        if chunk.is_empty() {
            return Err(BufferError::EmptyChunk);
        }

        let mut state = self.state.lock();

        // Fast path: only eligible with an empty queue, so FIFO order is
        // preserved relative to anything already queued.
        if state.queued_bytes == 0 && !state.sink_saturated {
            if let Some(sink) = state.sink.clone() {
                match sink.write(chunk.clone()) {
                    Ok(writable) => {
                        state.sent_bytes += chunk.len() as u64;
                        if !writable {
                            state.sink_saturated = true;
                        }
                        return Ok(());
                    }
                    Err(SinkError::Saturated) => {
                        state.sink_saturated = true;
                        // Fall through and queue the chunk.
                    }
                    Err(e) => {
                        debug!("direct write failed, queueing chunk: {e}");
                    }
                }
            }
        }

        state.queued_bytes += chunk.len();
        state.queue.push_back(chunk);
        self.evict_overflow(&mut state);
        self.check_high_water(&mut state);
        drop(state);

        self.drain();
        Ok(())
    }

    /// Attach (or replace) the sink adapter.
    ///
    /// Second half of the detach/attach handoff protocol: queued bytes are
    /// untouched and draining resumes immediately against the new sink. The
    /// driver picks up the new drain notification on its next pass.
    pub fn attach_sink(&self, sink: Arc<dyn AudioSink>) {
        {
            let mut state = self.state.lock();
            state.sink = Some(sink);
            state.sink_saturated = false;
        }
        self.drain();
    }

    /// Detach the current sink adapter, leaving the queue intact.
    ///
    /// Pushed chunks accumulate (subject to the eviction policy) until the
    /// session attaches a replacement.
    pub fn detach_sink(&self) {
        let mut state = self.state.lock();
        state.sink = None;
        state.sink_saturated = false;
    }

    /// Write up to one batch of queued bytes to the sink, oldest first.
    ///
    /// Splits the head chunk at the batch boundary when needed and stops
    /// early on saturation; a failed write leaves the bytes at the front of
    /// the queue for the next tick. Clears the flow-control latch once the
    /// queue falls back to the resume watermark.
    pub fn drain(&self) {
        let mut state = self.state.lock();

        if let Some(sink) = state.sink.clone() {
            let mut budget = self.config.batch_bytes;

            while budget > 0 && !state.sink_saturated {
                let Some(mut head) = state.queue.pop_front() else {
                    break;
                };

                let part = if head.len() > budget {
                    let part = head.split_to(budget);
                    state.queue.push_front(head);
                    part
                } else {
                    head
                };

                match sink.write(part.clone()) {
                    Ok(writable) => {
                        state.queued_bytes -= part.len();
                        state.sent_bytes += part.len() as u64;
                        budget -= part.len();
                        if !writable {
                            state.sink_saturated = true;
                        }
                    }
                    Err(e) => {
                        // Transient: the chunk goes back to the front and is
                        // retried on the next drain tick. No data is dropped
                        // here; only overflow eviction loses bytes.
                        if matches!(e, SinkError::Saturated) {
                            state.sink_saturated = true;
                        }
                        state.queue.push_front(part);
                        debug!("sink write failed, retrying next tick: {e}");
                        break;
                    }
                }
            }
        }

        if state.high_emitted && state.queued_bytes <= self.config.resume_water_bytes {
            state.high_emitted = false;
            let _ = self.flow_tx.send(FlowSignal::Ok);
            info!(queued_bytes = state.queued_bytes, "flow control released");
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock();
        BufferStats {
            queued_bytes: state.queued_bytes,
            sent_bytes: state.sent_bytes,
            lost_bytes: state.lost_bytes,
        }
    }

    /// Cancel the drain and reporting timers. The queue is left as-is; the
    /// process is terminating.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn spawn_driver(self: &Arc<Self>) {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            let mut drain_tick = tokio::time::interval(buffer.config.drain_interval);
            drain_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut report_tick = tokio::time::interval(buffer.config.report_interval);
            report_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                // Re-read every pass so a sink swapped by the session gets
                // its drain notification subscribed within one tick.
                let drain_notify = buffer.current_drain_notify();

                tokio::select! {
                    _ = buffer.shutdown.cancelled() => break,
                    _ = drain_tick.tick() => buffer.drain(),
                    _ = report_tick.tick() => buffer.report(),
                    _ = wait_drain_notify(drain_notify) => {
                        buffer.state.lock().sink_saturated = false;
                        buffer.drain();
                    }
                }
            }
        });
    }

    fn current_drain_notify(&self) -> Option<Arc<Notify>> {
        self.state.lock().sink.as_ref().map(|s| s.drain_notify())
    }

    /// Evict exactly the excess bytes from the front of the queue, splitting
    /// the oldest chunk when it straddles the boundary, so the queue holds
    /// precisely the newest `max_buffer_bytes`.
    fn evict_overflow(&self, state: &mut BufferState) {
        let max = self.config.max_buffer_bytes;
        if state.queued_bytes <= max {
            return;
        }

        let lost = state.queued_bytes - max;
        let mut excess = lost;
        while excess > 0 {
            let Some(front) = state.queue.front_mut() else {
                break;
            };
            let front_len = front.len();
            if front_len <= excess {
                state.queue.pop_front();
                excess -= front_len;
            } else {
                // Trim only the stale prefix; the tail of the chunk survives.
                front.advance(excess);
                excess = 0;
            }
        }

        state.queued_bytes -= lost;
        state.lost_bytes += lost as u64;
        warn!(
            evicted_bytes = lost,
            lost_bytes_total = state.lost_bytes,
            "buffer overflow, evicted oldest audio"
        );
    }

    fn check_high_water(&self, state: &mut BufferState) {
        if !state.high_emitted && state.queued_bytes >= self.config.high_water_bytes {
            state.high_emitted = true;
            let _ = self.flow_tx.send(FlowSignal::High);
            warn!(
                queued_bytes = state.queued_bytes,
                "high watermark reached, requesting source pause"
            );
        }
    }

    fn report(&self) {
        let stats = self.stats();
        info!(
            queued_bytes = stats.queued_bytes,
            sent_bytes = stats.sent_bytes,
            lost_bytes = stats.lost_bytes,
            "audio buffer stats"
        );
    }
}

async fn wait_drain_notify(notify: Option<Arc<Notify>>) {
    match notify {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}
