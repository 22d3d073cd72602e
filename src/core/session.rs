//! Resilient recognition session.
//!
//! Owns one recognition connection's lifecycle and restarts the pipeline on
//! terminal failure with capped exponential backoff. The audio buffer is a
//! collaborator, not a child: it persists across restarts, and the session
//! only swaps the sink adapter underneath it.
//!
//! # Stop guard
//!
//! `stop()` must win every race with a pending reconnect. The cancellation
//! token is checked before the backoff sleep is entered, raced against the
//! sleep itself, and checked again when the sleep completes, so a reconnect
//! can never fire after `stop()` returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::buffer::BackpressureBuffer;
use crate::core::engine::{EngineEvent, EngineFactory};

/// Default first reconnect delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1_000);

/// Default reconnect delay ceiling.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_millis(15_000);

/// Errors from session lifecycle operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session already started")]
    AlreadyStarted,
}

/// Lifecycle states. Owned exclusively by the session; collaborators never
/// inspect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
    Stopped,
    ReconnectWait,
}

/// Capped exponential backoff for reconnect scheduling.
///
/// The attempt counter lives in the session and is incremented on every
/// failure, never reset on success: a connection that flaps repeatedly keeps
/// climbing toward the cap instead of hammering the service at the base
/// delay after each brief recovery.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl BackoffPolicy {
    /// `min(cap, base * 2^attempt)`, saturating.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }
}

/// Outcome of one connection's run, as seen by the supervisor.
enum RunOutcome {
    /// Stop was requested; do not reconnect.
    StopRequested,
    /// The connection failed or ended without a stop request; reconnect.
    Failed,
}

struct SessionInner {
    buffer: Arc<BackpressureBuffer>,
    factory: Arc<dyn EngineFactory>,
    backoff: BackoffPolicy,
    state: Mutex<SessionState>,
    attempts: AtomicU32,
    stop: CancellationToken,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl SessionInner {
    fn set_state(&self, next: SessionState) {
        *self.state.lock() = next;
    }

    /// Supervisor loop: run one connection, then either exit (stop) or sleep
    /// the backoff and try again.
    async fn supervise(self: Arc<Self>) {
        loop {
            match self.run_once().await {
                RunOutcome::StopRequested => break,
                RunOutcome::Failed => {}
            }

            // Previous value feeds the delay: first failure waits base.
            let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
            let delay = self.backoff.delay_for(attempt);
            self.set_state(SessionState::ReconnectWait);
            warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "recognition session lost, scheduling restart"
            );

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            // The sleep may complete in the same poll as a concurrent
            // stop(); re-check before touching the factory.
            if self.stop.is_cancelled() {
                break;
            }
        }
        self.set_state(SessionState::Stopped);
    }

    /// Build, connect, and pump one engine until it ends.
    async fn run_once(&self) -> RunOutcome {
        self.set_state(SessionState::Starting);
        let started = Instant::now();

        let mut engine = tokio::select! {
            _ = self.stop.cancelled() => return RunOutcome::StopRequested,
            created = self.factory.create() => match created {
                Ok(engine) => engine,
                Err(e) => {
                    error!("failed to create recognition engine: {e}");
                    return RunOutcome::Failed;
                }
            }
        };

        let Some(mut events) = engine.take_events() else {
            error!("engine factory produced an engine without an event stream");
            return RunOutcome::Failed;
        };

        // Attach before connecting so queued audio starts flowing into the
        // engine's channel as soon as the remote session opens.
        self.buffer.attach_sink(engine.audio_sink());

        let connected = tokio::select! {
            _ = self.stop.cancelled() => {
                self.buffer.detach_sink();
                engine.shutdown().await;
                return RunOutcome::StopRequested;
            }
            result = engine.connect() => result,
        };

        if let Err(e) = connected {
            error!("recognition session failed to start: {e}");
            self.buffer.detach_sink();
            engine.shutdown().await;
            return RunOutcome::Failed;
        }

        self.set_state(SessionState::Active);
        info!(
            start_latency_ms = started.elapsed().as_millis() as u64,
            "recognition session active"
        );

        let outcome = loop {
            tokio::select! {
                _ = self.stop.cancelled() => break RunOutcome::StopRequested,
                event = events.recv() => match event {
                    Some(event) => {
                        let terminal = event.is_terminal();
                        let _ = self.event_tx.send(event);
                        if terminal {
                            break RunOutcome::Failed;
                        }
                    }
                    None => {
                        warn!("engine event stream closed");
                        break RunOutcome::Failed;
                    }
                }
            }
        };

        self.buffer.detach_sink();
        engine.shutdown().await;
        outcome
    }
}

/// Self-healing wrapper around a stream of recognition connections.
pub struct ResilientSession {
    inner: Arc<SessionInner>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ResilientSession {
    /// Build the session. The returned receiver carries every engine event,
    /// across restarts, in order.
    pub fn new(
        buffer: Arc<BackpressureBuffer>,
        factory: Arc<dyn EngineFactory>,
        backoff: BackoffPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = Self {
            inner: Arc::new(SessionInner {
                buffer,
                factory,
                backoff,
                state: Mutex::new(SessionState::Idle),
                attempts: AtomicU32::new(0),
                stop: CancellationToken::new(),
                event_tx,
            }),
            supervisor: Mutex::new(None),
        };
        (session, event_rx)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Total failure-triggered reconnect attempts so far.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Launch the supervisor. Rejected unless the session is [`SessionState::Idle`].
    pub fn start(&self) -> Result<(), SessionError> {
        {
            let mut state = self.inner.state.lock();
            if *state != SessionState::Idle {
                return Err(SessionError::AlreadyStarted);
            }
            *state = SessionState::Starting;
        }

        let inner = Arc::clone(&self.inner);
        *self.supervisor.lock() = Some(tokio::spawn(inner.supervise()));
        Ok(())
    }

    /// Tear the session down. Idempotent and safe to race with a pending
    /// reconnect: the latched token guarantees no restart fires afterwards.
    pub async fn stop(&self) {
        self.inner.set_state(SessionState::Stopping);
        self.inner.stop.cancel();

        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("session supervisor panicked: {e}");
            }
        }
        self.inner.set_state(SessionState::Stopped);
    }
}
