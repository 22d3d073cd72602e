//! Recognition engine boundary.
//!
//! The session only knows these traits; everything behind them (wire
//! protocol, auth, framing) belongs to the concrete engine. A fresh engine is
//! built per connection attempt, so no connection state survives a restart.

pub mod messages;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::sink::AudioSink;

/// Errors from engine construction and connection.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),
}

/// One recognized span of speech.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    /// BCP-47 tag of the language the engine detected, when it reports one.
    pub language: Option<String>,
}

/// Asynchronous notifications from a running engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The remote session is live and accepting audio.
    SessionStarted,
    /// Interim hypothesis; may be revised by later events.
    Partial(Transcript),
    /// Finalized text for a completed utterance.
    Final(Transcript),
    /// The engine aborted the session. Terminal.
    Canceled { reason: String },
    /// The engine ended the session cleanly. Terminal.
    Stopped,
}

impl EngineEvent {
    /// Terminal events end the connection; the session decides whether to
    /// reconnect.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled { .. } | Self::Stopped)
    }
}

/// A single recognition connection.
///
/// Lifecycle: construct, take the event receiver, attach [`Self::audio_sink`]
/// to the buffer, `connect`, consume events until a terminal one, `shutdown`.
/// Engines are not reusable after shutdown; build a new one.
#[async_trait]
pub trait SpeechEngine: Send {
    /// Adapter the audio buffer drains into while this engine is attached.
    fn audio_sink(&self) -> Arc<dyn AudioSink>;

    /// The event stream. Yields `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::Receiver<EngineEvent>>;

    /// Establish the connection. Returning `Ok` means the remote session is
    /// confirmed live.
    async fn connect(&mut self) -> Result<(), EngineError>;

    /// Tear the connection down. Idempotent.
    async fn shutdown(&mut self);
}

/// Builds a fresh engine for every connection attempt.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn SpeechEngine>, EngineError>;
}
