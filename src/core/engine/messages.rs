//! Wire message types for the streaming recognition WebSocket protocol.
//!
//! - **Incoming messages**: session lifecycle and transcription results
//!   - [`SessionStartedMessage`]: session is live and accepting audio
//!   - [`HypothesisMessage`]: interim transcript, subject to revision
//!   - [`RecognizedMessage`]: final transcript for a completed utterance
//!   - [`CanceledMessage`]: session aborted by the server
//!   - [`SessionStoppedMessage`]: session ended cleanly
//!
//! - **Outgoing messages**: binary PCM frames (no JSON wrapper) plus
//!   [`StopRecognitionMessage`] for graceful teardown.

use serde::{Deserialize, Serialize};

/// Session confirmation received once the server is ready for audio.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartedMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    /// Server-assigned session identifier.
    pub session_id: String,
}

/// Interim transcription result. Revised by later hypotheses until a
/// recognized message closes the utterance.
#[derive(Debug, Clone, Deserialize)]
pub struct HypothesisMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub text: String,
    /// Detected language (when language identification is enabled).
    #[serde(default)]
    pub language: Option<String>,
}

/// Final transcription result for one utterance.
#[derive(Debug, Clone, Deserialize)]
pub struct RecognizedMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// Server aborted the session.
#[derive(Debug, Clone, Deserialize)]
pub struct CanceledMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub error_code: Option<String>,
    /// Human-readable cancellation reason.
    #[serde(default)]
    pub reason: String,
}

/// Server ended the session cleanly.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStoppedMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub session_id: String,
}

/// Request graceful session teardown. Remaining results are delivered
/// before the server sends `SessionStopped`.
#[derive(Debug, Clone, Serialize)]
pub struct StopRecognitionMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
}

impl Default for StopRecognitionMessage {
    fn default() -> Self {
        Self {
            message_type: "stop_recognition",
        }
    }
}

/// Enum over all server-to-client messages.
///
/// Use [`ServerMessage::parse`] on incoming WebSocket text frames.
#[derive(Debug)]
pub enum ServerMessage {
    SessionStarted(SessionStartedMessage),
    Hypothesis(HypothesisMessage),
    Recognized(RecognizedMessage),
    Canceled(CanceledMessage),
    SessionStopped(SessionStoppedMessage),
    /// Unknown message type, kept for forward compatibility.
    Unknown(String),
}

impl ServerMessage {
    /// Parse a WebSocket text frame into the appropriate type.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        // Peek at the type field first.
        #[derive(Deserialize)]
        struct TypePeek {
            #[serde(rename = "type")]
            message_type: String,
        }

        let peek: TypePeek = serde_json::from_str(text)?;

        match peek.message_type.as_str() {
            "session_started" => Ok(Self::SessionStarted(serde_json::from_str(text)?)),
            "hypothesis" => Ok(Self::Hypothesis(serde_json::from_str(text)?)),
            "recognized" => Ok(Self::Recognized(serde_json::from_str(text)?)),
            "canceled" => Ok(Self::Canceled(serde_json::from_str(text)?)),
            "session_stopped" => Ok(Self::SessionStopped(serde_json::from_str(text)?)),
            _ => Ok(Self::Unknown(text.to_string())),
        }
    }

    /// Terminal messages end the connection.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled(_) | Self::SessionStopped(_))
    }
}
