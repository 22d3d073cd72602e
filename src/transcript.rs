//! Transcript fan-out with duplicate suppression.
//!
//! Recognition engines can re-deliver the same final result after a language
//! switch or an internal restart, and they emit empty hypotheses while the
//! speaker is silent. The relay filters both before anything reaches the
//! outbound channel, so downstream consumers see each caption exactly once.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::engine::EngineEvent;

/// One caption update for downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptUpdate {
    pub text: String,
    pub is_final: bool,
    pub language: Option<String>,
}

/// Pumps engine events into caption updates.
pub struct TranscriptRelay {
    events: mpsc::UnboundedReceiver<EngineEvent>,
    out: mpsc::UnboundedSender<TranscriptUpdate>,
    last_final: Option<String>,
}

impl TranscriptRelay {
    pub fn new(
        events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<TranscriptUpdate>) {
        let (out, out_rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                out,
                last_final: None,
            },
            out_rx,
        )
    }

    /// Run until the event channel closes (the session was dropped).
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle(event);
        }
        debug!("event channel closed, transcript relay exiting");
    }

    fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::SessionStarted => {}
            EngineEvent::Partial(t) => {
                if t.text.is_empty() {
                    return;
                }
                let _ = self.out.send(TranscriptUpdate {
                    text: t.text,
                    is_final: false,
                    language: t.language,
                });
            }
            EngineEvent::Final(t) => {
                if t.text.is_empty() {
                    return;
                }
                if self.last_final.as_deref() == Some(t.text.as_str()) {
                    debug!("suppressing duplicate final transcript");
                    return;
                }
                self.last_final = Some(t.text.clone());
                let _ = self.out.send(TranscriptUpdate {
                    text: t.text,
                    is_final: true,
                    language: t.language,
                });
            }
            EngineEvent::Canceled { reason } => {
                warn!(%reason, "recognition canceled");
            }
            EngineEvent::Stopped => {
                info!("recognition stopped");
            }
        }
    }
}
