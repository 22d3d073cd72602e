//! Streaming recognition WebSocket client.
//!
//! Implements [`SpeechEngine`] over a WebSocket that accepts raw binary PCM
//! frames and emits JSON lifecycle/transcript messages (see
//! [`super::messages`]).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌───────────────────┐    ┌──────────────────┐
//! │ ChannelSink  │───▶│ audio_rx (mpsc 32)│───▶│  WebSocket task  │
//! └──────────────┘    └───────────────────┘    └────────┬─────────┘
//!                                                       │
//!                     ┌───────────────────┐             │
//!                     │  event_tx (mpsc)  │◀────────────┘
//!                     └───────────────────┘
//! ```
//!
//! The bounded audio channel is the saturation point the buffer's sink
//! adapter reacts to; the connection task applies WebSocket backpressure by
//! awaiting each send.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use super::messages::{ServerMessage, StopRecognitionMessage};
use super::{EngineError, EngineEvent, EngineFactory, SpeechEngine, Transcript};
use crate::core::sink::{AudioSink, ChannelSink};

/// Audio channel depth. 32 chunks of 100ms audio gives the connection task
/// over three seconds of slack before the buffer sees saturation.
const AUDIO_CHANNEL_CAPACITY: usize = 32;

/// Event channel depth; transcripts are small and consumed promptly.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Handshake deadline: connect plus the server's session confirmation.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-message idle timeout. Catches stuck connections that never close.
const WS_MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection parameters for [`WsEngine`].
#[derive(Debug, Clone)]
pub struct WsEngineConfig {
    /// Base WebSocket endpoint, e.g. `wss://host/speech/recognition`.
    pub endpoint: String,
    pub subscription_key: String,
    pub region: String,
    /// Candidate languages for server-side language identification.
    pub languages: Vec<String>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl WsEngineConfig {
    /// Build the connection URL with recognition parameters as query items.
    pub fn build_websocket_url(&self) -> Result<Url, EngineError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| EngineError::ProtocolError(format!("invalid endpoint: {e}")))?;

        url.query_pairs_mut()
            .append_pair("region", &self.region)
            .append_pair("languages", &self.languages.join(","))
            .append_pair("sample_rate", &self.sample_rate.to_string())
            .append_pair("channels", &self.channels.to_string())
            .append_pair("format", "pcm_s16le");

        Ok(url)
    }
}

/// WebSocket-backed recognition engine. One connection per instance.
pub struct WsEngine {
    config: WsEngineConfig,
    sink: Arc<ChannelSink>,
    audio_rx: Option<mpsc::Receiver<Bytes>>,
    event_tx: mpsc::Sender<EngineEvent>,
    event_rx: Option<mpsc::Receiver<EngineEvent>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    connection_handle: Option<tokio::task::JoinHandle<()>>,
    is_connected: Arc<AtomicBool>,
}

impl WsEngine {
    pub fn new(config: WsEngineConfig) -> Self {
        let (audio_tx, audio_rx) = mpsc::channel::<Bytes>(AUDIO_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<EngineEvent>(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            sink: ChannelSink::new(audio_tx),
            audio_rx: Some(audio_rx),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            connection_handle: None,
            is_connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle one incoming WebSocket message.
    ///
    /// Returns `Ok(true)` to keep the connection, `Ok(false)` once a terminal
    /// message or close frame arrives.
    async fn handle_websocket_message(
        message: Message,
        event_tx: &mpsc::Sender<EngineEvent>,
        connected_tx: &mut Option<oneshot::Sender<()>>,
    ) -> Result<bool, EngineError> {
        match message {
            Message::Text(text) => match ServerMessage::parse(&text) {
                Ok(ServerMessage::SessionStarted(m)) => {
                    info!(session_id = %m.session_id, "recognition session started");
                    if let Some(tx) = connected_tx.take() {
                        let _ = tx.send(());
                    }
                    let _ = event_tx.send(EngineEvent::SessionStarted).await;
                }
                Ok(ServerMessage::Hypothesis(m)) => {
                    let _ = event_tx
                        .send(EngineEvent::Partial(Transcript {
                            text: m.text,
                            language: m.language,
                        }))
                        .await;
                }
                Ok(ServerMessage::Recognized(m)) => {
                    let _ = event_tx
                        .send(EngineEvent::Final(Transcript {
                            text: m.text,
                            language: m.language,
                        }))
                        .await;
                }
                Ok(ServerMessage::Canceled(m)) => {
                    warn!(
                        error_code = m.error_code.as_deref().unwrap_or("none"),
                        reason = %m.reason,
                        "recognition session canceled by server"
                    );
                    let _ = event_tx
                        .send(EngineEvent::Canceled { reason: m.reason })
                        .await;
                    return Ok(false);
                }
                Ok(ServerMessage::SessionStopped(m)) => {
                    info!(session_id = %m.session_id, "recognition session stopped");
                    let _ = event_tx.send(EngineEvent::Stopped).await;
                    return Ok(false);
                }
                Ok(ServerMessage::Unknown(raw)) => {
                    debug!("unknown server message type: {raw}");
                }
                Err(e) => {
                    warn!("failed to parse server message: {e}");
                }
            },

            Message::Close(frame) => {
                info!("websocket closed by server: {frame:?}");
                return Ok(false);
            }

            Message::Ping(_) | Message::Pong(_) => {}

            Message::Binary(_) => {
                debug!("unexpected binary message from server");
            }

            _ => {
                debug!("unexpected message type");
            }
        }

        Ok(true)
    }
}

#[async_trait::async_trait]
impl SpeechEngine for WsEngine {
    fn audio_sink(&self) -> Arc<dyn AudioSink> {
        self.sink.clone()
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.event_rx.take()
    }

    async fn connect(&mut self) -> Result<(), EngineError> {
        if self.config.subscription_key.is_empty() {
            return Err(EngineError::AuthenticationFailed(
                "subscription key is required".to_string(),
            ));
        }
        let Some(mut audio_rx) = self.audio_rx.take() else {
            return Err(EngineError::ConnectionFailed(
                "engine already connected once".to_string(),
            ));
        };

        let ws_url = self.config.build_websocket_url()?;
        let host = ws_url
            .host_str()
            .ok_or_else(|| EngineError::ProtocolError("endpoint has no host".to_string()))?
            .to_string();

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let (connected_tx, connected_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let subscription_key = self.config.subscription_key.clone();
        let event_tx = self.event_tx.clone();
        let is_connected = self.is_connected.clone();

        let connection_handle = tokio::spawn(async move {
            let request = match tokio_tungstenite::tungstenite::http::Request::builder()
                .method("GET")
                .uri(ws_url.as_str())
                .header("Host", &host)
                .header("Upgrade", "websocket")
                .header("Connection", "upgrade")
                .header("Sec-WebSocket-Key", generate_key())
                .header("Sec-WebSocket-Version", "13")
                .header("Ocp-Apim-Subscription-Key", &subscription_key)
                .body(())
            {
                Ok(request) => request,
                Err(e) => {
                    error!("failed to build websocket request: {e}");
                    return;
                }
            };

            let (ws_stream, _response) = match connect_async(request).await {
                Ok(result) => result,
                Err(e) => {
                    error!("failed to connect to recognition endpoint: {e}");
                    return;
                }
            };

            info!("connected to recognition websocket");
            let (mut ws_sink, mut ws_stream) = ws_stream.split();
            let mut connected_tx = Some(connected_tx);

            loop {
                tokio::select! {
                    Some(audio_data) = audio_rx.recv() => {
                        // Zero-copy: Bytes goes straight into the frame.
                        if let Err(e) = ws_sink.send(Message::Binary(audio_data)).await {
                            error!("failed to send audio frame: {e}");
                            is_connected.store(false, Ordering::Release);
                            break;
                        }
                    }

                    message = timeout(WS_MESSAGE_TIMEOUT, ws_stream.next()) => {
                        match message {
                            Ok(Some(Ok(msg))) => {
                                match Self::handle_websocket_message(
                                    msg,
                                    &event_tx,
                                    &mut connected_tx,
                                ).await {
                                    Ok(true) => {
                                        if connected_tx.is_none() {
                                            is_connected.store(true, Ordering::Release);
                                        }
                                    }
                                    Ok(false) => {
                                        is_connected.store(false, Ordering::Release);
                                        break;
                                    }
                                    Err(e) => {
                                        error!("recognition stream error: {e}");
                                        let _ = event_tx.send(EngineEvent::Canceled {
                                            reason: e.to_string(),
                                        }).await;
                                        is_connected.store(false, Ordering::Release);
                                        break;
                                    }
                                }
                            }
                            Ok(Some(Err(e))) => {
                                error!("websocket error: {e}");
                                let _ = event_tx.send(EngineEvent::Canceled {
                                    reason: format!("websocket error: {e}"),
                                }).await;
                                is_connected.store(false, Ordering::Release);
                                break;
                            }
                            Ok(None) => {
                                info!("websocket stream ended");
                                let _ = event_tx.send(EngineEvent::Canceled {
                                    reason: "connection closed unexpectedly".to_string(),
                                }).await;
                                is_connected.store(false, Ordering::Release);
                                break;
                            }
                            Err(_elapsed) => {
                                error!("websocket idle timeout, no message for 60 seconds");
                                let _ = event_tx.send(EngineEvent::Canceled {
                                    reason: "idle timeout".to_string(),
                                }).await;
                                is_connected.store(false, Ordering::Release);
                                break;
                            }
                        }
                    }

                    _ = &mut shutdown_rx => {
                        info!("shutting down recognition websocket");
                        if let Ok(json) = serde_json::to_string(&StopRecognitionMessage::default()) {
                            let _ = ws_sink.send(Message::Text(json.into())).await;
                        }
                        let _ = ws_sink.send(Message::Close(None)).await;
                        is_connected.store(false, Ordering::Release);
                        break;
                    }
                }
            }

            info!("recognition websocket connection closed");
        });

        self.connection_handle = Some(connection_handle);

        // Connected means the server confirmed the session, not just the
        // TCP/TLS handshake.
        match timeout(CONNECT_TIMEOUT, connected_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(EngineError::ConnectionFailed(
                "connection task exited before session started".to_string(),
            )),
            Err(_) => Err(EngineError::ConnectionFailed(
                "timeout waiting for session confirmation".to_string(),
            )),
        }
    }

    async fn shutdown(&mut self) {
        self.sink.close();
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.connection_handle.take() {
            // The task honors the shutdown signal promptly; don't let a
            // wedged socket stall the whole teardown.
            if timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("websocket task did not exit in time");
            }
        }
        self.is_connected.store(false, Ordering::Release);
    }
}

impl Drop for WsEngine {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

/// Builds a [`WsEngine`] per connection attempt from shared parameters.
pub struct WsEngineFactory {
    config: WsEngineConfig,
}

impl WsEngineFactory {
    pub fn new(config: WsEngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl EngineFactory for WsEngineFactory {
    async fn create(&self) -> Result<Box<dyn SpeechEngine>, EngineError> {
        Ok(Box::new(WsEngine::new(self.config.clone())))
    }
}
