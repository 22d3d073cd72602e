use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use captionflow::core::engine::ws::WsEngineFactory;
use captionflow::{
    AppConfig, BackpressureBuffer, FlowSignal, ResilientSession, TranscriptRelay,
};

/// captionflow - live captioning from a raw PCM audio stream
#[derive(Parser, Debug)]
#[command(name = "captionflow")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Read audio from a file instead of stdin (raw PCM, s16le)
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = AppConfig::from_env().context("configuration error")?;
    info!(
        endpoint = %config.speech_endpoint,
        region = %config.speech_region,
        languages = %config.speech_languages.join(","),
        sample_rate = config.sample_rate,
        "starting captionflow"
    );

    let (buffer, flow_rx) = BackpressureBuffer::new(config.buffer.clone())?;
    let factory = Arc::new(WsEngineFactory::new(config.engine_config()));
    let (session, events) = ResilientSession::new(buffer.clone(), factory, config.backoff);
    let (relay, mut captions) = TranscriptRelay::new(events);

    let relay_handle = tokio::spawn(relay.run());
    let caption_handle = tokio::spawn(async move {
        while let Some(update) = captions.recv().await {
            if update.is_final {
                println!("{}", update.text);
            } else {
                eprintln!("... {}", update.text);
            }
        }
    });

    session.start()?;

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &cli.input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    // 100ms of audio per chunk.
    let chunk_bytes = (config.bytes_per_second() / 10).max(1);
    let pump_buffer = buffer.clone();
    let mut pump_handle =
        tokio::spawn(async move { pump_audio(reader, pump_buffer, flow_rx, chunk_bytes).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            pump_handle.abort();
        }
        result = &mut pump_handle => {
            match result {
                Ok(Ok(())) => info!("audio source ended"),
                Ok(Err(e)) => error!("audio source failed: {e}"),
                Err(e) => error!("audio pump task failed: {e}"),
            }
        }
    }

    session.stop().await;
    buffer.stop();
    relay_handle.abort();
    caption_handle.abort();

    let stats = buffer.stats();
    info!(
        sent_bytes = stats.sent_bytes,
        lost_bytes = stats.lost_bytes,
        queued_bytes = stats.queued_bytes,
        "shutdown complete"
    );
    Ok(())
}

/// Read fixed-size chunks from the source and push them into the buffer,
/// pausing whenever flow control asks for it.
async fn pump_audio(
    mut reader: Box<dyn AsyncRead + Unpin + Send>,
    buffer: Arc<BackpressureBuffer>,
    mut flow_rx: mpsc::UnboundedReceiver<FlowSignal>,
    chunk_bytes: usize,
) -> anyhow::Result<()> {
    let mut chunk = vec![0u8; chunk_bytes];
    let mut paused = false;

    loop {
        // Apply any pending flow signals, then block while paused.
        while let Ok(signal) = flow_rx.try_recv() {
            paused = signal == FlowSignal::High;
        }
        while paused {
            match flow_rx.recv().await {
                Some(signal) => paused = signal == FlowSignal::High,
                None => {
                    warn!("flow control channel closed, stopping intake");
                    return Ok(());
                }
            }
        }

        let n = reader.read(&mut chunk).await.context("audio read failed")?;
        if n == 0 {
            break;
        }
        buffer.push(Bytes::copy_from_slice(&chunk[..n]))?;
    }
    Ok(())
}
