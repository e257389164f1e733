//! Impact Companion - rolling capture with trigger-aligned clip delivery.
//!
//! The capture device keeps two alternating video segments on disk, and on
//! a remote command cuts the window around an externally supplied trigger
//! out of them and ships the clip to the paired peer. A throttled, JPEG
//! compressed preview feed runs alongside.

pub mod capture;
pub mod commands;
pub mod config;
pub mod export;
pub mod peer;
pub mod recorder;
pub mod utils;

#[doc(hidden)]
pub mod testing;

use anyhow::Context;
use capture::{spawn_capture_worker, spawn_preview_relay, CaptureFrameRouter, TestPatternSource};
use commands::RemoteCommand;
use config::CompanionConfig;
use export::{FfmpegEncoderFactory, FfmpegExporter};
use peer::{normalize_service_name, PeerEvent, PeerTransmissionChannel, WsPeerSession};
use recorder::{
    Clock, RecordController, RecordMode, RecorderCore, RecorderEvent, SegmentWriterPair,
    SinglePassWriter, SystemClock,
};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use utils::AppError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Frames waiting for the capture worker before late ones are discarded
const CAPTURE_QUEUE_DEPTH: usize = 4;

/// Frames waiting for preview compression
const PREVIEW_QUEUE_DEPTH: usize = 2;

/// Commands waiting behind one that is still running
const COMMAND_QUEUE_DEPTH: usize = 16;

/// Initialize the application
pub fn run() -> anyhow::Result<()> {
    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "impact_companion=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Impact Companion v{}", env!("CARGO_PKG_VERSION"));

    let config = CompanionConfig::load().context("Failed to load configuration")?;
    std::fs::create_dir_all(&config.documents_dir).with_context(|| {
        format!(
            "Failed to create documents directory {}",
            config.documents_dir.display()
        )
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;
    runtime.block_on(serve(config))
}

/// Wire the recorder to a WebSocket peer and a synthetic frame source, then run
/// until Ctrl-C.
pub async fn serve(config: CompanionConfig) -> anyhow::Result<()> {
    let service_name = normalize_service_name(&config.device_name);
    let (session, mut peer_events) = WsPeerSession::bind(&config.listen_addr, &service_name)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen_addr))?;
    let channel = PeerTransmissionChannel::new(Arc::new(session));

    let layout = config.layout();
    let factory = Arc::new(FfmpegEncoderFactory::new(config.encoder_settings()));
    let core = RecorderCore::new(
        RecordMode::default(),
        SegmentWriterPair::new(factory.clone(), layout.clone()),
        SinglePassWriter::new(factory, layout.single_pass_path()),
    )
    .into_shared();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (event_tx, _) = broadcast::channel(100);
    let controller = RecordController::new(
        core.clone(),
        clock.clone(),
        channel.clone(),
        Arc::new(FfmpegExporter),
        layout,
        event_tx.clone(),
    );
    let event_log = spawn_event_logger(controller.subscribe());
    controller.start_writer();

    let (preview_tx, preview_rx) = mpsc::channel(PREVIEW_QUEUE_DEPTH);
    let relay = spawn_preview_relay(preview_rx, channel.clone(), config.preview_settings());

    let router = CaptureFrameRouter::new(
        core,
        clock,
        channel.clone(),
        preview_tx,
        config.router_settings(),
        tokio::runtime::Handle::current(),
        event_tx,
    );
    let (capture, capture_thread) =
        spawn_capture_worker(router, CAPTURE_QUEUE_DEPTH).context("Failed to start capture worker")?;
    let mut source = TestPatternSource::new(config.video_width, config.video_height, config.capture_fps);
    source.start(capture).context("Failed to start frame source")?;

    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let command_task = spawn_command_queue(controller.clone(), command_rx);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            event = peer_events.recv() => match event {
                Some(PeerEvent::StateChanged { peer, state }) => {
                    controller.handle_peer_state(&peer, state);
                }
                Some(PeerEvent::Data { peer, bytes }) => {
                    if let Some(command) = channel.receive(&peer, &bytes) {
                        if !enqueue_command(&command_tx, command) {
                            break;
                        }
                    }
                }
                None => break,
            },
            _ = &mut shutdown => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    command_task.abort();
    controller.clear_writer();
    tokio::task::spawn_blocking(move || {
        source.stop();
        let _ = capture_thread.join();
    })
    .await
    .context("Failed to stop capture")?;
    relay.abort();
    event_log.abort();
    Ok(())
}

/// Hand a command to the queue without waiting. A full queue drops the
/// command; returns false once the queue is gone.
fn enqueue_command(queue: &mpsc::Sender<RemoteCommand>, command: RemoteCommand) -> bool {
    match queue.try_send(command) {
        Ok(()) => true,
        Err(TrySendError::Full(command)) => {
            tracing::warn!(?command, "Command queue full, dropping command");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Commands run one at a time, in arrival order. Waiting for a trigger
/// holds the queue; capture keeps running on its own thread.
fn spawn_command_queue(
    controller: RecordController,
    mut queue: mpsc::Receiver<RemoteCommand>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = queue.recv().await {
            match commands::execute(&controller, command).await {
                Ok(Some(pipeline)) => {
                    tokio::spawn(async move {
                        match pipeline.await {
                            Ok(outcome) => tracing::debug!(?outcome, "Stop pipeline finished"),
                            Err(error) => tracing::error!("Stop pipeline failed: {error}"),
                        }
                    });
                }
                Ok(None) => {}
                Err(error) => {
                    let error = AppError::from(error);
                    tracing::warn!(?command, code = error.code(), "Command rejected: {error}");
                }
            }
        }
    })
}

fn spawn_event_logger(mut events: broadcast::Receiver<RecorderEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RecorderEvent::RaiseFramerate) => {
                    tracing::info!("Peer asked for a higher framerate")
                }
                Ok(RecorderEvent::LowerFramerate) => {
                    tracing::info!("Peer asked for a lower framerate")
                }
                Ok(event) => tracing::info!(?event, "Recorder event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event logger lagged, {skipped} events skipped")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
