//! FFmpeg encoder and exporter
//!
//! Segment and single-pass writers pipe raw BGRA frames into an `ffmpeg`
//! child process. Merging and trimming run a second `ffmpeg` invocation
//! with a concat/trim filter graph.

use super::types::{ExportError, ExportRequest, MediaExporter, TrimRange};
use crate::capture::frame::VideoFrame;
use crate::recorder::encoder::{
    EncoderError, EncoderFactory, EncoderSettings, EncoderStatus, FinishOutcome, VideoEncoder,
};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Arguments for an encoder reading `input_width`x`input_height` BGRA on stdin
pub fn encoder_args(
    settings: &EncoderSettings,
    input_width: u32,
    input_height: u32,
    output: &Path,
) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "bgra".to_string(),
        "-s".to_string(),
        format!("{}x{}", input_width, input_height),
        "-r".to_string(),
        settings.fps.to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-vf".to_string(),
        format!("scale={}:{}", settings.width, settings.height),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Where a frame lands on the constant-rate output timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePacing {
    /// Copies of the previous frame needed to cover the gap before this one
    pub fill: u64,
    /// False when the frame falls on a slot that is already written
    pub write: bool,
}

/// Place a frame `elapsed` after the session start, given `written` output
/// frames so far. Dropped frames turn into repeats of the last written one
/// so the file keeps wall-clock duration.
pub fn pace_frame(written: u64, elapsed: Duration, fps: u32) -> FramePacing {
    let target = (elapsed.as_secs_f64() * f64::from(fps.max(1))).round() as u64;
    FramePacing {
        fill: target.saturating_sub(written),
        write: target >= written,
    }
}

/// One unit of work for the writer thread
struct PacedWrite {
    fill: u64,
    frame: Arc<Vec<u8>>,
}

struct EncoderInput {
    process: Child,
    frames: SyncSender<PacedWrite>,
    writer: JoinHandle<std::io::Result<u64>>,
    in_flight: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
    width: u32,
    height: u32,
    /// pts of the first frame
    origin: Duration,
    /// Output frames queued so far, fill included
    written: u64,
}

fn write_paced(
    stdin: &mut ChildStdin,
    previous: Option<&[u8]>,
    write: &PacedWrite,
) -> std::io::Result<u64> {
    let mut count = 0;
    if let Some(previous) = previous {
        for _ in 0..write.fill {
            stdin.write_all(previous)?;
            count += 1;
        }
    }
    stdin.write_all(&write.frame)?;
    Ok(count + 1)
}

fn drain_frames(
    mut stdin: ChildStdin,
    frames: Receiver<PacedWrite>,
    in_flight: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
) -> std::io::Result<u64> {
    let mut written = 0;
    let mut previous: Option<Arc<Vec<u8>>> = None;
    while let Ok(write) = frames.recv() {
        let result = write_paced(&mut stdin, previous.as_deref().map(Vec::as_slice), &write);
        in_flight.fetch_sub(1, Ordering::SeqCst);
        match result {
            Ok(count) => written += count,
            Err(error) => {
                broken.store(true, Ordering::SeqCst);
                return Err(error);
            }
        }
        previous = Some(write.frame);
    }
    // Dropping stdin signals EOF to FFmpeg.
    drop(stdin);
    Ok(written)
}

/// H.264 file encoder backed by an `ffmpeg` child process.
///
/// The process is spawned on the first frame. Frames are handed to a writer
/// thread through a bounded queue; the encoder reports itself not ready
/// while the queue is full. Output is paced by pts at the configured rate.
pub struct FfmpegEncoder {
    path: PathBuf,
    settings: EncoderSettings,
    status: EncoderStatus,
    input: Option<EncoderInput>,
}

impl FfmpegEncoder {
    pub fn new(path: PathBuf, settings: EncoderSettings) -> Self {
        Self {
            path,
            settings,
            status: EncoderStatus::Unknown,
            input: None,
        }
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn output_path(&self) -> &Path {
        &self.path
    }

    fn status(&self) -> EncoderStatus {
        match &self.input {
            Some(input) if input.broken.load(Ordering::SeqCst) => EncoderStatus::Failed,
            _ => self.status,
        }
    }

    fn start_writing(&mut self, frame: &VideoFrame) -> Result<(), EncoderError> {
        if self.status != EncoderStatus::Unknown {
            return Err(EncoderError::NotWritable(self.status));
        }

        let args = encoder_args(&self.settings, frame.width, frame.height, &self.path);
        tracing::debug!("Starting FFmpeg encoder: {:?}", args);

        let mut process = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EncoderError::Ffmpeg(format!("Failed to start FFmpeg encoder: {}", e)))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| EncoderError::Ffmpeg("Failed to capture FFmpeg stdin".to_string()))?;

        let depth = self.settings.queue_depth.max(1);
        let (frames, receiver) = sync_channel(depth);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let broken = Arc::new(AtomicBool::new(false));
        let writer = {
            let in_flight = in_flight.clone();
            let broken = broken.clone();
            std::thread::Builder::new()
                .name("encoder-writer".to_string())
                .spawn(move || drain_frames(stdin, receiver, in_flight, broken))?
        };

        self.input = Some(EncoderInput {
            process,
            frames,
            writer,
            in_flight,
            broken,
            width: frame.width,
            height: frame.height,
            origin: frame.pts,
            written: 0,
        });
        self.status = EncoderStatus::Writing;
        Ok(())
    }

    fn is_ready_for_more_data(&self) -> bool {
        match &self.input {
            Some(input) => {
                !input.broken.load(Ordering::SeqCst)
                    && input.in_flight.load(Ordering::SeqCst) < self.settings.queue_depth.max(1)
            }
            None => false,
        }
    }

    fn append(&mut self, frame: &VideoFrame) -> Result<(), EncoderError> {
        let input = self
            .input
            .as_mut()
            .ok_or(EncoderError::NotWritable(self.status))?;

        if frame.width != input.width || frame.height != input.height {
            return Err(EncoderError::FrameSize {
                width: frame.width,
                height: frame.height,
                expected_width: input.width,
                expected_height: input.height,
            });
        }

        let pacing = pace_frame(
            input.written,
            frame.pts.saturating_sub(input.origin),
            self.settings.fps,
        );
        if !pacing.write {
            tracing::trace!(pts = frame.pts_secs(), "Frame shares an output slot, skipped");
            return Ok(());
        }

        let write = PacedWrite {
            fill: pacing.fill,
            frame: frame.data.clone(),
        };
        input.in_flight.fetch_add(1, Ordering::SeqCst);
        match input.frames.try_send(write) {
            Ok(()) => {
                input.written += pacing.fill + 1;
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                input.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(EncoderError::Ffmpeg("Encoder queue full".to_string()))
            }
            Err(TrySendError::Disconnected(_)) => {
                input.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.status = EncoderStatus::Failed;
                Err(EncoderError::Ffmpeg("Encoder writer stopped".to_string()))
            }
        }
    }

    fn finish(mut self: Box<Self>) -> Result<FinishOutcome, EncoderError> {
        let input = match self.input.take() {
            Some(input) => input,
            None => return Ok(FinishOutcome::NotStarted),
        };

        drop(input.frames);
        let written = input
            .writer
            .join()
            .map_err(|_| EncoderError::Ffmpeg("Encoder writer panicked".to_string()))?;

        let output = input
            .process
            .wait_with_output()
            .map_err(|e| EncoderError::Ffmpeg(format!("Failed to wait for FFmpeg: {}", e)))?;

        if !output.status.success() {
            self.status = EncoderStatus::Failed;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EncoderError::Ffmpeg(format!(
                "FFmpeg exited with error: {}",
                stderr
            )));
        }

        let written = written?;
        self.status = EncoderStatus::Completed;
        tracing::info!(
            path = %self.path.display(),
            "FFmpeg encoder finished: {} frames written",
            written
        );
        Ok(FinishOutcome::Finished(self.path.clone()))
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        // Discarded without finishing.
        if let Some(input) = self.input.as_mut() {
            let _ = input.process.kill();
            let _ = input.process.wait();
        }
    }
}

/// Creates [`FfmpegEncoder`]s with shared output settings
pub struct FfmpegEncoderFactory {
    settings: EncoderSettings,
}

impl FfmpegEncoderFactory {
    pub fn new(settings: EncoderSettings) -> Self {
        Self { settings }
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn create(&self, output_path: &Path) -> Result<Box<dyn VideoEncoder>, EncoderError> {
        Ok(Box::new(FfmpegEncoder::new(
            output_path.to_path_buf(),
            self.settings,
        )))
    }
}

/// Build the filter graph: concat every input (video only), then trim
pub fn build_trim_filter(inputs: usize, range: &TrimRange) -> String {
    let trim = format!(
        "trim=start={:.3}:end={:.3},setpts=PTS-STARTPTS[vout]",
        range.start_secs(),
        range.end_secs()
    );

    if inputs <= 1 {
        return format!("[0:v]{}", trim);
    }

    let concat_inputs: String = (0..inputs).map(|i| format!("[{}:v]", i)).collect();
    format!(
        "{}concat=n={}:v=1:a=0[vcat];[vcat]{}",
        concat_inputs, inputs, trim
    )
}

/// Arguments for one export run
pub fn export_args(request: &ExportRequest) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-loglevel".to_string(), "error".to_string()];
    for source in &request.sources {
        args.push("-i".to_string());
        args.push(source.to_string_lossy().into_owned());
    }

    args.extend([
        "-filter_complex".to_string(),
        build_trim_filter(request.sources.len(), &request.range),
        "-map".to_string(),
        "[vout]".to_string(),
        "-an".to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        request.preset.h264_preset().to_string(),
        "-crf".to_string(),
        request.preset.crf().to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
    ]);

    if request.optimize_for_network {
        args.extend(["-movflags".to_string(), "+faststart".to_string()]);
    }

    args.push(request.output.to_string_lossy().into_owned());
    args
}

/// `ffprobe`/`ffmpeg` backed exporter
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegExporter;

#[async_trait]
impl MediaExporter for FfmpegExporter {
    async fn duration(&self, path: &Path) -> Result<Duration, ExportError> {
        let output = tokio::process::Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "csv=p=0",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| ExportError::Probe(format!("Failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExportError::Probe(format!("ffprobe failed: {}", stderr)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let seconds: f64 = stdout
            .trim()
            .parse()
            .map_err(|_| ExportError::Probe(format!("Unexpected ffprobe output: {}", stdout)))?;
        Duration::try_from_secs_f64(seconds)
            .map_err(|_| ExportError::Probe(format!("Invalid duration: {}", seconds)))
    }

    async fn export(&self, request: &ExportRequest) -> Result<(), ExportError> {
        if request.sources.is_empty() {
            return Err(ExportError::InvalidConfig("No export sources".to_string()));
        }

        let args = export_args(request);
        tracing::info!("Starting FFmpeg export: {:?}", args);

        let output = tokio::process::Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ExportError::Ffmpeg(format!("Failed to start FFmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExportError::Ffmpeg(format!(
                "FFmpeg exited with error: {}",
                stderr
            )));
        }
        Ok(())
    }
}
