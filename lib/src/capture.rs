//! Capture loop distributing camera frames to a display and to encoders.
//!
//! Each `tick` of a `CaptureLoop` pulls one frame from its `FrameSource` into a
//! buffer of the capture pool, optionally rotates or mirrors it, shows it on
//! the `DisplaySurface` and hands the same frame to every `FrameSink`. The
//! buffer being shown stays `Active` until the next frame replaces it.
//!
//! The source only makes new frames available, so every frame reaching the
//! display differs from the one it replaces.
pub mod transform;

use crate::encoder::{Codec, Encoder};
use crate::error::ErrorKind;
use crate::memory::{MemoryType, Placement};
use crate::pool::{BufferGuard, BufferHandle, BufferPool, CreatePoolError, DEFAULT_ALIGNMENT};
use crate::PixelFormat;

use transform::{GeometryTransform, Rotation, SoftwareTransform};

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A camera, or anything producing frames at its own pace.
pub trait FrameSource: Send {
    fn is_streaming(&self) -> bool;
    fn start_streaming(&mut self) -> anyhow::Result<()>;
    fn stop_streaming(&mut self) {}

    /// Try to make a new frame available through `image_data`. Returns
    /// `false` if no new frame is ready yet.
    fn capture_frame(&mut self) -> bool;
    /// Data of the last captured frame.
    fn image_data(&self) -> Option<&[u8]>;

    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::RGB565
    }
    fn fps(&self) -> u32;

    /// Sequence number of the last captured frame.
    fn current_sequence(&self) -> u32;
    /// Make a frame more recent than `since_sequence` available, and keep it
    /// until `release_frame` is called. Returns `false` if there is none.
    fn acquire_frame(&mut self, since_sequence: u32) -> bool;
    fn release_frame(&mut self);
}

/// Something frames can be shown on.
pub trait DisplaySurface: Send {
    /// Show the content of `buffer`. The buffer is kept unchanged until the
    /// next call.
    fn present(
        &mut self,
        buffer: &BufferHandle,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> anyhow::Result<()>;
}

/// Destination of compressed frames.
pub trait Transport: Send {
    fn send(&mut self, data: &[u8], is_keyframe: bool) -> anyhow::Result<()>;
}

/// Consumer of the captured frames.
pub trait FrameSink: Send {
    /// `frame` holds a `width`x`height` frame, after rotation and mirroring.
    fn consume(&mut self, frame: &BufferHandle, width: u32, height: u32) -> anyhow::Result<()>;
}

/// Encodes frames and sends the result to a transport.
pub struct EncoderSink<C: Codec, T: Transport> {
    encoder: Encoder<C>,
    transport: T,
    dropped: u64,
}

impl<C: Codec, T: Transport> EncoderSink<C, T> {
    /// `encoder` must be initialized.
    pub fn new(encoder: Encoder<C>, transport: T) -> Self {
        EncoderSink {
            encoder,
            transport,
            dropped: 0,
        }
    }

    pub fn encoder(&self) -> &Encoder<C> {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut Encoder<C> {
        &mut self.encoder
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Number of frames skipped because the encoder had no free buffer.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl<C: Codec, T: Transport> FrameSink for EncoderSink<C, T> {
    fn consume(&mut self, frame: &BufferHandle, width: u32, height: u32) -> anyhow::Result<()> {
        let config = self.encoder.config();
        if (width, height) != (config.width, config.height) {
            anyhow::bail!(
                "{}x{} frame given to a {}x{} {} encoder",
                width,
                height,
                config.width,
                config.height,
                C::NAME
            );
        }
        let encoded = match self.encoder.encode(&frame.data()) {
            Ok(encoded) => encoded,
            Err(e) if e.kind().is_recoverable() => {
                self.dropped += 1;
                debug!("Dropping frame: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let sent = self
            .transport
            .send(&encoded.data(), encoded.is_keyframe());
        self.encoder.release_output(encoded)?;
        sent
    }
}

/// Parameters of a `CaptureLoop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Minimum time between two frames.
    pub update_interval: Duration,
    pub num_buffers: usize,
    pub alignment: usize,
    pub placement: Placement,
    /// How long `setup` waits for the source to stream.
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub rotation: Rotation,
    pub mirror_x: bool,
    pub mirror_y: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            update_interval: Duration::from_millis(33),
            num_buffers: 3,
            alignment: DEFAULT_ALIGNMENT,
            placement: Placement::Internal,
            ready_timeout: Duration::from_millis(3000),
            ready_poll_interval: Duration::from_millis(100),
            rotation: Rotation::Deg0,
            mirror_x: false,
            mirror_y: false,
        }
    }
}

impl CaptureConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn num_buffers(mut self, num_buffers: usize) -> Self {
        self.num_buffers = num_buffers;
        self
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.ready_timeout = timeout;
        self.ready_poll_interval = poll_interval;
        self
    }

    pub fn rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn mirror(mut self, mirror_x: bool, mirror_y: bool) -> Self {
        self.mirror_x = mirror_x;
        self.mirror_y = mirror_y;
        self
    }
}

#[derive(Debug, Error)]
pub enum CaptureSetupError {
    #[error("no frame source")]
    NoFrameSource,
    #[error("frame source not streaming after {0:?}")]
    SourceNotReady(Duration),
    #[error("source frames have invalid dimensions {0}x{1}")]
    InvalidResolution(u32, u32),
    #[error("unsupported source format {0}")]
    UnsupportedFormat(PixelFormat),
    #[error("cannot create buffer pool")]
    CreatePool(#[from] CreatePoolError),
}

impl CaptureSetupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureSetupError::NoFrameSource | CaptureSetupError::UnsupportedFormat(_) => {
                ErrorKind::Configuration
            }
            CaptureSetupError::SourceNotReady(_) => ErrorKind::Device,
            CaptureSetupError::InvalidResolution(..) => ErrorKind::InvalidArgument,
            CaptureSetupError::CreatePool(e) => e.kind(),
        }
    }
}

/// What a call to `CaptureLoop::tick` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The loop is not set up, or its setup failed.
    Inactive,
    /// Called again before the update interval elapsed.
    Throttled,
    /// All capture buffers are in use.
    NoBuffer,
    /// The source had no new frame.
    NoFrame,
    /// A frame went through; its number since setup.
    Frame(u64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CaptureStats {
    pub frames: u64,
    /// Frame rate measured over the last 100 frames.
    pub fps: f32,
    pub no_buffer: u64,
    pub transform_errors: u64,
    pub display_errors: u64,
    pub sink_errors: u64,
}

struct Pipeline {
    width: u32,
    height: u32,
    format: PixelFormat,
    capture_pool: BufferPool,
    /// Transform and the pool receiving its results.
    transform: Option<(Box<dyn GeometryTransform>, BufferPool)>,
}

enum LoopState {
    Created,
    Ready(Pipeline),
    Failed,
}

/// A displayed frame, with the dimensions it was shown with.
struct Shown {
    buffer: BufferGuard,
    width: u32,
    height: u32,
}

pub struct CaptureLoop {
    config: CaptureConfig,
    source: Option<Box<dyn FrameSource>>,
    display: Option<Box<dyn DisplaySurface>>,
    transform: Option<Box<dyn GeometryTransform>>,
    sinks: Vec<Box<dyn FrameSink>>,
    state: LoopState,
    shown: Option<Shown>,
    last_update: Option<Instant>,
    last_fps_time: Option<Instant>,
    stats: CaptureStats,
}

impl CaptureLoop {
    pub fn new(config: CaptureConfig) -> Self {
        CaptureLoop {
            config,
            source: None,
            display: None,
            transform: None,
            sinks: Vec::new(),
            state: LoopState::Created,
            shown: None,
            last_update: None,
            last_fps_time: None,
            stats: Default::default(),
        }
    }

    pub fn with_source<S: FrameSource + 'static>(mut self, source: S) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_display<D: DisplaySurface + 'static>(mut self, display: D) -> Self {
        self.display = Some(Box::new(display));
        self
    }

    /// Use `transform` instead of the one described by the configuration.
    pub fn with_transform<T: GeometryTransform + 'static>(mut self, transform: T) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }

    pub fn add_sink<K: FrameSink + 'static>(&mut self, sink: K) {
        self.sinks.push(Box::new(sink));
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, LoopState::Ready(_))
    }

    pub fn has_failed(&self) -> bool {
        matches!(self.state, LoopState::Failed)
    }

    pub fn capture_pool(&self) -> Option<&BufferPool> {
        match &self.state {
            LoopState::Ready(pipeline) => Some(&pipeline.capture_pool),
            _ => None,
        }
    }

    pub fn transform_pool(&self) -> Option<&BufferPool> {
        match &self.state {
            LoopState::Ready(pipeline) => pipeline.transform.as_ref().map(|(_, pool)| pool),
            _ => None,
        }
    }

    /// The buffer currently shown, if any.
    pub fn shown_buffer(&self) -> Option<&BufferHandle> {
        self.shown.as_ref().map(|s| &*s.buffer)
    }

    /// Wait for the source to stream and allocate the buffers. On failure the
    /// loop is marked as failed and `tick` does nothing.
    pub fn setup(&mut self) -> Result<(), CaptureSetupError> {
        if self.is_ready() {
            return Ok(());
        }

        match self.build_pipeline() {
            Ok(pipeline) => {
                info!(
                    "Capture pipeline ready: {}x{} {}, {} buffers of {} bytes, transform {}, \
                     target {:.1} fps",
                    pipeline.width,
                    pipeline.height,
                    pipeline.format,
                    pipeline.capture_pool.len(),
                    pipeline.capture_pool.buffer_size(),
                    if pipeline.transform.is_some() {
                        "enabled"
                    } else {
                        "disabled"
                    },
                    1.0 / self.config.update_interval.as_secs_f32().max(0.001),
                );
                self.state = LoopState::Ready(pipeline);
                Ok(())
            }
            Err(e) => {
                error!("Capture setup failed: {}", e);
                self.state = LoopState::Failed;
                Err(e)
            }
        }
    }

    fn build_pipeline(&mut self) -> Result<Pipeline, CaptureSetupError> {
        let config = &self.config;
        let source = self
            .source
            .as_mut()
            .ok_or(CaptureSetupError::NoFrameSource)?;

        let start = Instant::now();
        while !source.is_streaming() {
            if let Err(e) = source.start_streaming() {
                debug!("Frame source not ready yet: {:#}", e);
            }
            if source.is_streaming() {
                break;
            }
            if start.elapsed() >= config.ready_timeout {
                return Err(CaptureSetupError::SourceNotReady(config.ready_timeout));
            }
            thread::sleep(config.ready_poll_interval);
        }
        debug!("Frame source streaming after {:?}", start.elapsed());

        let (width, height, format) = (source.width(), source.height(), source.pixel_format());
        if width == 0 || height == 0 {
            return Err(CaptureSetupError::InvalidResolution(width, height));
        }
        let frame_size = format
            .frame_size(width, height)
            .ok_or(CaptureSetupError::UnsupportedFormat(format))?;

        let capture_pool = BufferPool::new(
            config.num_buffers,
            frame_size,
            config.alignment,
            config.placement,
            MemoryType::Mmap,
        )?;

        let transform = match self.transform.take() {
            Some(transform) => Some(transform),
            None => {
                let software =
                    SoftwareTransform::new(config.rotation, config.mirror_x, config.mirror_y);
                if software.is_identity() {
                    None
                } else {
                    Some(Box::new(software) as Box<dyn GeometryTransform>)
                }
            }
        };
        let transform = match transform {
            Some(_) if format != PixelFormat::RGB565 => {
                return Err(CaptureSetupError::UnsupportedFormat(format))
            }
            Some(transform) => {
                let (out_w, out_h) = transform.output_size(width, height);
                let size = out_w as usize * out_h as usize * transform::BYTES_PER_PIXEL;
                let pool = BufferPool::new(
                    2,
                    size,
                    config.alignment,
                    config.placement,
                    MemoryType::UserPtr,
                )?;
                debug!("Transform output: {}x{} ({} bytes)", out_w, out_h, size);
                Some((transform, pool))
            }
            None => None,
        };

        Ok(Pipeline {
            width,
            height,
            format,
            capture_pool,
            transform,
        })
    }

    /// Run one cycle of the loop at time `now`.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let LoopState::Ready(pipeline) = &self.state else {
            return TickOutcome::Inactive;
        };
        let Some(source) = self.source.as_mut() else {
            return TickOutcome::Inactive;
        };

        if let Some(last) = self.last_update {
            if now.saturating_duration_since(last) < self.config.update_interval {
                return TickOutcome::Throttled;
            }
        }
        self.last_update = Some(now);

        let capture = match pipeline.capture_pool.claim_free() {
            Ok(buffer) => BufferGuard::new(buffer),
            Err(e) => {
                debug!("Skipping frame: {}", e);
                self.stats.no_buffer += 1;
                return TickOutcome::NoBuffer;
            }
        };
        if !source.capture_frame() {
            return TickOutcome::NoFrame;
        }
        let Some(data) = source.image_data() else {
            return TickOutcome::NoFrame;
        };
        let len = capture.write_clamped(data);
        if len < data.len() {
            warn!(
                "Frame of {} bytes truncated to {} bytes",
                data.len(),
                len
            );
        }
        if let Err(e) = capture.mark_active() {
            warn!("Skipping frame: {}", e);
            return TickOutcome::NoFrame;
        }

        let mut transformed = None;
        if let Some((transform, pool)) = &pipeline.transform {
            match pool.claim_free() {
                Ok(buffer) => {
                    let buffer = BufferGuard::new(buffer);
                    let result = transform.apply(
                        &capture.data(),
                        &mut buffer.data_mut(),
                        pipeline.width,
                        pipeline.height,
                    );
                    match result {
                        Ok(len) => {
                            buffer.set_bytes_used(len);
                            if buffer.mark_active().is_ok() {
                                let (w, h) = transform.output_size(pipeline.width, pipeline.height);
                                transformed = Some(Shown {
                                    buffer,
                                    width: w,
                                    height: h,
                                });
                            }
                        }
                        Err(e) => {
                            self.stats.transform_errors += 1;
                            warn!("Transform failed, showing raw frame: {}", e);
                        }
                    }
                }
                Err(e) => {
                    self.stats.transform_errors += 1;
                    warn!("No transform buffer, showing raw frame: {}", e);
                }
            }
        }

        let next = match transformed {
            Some(shown) => shown,
            None => Shown {
                buffer: capture,
                width: pipeline.width,
                height: pipeline.height,
            },
        };
        if let Some(display) = self.display.as_mut() {
            let shown = display.present(&next.buffer, next.width, next.height, pipeline.format);
            if let Err(e) = shown {
                self.stats.display_errors += 1;
                warn!("Display failed: {:#}", e);
            }
        }
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.consume(&next.buffer, next.width, next.height) {
                self.stats.sink_errors += 1;
                warn!("Frame sink failed: {:#}", e);
            }
        }
        // Dropping the previous frame releases its buffer.
        self.shown = Some(next);

        self.stats.frames += 1;
        if self.stats.frames % 100 == 0 {
            if let Some(last) = self.last_fps_time {
                let elapsed = now.saturating_duration_since(last).as_secs_f32();
                self.stats.fps = 100.0 / if elapsed > 0.0 { elapsed } else { 1.0 };
                info!(
                    "Capture: {:.2} fps, {} frames",
                    self.stats.fps, self.stats.frames
                );
            }
            self.last_fps_time = Some(now);
        }

        TickOutcome::Frame(self.stats.frames)
    }

    /// Tick until `stop` is set.
    pub fn run(&mut self, stop: &AtomicBool) {
        info!("Capture loop running");
        while !stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            let wait = match self.tick(now) {
                TickOutcome::Inactive => break,
                TickOutcome::Frame(_) | TickOutcome::Throttled => self
                    .last_update
                    .map(|last| (last + self.config.update_interval).saturating_duration_since(now))
                    .unwrap_or_default(),
                TickOutcome::NoBuffer | TickOutcome::NoFrame => Duration::ZERO,
            };
            thread::sleep(wait.max(Duration::from_millis(1)));
        }
        info!("Capture loop stopped after {} frames", self.stats.frames);
    }

    /// Release all buffers and stop the source. The loop must be set up again
    /// before being used.
    pub fn shutdown(&mut self) {
        self.shown = None;
        if matches!(
            std::mem::replace(&mut self.state, LoopState::Created),
            LoopState::Ready(_)
        ) {
            if let Some(source) = self.source.as_mut() {
                source.stop_streaming();
            }
            debug!("Capture pipeline shut down");
        }
        self.last_update = None;
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
