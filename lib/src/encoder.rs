//! Synchronous encoding sessions.
//!
//! An `Encoder` owns an opened codec device and two buffer pools: one for the
//! raw frames submitted to the device (`Output` queue) and one for the
//! compressed frames it produces (`Capture` queue). `encode` submits one frame
//! and waits for its compressed counterpart, which is handed to the caller as
//! an `EncodedFrame` until released.
//!
//! The codec-specific parts (capture format, buffer sizing, controls and
//! keyframe cadence) are provided by a `Codec` implementation:
//!
//! ```no_run
//! use vidbuf::device::registry::{register_default_codecs, DeviceRegistry};
//! use vidbuf::encoder::{Jpeg, JpegEncoder, SessionConfig};
//!
//! let registry = DeviceRegistry::new();
//! register_default_codecs(&registry).unwrap();
//! let mut encoder = JpegEncoder::new(Jpeg::new(90), SessionConfig::new(640, 480));
//! encoder.init(&registry).unwrap();
//!
//! let frame = vec![0u8; 640 * 480 * 2];
//! let jpeg = encoder.encode(&frame).unwrap();
//! println!("{} bytes", jpeg.len());
//! encoder.release_output(jpeg).unwrap();
//! ```
pub mod h264;
pub mod jpeg;

pub use h264::H264;
pub use jpeg::Jpeg;

use crate::controls::{Control, ControlId};
use crate::device::registry::{device_path, DeviceRegistry, OpenDevice, RegistryError};
use crate::device::{DeviceError, QBuffer};
use crate::error::ErrorKind;
use crate::memory::{MemoryType, Placement};
use crate::pool::{
    BufferData, BufferGuard, BufferHandle, BufferPool, ClaimError, CreatePoolError,
    TransitionError, DEFAULT_ALIGNMENT,
};
use crate::{Format, PixelFormat, QueueDirection};

use log::{debug, error, info, warn};
use std::time::Duration;
use thiserror::Error;

/// Codec-specific behavior of an `Encoder`.
pub trait Codec: Send {
    /// Name of the codec, for logging.
    const NAME: &'static str;
    /// Format of the compressed frames.
    const CAPTURE_FORMAT: PixelFormat;
    /// Registry id of the device used when the configuration does not name
    /// one.
    const DEFAULT_DEVICE_ID: usize;

    /// Size of the buffers receiving the compressed frames of
    /// `width`x`height` frames in `input_format`.
    fn output_buffer_size(&self, width: u32, height: u32, input_format: PixelFormat) -> usize;
    /// Controls applied to the device when the session is initialized.
    fn initial_controls(&self) -> Vec<Control>;
    /// Whether frame number `frame_index` of the session is a keyframe.
    fn is_keyframe(&self, frame_index: u64) -> bool;
    /// Control to set on the device to make the next frame a keyframe.
    fn keyframe_control(&self) -> Option<ControlId> {
        None
    }
}

/// Parameters of an encoding session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    pub input_format: PixelFormat,
    pub fps: u32,
    pub num_input_buffers: usize,
    pub num_output_buffers: usize,
    pub alignment: usize,
    pub placement: Placement,
    /// Size of the output buffers. If `None`, the size is the largest of the
    /// codec's estimate and the size requested by the device.
    pub output_buffer_size: Option<usize>,
    /// How long to wait for the device to produce a frame.
    pub dequeue_timeout: Duration,
    /// Device to open. If `None`, the codec's default device is used.
    pub device_path: Option<String>,
    /// How long to wait for the device to be registered.
    pub open_timeout: Duration,
}

impl SessionConfig {
    pub fn new(width: u32, height: u32) -> Self {
        SessionConfig {
            width,
            height,
            input_format: PixelFormat::RGB565,
            fps: 30,
            num_input_buffers: 3,
            num_output_buffers: 3,
            alignment: DEFAULT_ALIGNMENT,
            placement: Placement::External,
            output_buffer_size: None,
            dequeue_timeout: Duration::from_secs(1),
            device_path: None,
            open_timeout: Duration::from_millis(3000),
        }
    }

    pub fn input_format(mut self, format: PixelFormat) -> Self {
        self.input_format = format;
        self
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn num_buffers(mut self, input: usize, output: usize) -> Self {
        self.num_input_buffers = input;
        self.num_output_buffers = output;
        self
    }

    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn output_buffer_size(mut self, size: usize) -> Self {
        self.output_buffer_size = Some(size);
        self
    }

    pub fn dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn device_path(mut self, path: &str) -> Self {
        self.device_path = Some(path.into());
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

#[derive(Debug, Error)]
pub enum EncoderInitError {
    #[error("invalid resolution {0}x{1}")]
    InvalidResolution(u32, u32),
    #[error("{0} is not a raw pixel format")]
    InvalidInputFormat(PixelFormat),
    #[error("cannot open device")]
    Open(#[from] RegistryError),
    #[error("cannot initialize device: {0}")]
    DeviceInit(DeviceError),
    #[error("cannot set format of {direction} queue: {error}")]
    SetFormat {
        direction: QueueDirection,
        error: DeviceError,
    },
    #[error("device selected format {got} instead of {requested} on {direction} queue")]
    FormatRejected {
        direction: QueueDirection,
        requested: PixelFormat,
        got: PixelFormat,
    },
    #[error("cannot create buffer pool")]
    CreatePool(#[from] CreatePoolError),
    #[error("cannot allocate buffers on {direction} queue: {error}")]
    RequestBuffers {
        direction: QueueDirection,
        error: DeviceError,
    },
    #[error("device allocated {got} buffers instead of {requested} on {direction} queue")]
    BufferCount {
        direction: QueueDirection,
        requested: usize,
        got: usize,
    },
}

impl EncoderInitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EncoderInitError::InvalidResolution(..) | EncoderInitError::InvalidInputFormat(_) => {
                ErrorKind::InvalidArgument
            }
            EncoderInitError::Open(e) => e.kind(),
            EncoderInitError::CreatePool(e) => e.kind(),
            _ => ErrorKind::Device,
        }
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("session is not initialized")]
    NotInitialized,
    #[error("cannot encode an empty frame")]
    EmptyFrame,
    #[error("no free input buffer")]
    NoInputBuffer(#[source] ClaimError),
    #[error("no free output buffer")]
    NoOutputBuffer(#[source] ClaimError),
    #[error("buffer state error")]
    Transition(#[from] TransitionError),
    #[error("cannot queue buffer on {direction} queue: {error}")]
    Queue {
        direction: QueueDirection,
        error: DeviceError,
    },
    #[error("cannot start streaming on {direction} queue: {error}")]
    StreamOn {
        direction: QueueDirection,
        error: DeviceError,
    },
    #[error("cannot dequeue encoded frame: {0}")]
    Dequeue(DeviceError),
    #[error("device returned unexpected buffer {0}")]
    UnexpectedBuffer(usize),
    #[error("encoded frame does not fit in a {0} bytes buffer")]
    OutputOverflow(usize),
    #[error("frame does not belong to this session")]
    ForeignFrame,
}

impl EncodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EncodeError::NotInitialized => ErrorKind::Configuration,
            EncodeError::EmptyFrame | EncodeError::ForeignFrame => ErrorKind::InvalidArgument,
            EncodeError::NoInputBuffer(e) | EncodeError::NoOutputBuffer(e) => e.kind(),
            _ => ErrorKind::Device,
        }
    }
}

/// A compressed frame. Its buffer stays reserved until the frame is released
/// with `Encoder::release_output` or dropped.
pub struct EncodedFrame {
    buffer: BufferGuard,
    len: usize,
    is_keyframe: bool,
    sequence: u32,
}

impl EncodedFrame {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_keyframe(&self) -> bool {
        self.is_keyframe
    }

    /// Sequence number assigned by the device.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn data(&self) -> BufferData<'_> {
        self.buffer.data()
    }

    pub fn buffer(&self) -> &BufferHandle {
        &self.buffer
    }
}

impl std::fmt::Debug for EncodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedFrame")
            .field("index", &self.buffer.index())
            .field("len", &self.len)
            .field("is_keyframe", &self.is_keyframe)
            .finish()
    }
}

struct Session {
    device: OpenDevice,
    input_pool: BufferPool,
    output_pool: BufferPool,
    streaming: bool,
}

impl Session {
    /// Stop both queues, which returns all queued buffers to us.
    fn stop_streaming(&mut self) {
        for direction in [QueueDirection::Capture, QueueDirection::Output] {
            if let Err(e) = self.device.stop(direction) {
                debug!("Ignoring error while stopping {} queue: {}", direction, e);
            }
        }
        self.streaming = false;
    }

    fn teardown(mut self) {
        self.stop_streaming();
        for direction in [QueueDirection::Capture, QueueDirection::Output] {
            let _ = self.device.request_buffers(direction, 0, MemoryType::UserPtr);
        }
        self.input_pool.destroy();
        self.output_pool.destroy();
        if let Err(e) = self.device.deinit() {
            warn!("Error while deinitializing {}: {}", self.device.path(), e);
        }
        // Dropping the device closes it.
    }
}

/// Encoding session driving a codec device.
pub struct Encoder<C: Codec> {
    codec: C,
    config: SessionConfig,
    session: Option<Session>,
    frame_count: u64,
}

pub type JpegEncoder = Encoder<Jpeg>;
pub type H264Encoder = Encoder<H264>;

impl<C: Codec> Encoder<C> {
    pub fn new(codec: C, config: SessionConfig) -> Self {
        Encoder {
            codec,
            config,
            session: None,
            frame_count: 0,
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    /// Number of frames submitted to the device so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn input_pool(&self) -> Option<&BufferPool> {
        self.session.as_ref().map(|s| &s.input_pool)
    }

    pub fn output_pool(&self) -> Option<&BufferPool> {
        self.session.as_ref().map(|s| &s.output_pool)
    }

    /// Open and configure the device, and allocate the buffers of the
    /// session. Initializing an initialized session does nothing.
    pub fn init(&mut self, registry: &DeviceRegistry) -> Result<(), EncoderInitError> {
        if self.session.is_some() {
            return Ok(());
        }

        let config = &self.config;
        if config.width == 0 || config.height == 0 {
            return Err(EncoderInitError::InvalidResolution(
                config.width,
                config.height,
            ));
        }
        let frame_size = config
            .input_format
            .frame_size(config.width, config.height)
            .ok_or(EncoderInitError::InvalidInputFormat(config.input_format))?;

        let path = config
            .device_path
            .clone()
            .unwrap_or_else(|| device_path(C::DEFAULT_DEVICE_ID));
        let device = registry.open_timeout(&path, config.open_timeout)?;
        device.init().map_err(EncoderInitError::DeviceInit)?;

        match self.configure(device, frame_size) {
            Ok(session) => {
                info!(
                    "{} encoder ready on {}: {}x{} {} @ {} fps, buffers {}x{} / {}x{} bytes",
                    C::NAME,
                    path,
                    self.config.width,
                    self.config.height,
                    self.config.input_format,
                    self.config.fps,
                    session.input_pool.len(),
                    session.input_pool.buffer_size(),
                    session.output_pool.len(),
                    session.output_pool.buffer_size(),
                );
                self.session = Some(session);
                Ok(())
            }
            Err((device, e)) => {
                error!("Failed to initialize {} encoder: {}", C::NAME, e);
                for direction in [QueueDirection::Capture, QueueDirection::Output] {
                    let _ = device.request_buffers(direction, 0, MemoryType::UserPtr);
                }
                let _ = device.deinit();
                Err(e)
            }
        }
    }

    /// Negotiate formats, allocate the buffers and apply the initial
    /// controls. On failure the device is given back for cleanup; the pools
    /// created so far are dropped.
    #[allow(clippy::result_large_err)]
    fn configure(
        &self,
        device: OpenDevice,
        frame_size: usize,
    ) -> Result<Session, (OpenDevice, EncoderInitError)> {
        macro_rules! tri {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(e) => return Err((device, e.into())),
                }
            };
        }

        let config = &self.config;
        let set_format = |direction: QueueDirection,
                          pixelformat: PixelFormat|
         -> Result<Format, EncoderInitError> {
            let requested = Format::from((
                pixelformat,
                (config.width as usize, config.height as usize),
            ));
            let format = device
                .set_format(direction, &requested)
                .map_err(|error| EncoderInitError::SetFormat { direction, error })?;
            if format.pixelformat != pixelformat {
                return Err(EncoderInitError::FormatRejected {
                    direction,
                    requested: pixelformat,
                    got: format.pixelformat,
                });
            }
            debug!("{} format: {:?}", direction, format);
            Ok(format)
        };
        let output_format = tri!(set_format(QueueDirection::Output, config.input_format));
        let capture_format = tri!(set_format(QueueDirection::Capture, C::CAPTURE_FORMAT));

        let input_size = frame_size.max(output_format.sizeimage as usize);
        let output_size = config.output_buffer_size.unwrap_or_else(|| {
            self.codec
                .output_buffer_size(config.width, config.height, config.input_format)
                .max(capture_format.sizeimage as usize)
        });
        let create_pool = |count, size| {
            BufferPool::new(
                count,
                size,
                config.alignment,
                config.placement,
                MemoryType::UserPtr,
            )
        };
        let input_pool = tri!(create_pool(config.num_input_buffers, input_size));
        let output_pool = tri!(create_pool(config.num_output_buffers, output_size));

        for (direction, requested) in [
            (QueueDirection::Output, input_pool.len()),
            (QueueDirection::Capture, output_pool.len()),
        ] {
            let got = tri!(device
                .request_buffers(direction, requested, MemoryType::UserPtr)
                .map_err(|error| EncoderInitError::RequestBuffers { direction, error }));
            if got < requested {
                let e = EncoderInitError::BufferCount {
                    direction,
                    requested,
                    got,
                };
                return Err((device, e));
            }
        }

        for control in self.codec.initial_controls() {
            if let Err(e) = device.set_control(control.id, control.value) {
                warn!(
                    "Failed to set control 0x{:08x} to {}: {}",
                    control.id, control.value, e
                );
            }
        }

        Ok(Session {
            device,
            input_pool,
            output_pool,
            streaming: false,
        })
    }

    /// Encode `src`, a raw frame in the input format of the session.
    ///
    /// Frames larger than the input buffers are truncated. On success the
    /// returned frame holds an output buffer, which must be given back with
    /// `release_output` (or by dropping the frame) for the session to keep
    /// encoding.
    pub fn encode(&mut self, src: &[u8]) -> Result<EncodedFrame, EncodeError> {
        let session = self.session.as_mut().ok_or(EncodeError::NotInitialized)?;
        if src.is_empty() {
            return Err(EncodeError::EmptyFrame);
        }

        let input = BufferGuard::new(
            session
                .input_pool
                .claim_free()
                .map_err(EncodeError::NoInputBuffer)?,
        );
        let len = input.write_clamped(src);
        if len < src.len() {
            warn!(
                "Frame of {} bytes truncated to the {} bytes of input buffer {}",
                src.len(),
                len,
                input.index()
            );
        }
        // Reserve the output buffer before anything is queued, so running out
        // of them leaves the device untouched.
        let output = BufferGuard::new(
            session
                .output_pool
                .claim_free()
                .map_err(EncodeError::NoOutputBuffer)?,
        );

        // Devices start each stream with a keyframe. Other keyframes must be
        // requested, and only count as such if the request went through.
        let restarting = !session.streaming;
        let mut is_keyframe = restarting || self.codec.is_keyframe(self.frame_count);
        if is_keyframe && !restarting {
            if let Some(id) = self.codec.keyframe_control() {
                if let Err(e) = session.device.set_control(id as u32, 1) {
                    warn!(
                        "Failed to request a keyframe, frame {} is not one: {}",
                        self.frame_count, e
                    );
                    is_keyframe = false;
                }
            }
        }

        let result = Self::submit(session, &input, &output, len);
        if let Err(e) = result {
            session.stop_streaming();
            return Err(e);
        }
        // The frame is submitted: it counts even if its completion fails.
        self.frame_count += 1;

        let timeout = self.config.dequeue_timeout;
        let dq = match session.device.dequeue(QueueDirection::Capture, Some(timeout)) {
            Ok(dq) => dq,
            Err(e) => {
                error!("Failed to dequeue encoded frame: {}", e);
                session.stop_streaming();
                return Err(EncodeError::Dequeue(e));
            }
        };

        match session.device.dequeue(QueueDirection::Output, Some(timeout)) {
            Ok(_) => {
                let _ = input.mark_done();
            }
            Err(e) => warn!("Failed to dequeue input buffer {}: {}", input.index(), e),
        }
        // Release the input buffer now that the device is done with it.
        input.disarm().release();

        if dq.index != output.index() {
            error!(
                "Device returned buffer {} instead of {}",
                dq.index,
                output.index()
            );
            session.stop_streaming();
            return Err(EncodeError::UnexpectedBuffer(dq.index));
        }
        output.mark_done()?;
        if dq.has_error() {
            warn!(
                "Frame {} overflowed output buffer {}",
                dq.sequence,
                output.index()
            );
            return Err(EncodeError::OutputOverflow(output.capacity()));
        }
        output.mark_active()?;

        debug!(
            "Encoded {} frame {} ({} bytes{})",
            C::NAME,
            dq.sequence,
            dq.bytes_used,
            if is_keyframe { ", keyframe" } else { "" }
        );

        Ok(EncodedFrame {
            buffer: output,
            len: dq.bytes_used,
            is_keyframe,
            sequence: dq.sequence,
        })
    }

    /// Queue `input` then `output`, then start streaming if needed.
    fn submit(
        session: &mut Session,
        input: &BufferHandle,
        output: &BufferHandle,
        len: usize,
    ) -> Result<(), EncodeError> {
        for (direction, buffer, bytes_used) in [
            (QueueDirection::Output, input, len),
            (QueueDirection::Capture, output, 0),
        ] {
            buffer.mark_queued()?;
            session
                .device
                .enqueue(direction, QBuffer::userptr(buffer.clone(), bytes_used))
                .map_err(|e| EncodeError::Queue {
                    direction,
                    error: e.error,
                })?;
        }

        if !session.streaming {
            for direction in [QueueDirection::Output, QueueDirection::Capture] {
                session
                    .device
                    .start(direction)
                    .map_err(|error| EncodeError::StreamOn { direction, error })?;
            }
            session.streaming = true;
        }

        Ok(())
    }

    /// Give back the buffer of a frame returned by `encode`.
    pub fn release_output(&self, frame: EncodedFrame) -> Result<(), EncodeError> {
        match &self.session {
            Some(session) if session.output_pool.owns(frame.buffer()) => {
                drop(frame);
                Ok(())
            }
            _ => Err(EncodeError::ForeignFrame),
        }
    }

    /// Stop streaming, free all buffers and close the device. Deinitializing
    /// an uninitialized session does nothing.
    pub fn deinit(&mut self) {
        if let Some(session) = self.session.take() {
            session.teardown();
            info!(
                "{} encoder stopped after {} frames",
                C::NAME,
                self.frame_count
            );
        }
    }

    /// Set `id` on the device if the session is initialized.
    fn push_control(&self, id: ControlId, value: i32) {
        if let Some(session) = &self.session {
            match session.device.set_control(id as u32, value) {
                Ok(()) => debug!("{} set to {}", id, value),
                Err(e) => warn!("Failed to set {} to {}: {}", id, value, e),
            }
        }
    }
}

impl<C: Codec> Drop for Encoder<C> {
    fn drop(&mut self) {
        self.deinit();
    }
}
