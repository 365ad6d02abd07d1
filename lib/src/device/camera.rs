//! Capture-only device exposing a `FrameSource` through the buffer exchange
//! protocol.
//!
//! Buffers are allocated by the device (`Mmap`) and addressed by index.
//! Queued buffers are filled in the order they were queued: each successful
//! dequeue captures one frame from the source into the oldest queued buffer.
//! Once dequeued, a buffer belongs to the client until it queues it again.
use super::{
    monotonic_timestamp, BufferFlags, CanceledBuffer, Capabilities, Capability, DeviceError,
    DeviceResult, DqBuffer, QBuffer, QueryBuffer, QueueError, VideoDevice, DRIVER_VERSION,
};
use crate::capture::FrameSource;
use crate::lock;
use crate::memory::{MemoryType, Placement};
use crate::pool::{
    BufferHandle, BufferPool, ClaimError, CreatePoolError, DEFAULT_ALIGNMENT, MAX_BUFFER_COUNT,
    MIN_BUFFER_COUNT,
};
use crate::{Format, PixelFormat, QueueDirection};

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

pub const CAMERA_DRIVER: &str = "vidbuf_cam";
pub const CAMERA_BUS_INFO: &str = "CSI-MIPI";
/// Largest number of buffers a client may request. The pool limits apply on
/// top of it.
pub const MAX_CAMERA_BUFFERS: usize = 8;

const FORMATS: [PixelFormat; 2] = [PixelFormat::RGB565, PixelFormat::SBGGR8];
/// Interval at which the source is polled while waiting for a frame.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Counters of a `CameraDevice`, reset every time streaming starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CameraStats {
    /// Frames delivered to the client.
    pub frames: u32,
    /// Dequeue attempts made while no buffer was queued.
    pub drops: u32,
    pub dqbuf_calls: u32,
    /// Sequence number of the source's last delivered frame.
    pub last_sequence: u32,
}

struct CameraState<S: FrameSource> {
    source: S,
    card: String,
    initialized: bool,
    format: Format,
    pool: Option<BufferPool>,
    queue_order: VecDeque<usize>,
    streaming: bool,
    stats: CameraStats,
}

impl<S: FrameSource> CameraState<S> {
    fn cancel_queued(&mut self) -> Vec<CanceledBuffer> {
        let pool = self.pool.as_ref();
        self.queue_order
            .drain(..)
            .map(|index| {
                if let Some(handle) = pool.and_then(|p| p.buffer(index)) {
                    handle.release();
                }
                CanceledBuffer {
                    index,
                    memory: None,
                }
            })
            .collect()
    }

    fn stop_streaming(&mut self) -> Vec<CanceledBuffer> {
        let canceled = self.cancel_queued();
        if self.streaming {
            if self.source.is_streaming() {
                self.source.stop_streaming();
            }
            self.streaming = false;
            info!(
                "Streaming stopped (frames: {}, drops: {})",
                self.stats.frames, self.stats.drops
            );
        }
        canceled
    }

    /// Fill the oldest queued buffer with the current frame of the source.
    fn complete_frame(&mut self) -> DeviceResult<DqBuffer> {
        let index = *self.queue_order.front().ok_or(DeviceError::NoData)?;
        let handle = self
            .pool
            .as_ref()
            .and_then(|p| p.buffer(index))
            .ok_or(DeviceError::InvalidState)?;
        let Some(data) = self.source.image_data() else {
            warn!("Camera reported a frame without data");
            return Err(DeviceError::NoData);
        };

        let bytes_used = handle.write_clamped(data);
        self.queue_order.pop_front();
        if handle.mark_done().is_err() {
            return Err(DeviceError::InvalidState);
        }
        // The client owns the buffer until it queues it again.
        handle.release();

        let sequence = self.stats.frames;
        self.stats.frames = self.stats.frames.wrapping_add(1);
        self.stats.last_sequence = self.source.current_sequence();
        debug!(
            "Dequeued buffer {}: {} bytes (frame {}, {} still queued)",
            index,
            bytes_used,
            sequence,
            self.queue_order.len()
        );

        Ok(DqBuffer {
            index,
            bytes_used,
            flags: BufferFlags::DONE | BufferFlags::TIMESTAMP_MONOTONIC,
            sequence,
            timestamp: monotonic_timestamp(),
            memory: None,
        })
    }
}

/// Capture device backed by a `FrameSource`.
pub struct CameraDevice<S: FrameSource> {
    state: Mutex<CameraState<S>>,
}

impl<S: FrameSource> CameraDevice<S> {
    pub fn new(source: S, card: &str) -> Self {
        let format = Format {
            width: source.width(),
            height: source.height(),
            pixelformat: source.pixel_format(),
            ..Default::default()
        }
        .with_computed_layout();

        CameraDevice {
            state: Mutex::new(CameraState {
                source,
                card: card.into(),
                initialized: false,
                format,
                pool: None,
                queue_order: VecDeque::new(),
                streaming: false,
                stats: Default::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CameraState<S>> {
        lock(&self.state)
    }

    pub fn stats(&self) -> CameraStats {
        self.state().stats
    }
}

fn check_direction(direction: QueueDirection) -> DeviceResult<()> {
    match direction {
        QueueDirection::Capture => Ok(()),
        QueueDirection::Output => Err(DeviceError::InvalidArgument),
    }
}

impl<S: FrameSource> VideoDevice for CameraDevice<S> {
    fn init(&self) -> DeviceResult<()> {
        let mut state = self.state();
        if !state.initialized {
            info!(
                "Camera {}: {}x{} {}",
                state.card, state.format.width, state.format.height, state.format.pixelformat
            );
            state.initialized = true;
        }
        Ok(())
    }

    fn deinit(&self) -> DeviceResult<()> {
        let mut state = self.state();
        if !state.initialized {
            return Ok(());
        }
        state.stop_streaming();
        state.pool = None;
        state.initialized = false;
        Ok(())
    }

    fn query_capabilities(&self) -> Capability {
        Capability {
            driver: CAMERA_DRIVER.into(),
            card: self.state().card.clone(),
            bus_info: CAMERA_BUS_INFO.into(),
            version: DRIVER_VERSION,
            capabilities: Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING,
        }
    }

    fn enum_format(&self, direction: QueueDirection, index: usize) -> DeviceResult<PixelFormat> {
        check_direction(direction)?;
        FORMATS
            .get(index)
            .copied()
            .ok_or(DeviceError::InvalidArgument)
    }

    fn set_format(&self, direction: QueueDirection, format: &Format) -> DeviceResult<Format> {
        check_direction(direction)?;
        let mut state = self.state();
        if state.streaming || state.pool.is_some() {
            return Err(DeviceError::Busy);
        }

        let pixelformat = if FORMATS.contains(&format.pixelformat) {
            format.pixelformat
        } else {
            state.format.pixelformat
        };
        // The sensor resolution cannot be changed.
        state.format = Format {
            width: state.source.width(),
            height: state.source.height(),
            pixelformat,
            ..Default::default()
        }
        .with_computed_layout();

        Ok(state.format.clone())
    }

    fn get_format(&self, direction: QueueDirection) -> DeviceResult<Format> {
        check_direction(direction)?;
        Ok(self.state().format.clone())
    }

    fn request_buffers(
        &self,
        direction: QueueDirection,
        count: usize,
        memory: MemoryType,
    ) -> DeviceResult<usize> {
        check_direction(direction)?;
        if memory != MemoryType::Mmap {
            return Err(DeviceError::NotSupported);
        }
        let mut state = self.state();
        if state.streaming {
            return Err(DeviceError::InvalidState);
        }

        state.queue_order.clear();
        state.pool = None;
        if count == 0 {
            return Ok(0);
        }

        let count = count
            .min(MAX_CAMERA_BUFFERS)
            .clamp(MIN_BUFFER_COUNT, MAX_BUFFER_COUNT);
        let size = state.format.sizeimage as usize;
        let pool = BufferPool::new(
            count,
            size,
            DEFAULT_ALIGNMENT,
            Placement::Internal,
            MemoryType::Mmap,
        )
        .map_err(|e| match e {
            CreatePoolError::OutOfMemory { .. } => DeviceError::NoMemory,
            _ => DeviceError::InvalidArgument,
        })?;
        state.pool = Some(pool);

        debug!("Allocated {} buffers of {} bytes", count, size);
        Ok(count)
    }

    fn query_buffer(&self, direction: QueueDirection, index: usize) -> DeviceResult<QueryBuffer> {
        check_direction(direction)?;
        let state = self.state();
        let pool = state.pool.as_ref().ok_or(DeviceError::InvalidState)?;
        if index >= pool.len() {
            return Err(DeviceError::InvalidArgument);
        }

        let mut flags = BufferFlags::MAPPED;
        if state.queue_order.contains(&index) {
            flags |= BufferFlags::QUEUED;
        }
        Ok(QueryBuffer {
            index,
            memory: MemoryType::Mmap,
            length: pool.buffer_size(),
            offset: index,
            flags,
        })
    }

    fn map_buffer(&self, direction: QueueDirection, index: usize) -> DeviceResult<BufferHandle> {
        check_direction(direction)?;
        let state = self.state();
        let pool = state.pool.as_ref().ok_or(DeviceError::InvalidState)?;
        pool.buffer(index).ok_or(DeviceError::InvalidArgument)
    }

    fn enqueue(&self, direction: QueueDirection, buffer: QBuffer) -> Result<(), QueueError> {
        let mut state = self.state();

        let claimed = check_direction(direction).and_then(|_| {
            let pool = state.pool.as_ref().ok_or(DeviceError::InvalidState)?;
            let handle = pool.try_claim(buffer.index).map_err(|e| match e {
                ClaimError::InvalidIndex(_) => DeviceError::InvalidArgument,
                _ => DeviceError::Busy,
            })?;
            handle.mark_queued().map_err(|_| {
                handle.release();
                DeviceError::InvalidState
            })
        });
        if let Err(error) = claimed {
            return Err(QueueError { error, buffer });
        }

        state.queue_order.push_back(buffer.index);
        debug!(
            "Queued buffer {} ({} queued)",
            buffer.index,
            state.queue_order.len()
        );
        Ok(())
    }

    fn dequeue(
        &self,
        direction: QueueDirection,
        timeout: Option<Duration>,
    ) -> DeviceResult<DqBuffer> {
        check_direction(direction)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        {
            let mut state = self.state();
            if !state.streaming || state.pool.is_none() {
                return Err(DeviceError::InvalidState);
            }
            state.stats.dqbuf_calls = state.stats.dqbuf_calls.wrapping_add(1);
            if state.queue_order.is_empty() {
                state.stats.drops = state.stats.drops.wrapping_add(1);
                warn!(
                    "No queued buffer available (dropped frames: {})",
                    state.stats.drops
                );
                return Err(DeviceError::NoData);
            }
        }

        loop {
            {
                let mut state = self.state();
                if !state.streaming {
                    return Err(DeviceError::InvalidState);
                }
                if state.source.capture_frame() {
                    return state.complete_frame();
                }
            }

            match deadline {
                None => return Err(DeviceError::NoData),
                Some(deadline) if Instant::now() >= deadline => return Err(DeviceError::Timeout),
                Some(_) => thread::sleep(POLL_INTERVAL),
            }
        }
    }

    fn start(&self, direction: QueueDirection) -> DeviceResult<()> {
        check_direction(direction)?;
        let mut state = self.state();
        if state.streaming {
            return Ok(());
        }
        if !state.initialized || state.pool.is_none() {
            return Err(DeviceError::InvalidState);
        }
        if !state.source.is_streaming() {
            state.source.start_streaming().map_err(|e| {
                warn!("Failed to start camera streaming: {:#}", e);
                DeviceError::Io(nix::errno::Errno::EIO)
            })?;
        }

        state.stats = Default::default();
        state.streaming = true;
        info!(
            "Streaming started ({} buffers)",
            state.pool.as_ref().map(|p| p.len()).unwrap_or(0)
        );
        Ok(())
    }

    fn stop(&self, direction: QueueDirection) -> DeviceResult<Vec<CanceledBuffer>> {
        check_direction(direction)?;
        Ok(self.state().stop_streaming())
    }

    fn is_streaming(&self, direction: QueueDirection) -> bool {
        direction == QueueDirection::Capture && self.state().streaming
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferState;

    /// Source producing 2x2 RGB565 frames filled with the frame number,
    /// every other capture attempt.
    struct StubSource {
        streaming: bool,
        attempts: u32,
        sequence: u32,
        frame: Vec<u8>,
    }

    impl StubSource {
        fn new() -> Self {
            StubSource {
                streaming: false,
                attempts: 0,
                sequence: 0,
                frame: vec![0; 8],
            }
        }
    }

    impl FrameSource for StubSource {
        fn is_streaming(&self) -> bool {
            self.streaming
        }
        fn start_streaming(&mut self) -> anyhow::Result<()> {
            self.streaming = true;
            Ok(())
        }
        fn stop_streaming(&mut self) {
            self.streaming = false;
        }
        fn capture_frame(&mut self) -> bool {
            self.attempts += 1;
            if self.attempts % 2 == 1 {
                return false;
            }
            self.sequence += 1;
            self.frame = vec![self.sequence as u8; 8];
            true
        }
        fn image_data(&self) -> Option<&[u8]> {
            Some(&self.frame)
        }
        fn width(&self) -> u32 {
            2
        }
        fn height(&self) -> u32 {
            2
        }
        fn fps(&self) -> u32 {
            30
        }
        fn current_sequence(&self) -> u32 {
            self.sequence
        }
        fn acquire_frame(&mut self, since_sequence: u32) -> bool {
            self.capture_frame() || self.sequence > since_sequence
        }
        fn release_frame(&mut self) {}
    }

    fn setup(count: usize) -> CameraDevice<StubSource> {
        let device = CameraDevice::new(StubSource::new(), "stub");
        device.init().unwrap();
        assert_eq!(
            device
                .request_buffers(QueueDirection::Capture, count, MemoryType::Mmap)
                .unwrap(),
            count.clamp(MIN_BUFFER_COUNT, MAX_BUFFER_COUNT)
        );
        device
    }

    #[test]
    fn test_capabilities_and_formats() {
        let device = setup(2);
        let caps = device.query_capabilities();
        assert_eq!(caps.driver, "vidbuf_cam");
        assert_eq!(caps.bus_info, "CSI-MIPI");
        assert_eq!(caps.version, 0x0001_0000);
        assert_eq!(
            caps.capabilities,
            Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING
        );
        assert_eq!(
            device.enum_format(QueueDirection::Capture, 1),
            Ok(PixelFormat::SBGGR8)
        );
        assert_eq!(
            device.enum_format(QueueDirection::Output, 0),
            Err(DeviceError::InvalidArgument)
        );
        let format = device.get_format(QueueDirection::Capture).unwrap();
        assert_eq!(format.sizeimage, 8);
        // Buffers exist: the format cannot change anymore.
        assert_eq!(
            device.set_format(QueueDirection::Capture, &format),
            Err(DeviceError::Busy)
        );
    }

    #[test]
    fn test_buffer_count_is_clamped() {
        let device = setup(8);
        assert_eq!(
            device
                .request_buffers(QueueDirection::Capture, 1, MemoryType::Mmap)
                .unwrap(),
            MIN_BUFFER_COUNT
        );
        assert_eq!(
            device.request_buffers(QueueDirection::Capture, 2, MemoryType::UserPtr),
            Err(DeviceError::NotSupported)
        );
        assert_eq!(
            device
                .request_buffers(QueueDirection::Capture, 0, MemoryType::Mmap)
                .unwrap(),
            0
        );
        assert_eq!(
            device.query_buffer(QueueDirection::Capture, 0),
            Err(DeviceError::InvalidState)
        );
    }

    #[test]
    fn test_fifo_capture() {
        let device = setup(3);
        assert_eq!(
            device.dequeue(QueueDirection::Capture, None).unwrap_err(),
            DeviceError::InvalidState
        );
        device.start(QueueDirection::Capture).unwrap();

        // Nothing queued: the frame is dropped.
        assert_eq!(
            device.dequeue(QueueDirection::Capture, None).unwrap_err(),
            DeviceError::NoData
        );
        assert_eq!(device.stats().drops, 1);

        device
            .enqueue(QueueDirection::Capture, QBuffer::mmap(2, 0))
            .unwrap();
        device
            .enqueue(QueueDirection::Capture, QBuffer::mmap(0, 0))
            .unwrap();
        let err = device
            .enqueue(QueueDirection::Capture, QBuffer::mmap(0, 0))
            .unwrap_err();
        assert_eq!(err.error, DeviceError::Busy);
        let err = device
            .enqueue(QueueDirection::Capture, QBuffer::mmap(7, 0))
            .unwrap_err();
        assert_eq!(err.error, DeviceError::InvalidArgument);
        assert!(device
            .query_buffer(QueueDirection::Capture, 2)
            .unwrap()
            .flags
            .contains(BufferFlags::QUEUED));

        // The first attempt of the source fails, the second one succeeds.
        assert_eq!(
            device.dequeue(QueueDirection::Capture, None).unwrap_err(),
            DeviceError::NoData
        );
        let dq = device.dequeue(QueueDirection::Capture, None).unwrap();
        assert_eq!(dq.index, 2);
        assert_eq!(dq.sequence, 0);
        assert_eq!(dq.bytes_used, 8);
        assert_eq!(
            dq.flags,
            BufferFlags::DONE | BufferFlags::TIMESTAMP_MONOTONIC
        );
        let memory = device.map_buffer(QueueDirection::Capture, 2).unwrap();
        assert_eq!(&*memory.data(), &[1; 8]);
        assert_eq!(memory.state(), BufferState::Free);

        let dq = device
            .dequeue(QueueDirection::Capture, Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(dq.index, 0);
        assert_eq!(dq.sequence, 1);

        let stats = device.stats();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.last_sequence, 2);
        assert_eq!(stats.dqbuf_calls, 4);
    }

    #[test]
    fn test_stop_cancels_queued() {
        let device = setup(2);
        device.start(QueueDirection::Capture).unwrap();
        device.start(QueueDirection::Capture).unwrap();
        device
            .enqueue(QueueDirection::Capture, QBuffer::mmap(1, 0))
            .unwrap();

        let canceled = device.stop(QueueDirection::Capture).unwrap();
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].index, 1);
        assert!(device.stop(QueueDirection::Capture).unwrap().is_empty());
        assert!(!device.is_streaming(QueueDirection::Capture));
        // Canceled buffers can be queued again.
        device
            .enqueue(QueueDirection::Capture, QBuffer::mmap(1, 0))
            .unwrap();
        device.deinit().unwrap();
        device.deinit().unwrap();
    }
}
