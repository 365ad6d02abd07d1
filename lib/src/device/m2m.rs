//! Memory-to-memory device core.
//!
//! `M2mDevice` implements the queue bookkeeping shared by all devices that
//! turn one `Output` buffer into one `Capture` buffer: format negotiation,
//! buffer allocation, queueing, streaming state and completion signaling.
//! The actual processing is delegated to a `FrameEngine`.
//!
//! A job runs as soon as both queues are streaming and each has a buffer
//! queued. Completed buffers are signaled through a condition variable, so a
//! dequeue with a timeout can wait for a job run from another thread.
use super::{
    monotonic_timestamp, BufferFlags, CanceledBuffer, Capabilities, Capability, DeviceError,
    DeviceResult, DqBuffer, QBuffer, QueryBuffer, QueueError, VideoDevice, DRIVER_VERSION,
};
use crate::controls::ControlId;
use crate::lock;
use crate::memory::MemoryType;
use crate::{Format, PixelFormat, QueueDirection};

use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Maximum number of buffers per queue.
pub const MAX_M2M_BUFFERS: usize = 8;

/// Kind of frame produced by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Self-contained frame.
    Key,
    /// Frame depending on previous ones.
    Delta,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported input format {0}")]
    UnsupportedFormat(PixelFormat),
    #[error("encoding failed: {0}")]
    Encode(String),
}

/// Processing block behind a memory-to-memory device.
pub trait FrameEngine: Send {
    /// Name of the driver, as reported in the device capabilities.
    fn driver(&self) -> &'static str;
    /// Name of the device, as reported in the device capabilities.
    fn card(&self) -> &'static str;
    /// Formats accepted on the `Output` queue. The first one is the default.
    fn output_formats(&self) -> &[PixelFormat];
    /// Formats produced on the `Capture` queue. The first one is the default.
    fn capture_formats(&self) -> &[PixelFormat];

    /// Pixel format of the `Capture` queue when `requested` is asked for
    /// while `output` is the format of the `Output` queue.
    fn capture_format_for(&self, requested: PixelFormat, _output: &Format) -> PixelFormat {
        let formats = self.capture_formats();
        if formats.contains(&requested) {
            requested
        } else {
            formats.first().copied().unwrap_or(requested)
        }
    }

    /// Size of the `Capture` buffers needed to hold a frame encoded from
    /// `output`.
    fn capture_size(&self, output: &Format) -> usize;

    /// Controls supported by the engine.
    fn controls(&self) -> &[ControlId] {
        &[]
    }
    fn get_control(&self, _id: ControlId) -> i32 {
        0
    }
    /// Apply a control. `value` has already been checked against the range
    /// of the control.
    fn set_control(&mut self, _id: ControlId, _value: i32) {}

    /// Process `input`, laid out as `format`, appending the result to
    /// `output`.
    fn process(
        &mut self,
        input: &[u8],
        format: &Format,
        output: &mut Vec<u8>,
    ) -> Result<FrameKind, EngineError>;

    /// Called when streaming stops, so the next frame starts a new stream.
    fn reset(&mut self) {}
}

#[derive(Default)]
struct QueueState {
    format: Format,
    memory: Option<MemoryType>,
    num_buffers: usize,
    streaming: bool,
    queued: VecDeque<QBuffer>,
    done: VecDeque<DqBuffer>,
}

impl QueueState {
    fn is_queued(&self, index: usize) -> bool {
        self.queued.iter().any(|b| b.index == index)
    }

    fn is_done(&self, index: usize) -> bool {
        self.done.iter().any(|b| b.index == index)
    }

    fn cancel_all(&mut self) -> Vec<CanceledBuffer> {
        self.queued
            .drain(..)
            .map(|b| CanceledBuffer {
                index: b.index,
                memory: b.memory,
            })
            .chain(self.done.drain(..).map(|b| CanceledBuffer {
                index: b.index,
                memory: b.memory,
            }))
            .collect()
    }
}

struct M2mState<E: FrameEngine> {
    engine: E,
    initialized: bool,
    output: QueueState,
    capture: QueueState,
    sequence: u32,
    scratch: Vec<u8>,
}

impl<E: FrameEngine> M2mState<E> {
    fn queue(&self, direction: QueueDirection) -> &QueueState {
        match direction {
            QueueDirection::Output => &self.output,
            QueueDirection::Capture => &self.capture,
        }
    }

    fn queue_mut(&mut self, direction: QueueDirection) -> &mut QueueState {
        match direction {
            QueueDirection::Output => &mut self.output,
            QueueDirection::Capture => &mut self.capture,
        }
    }

    /// Run jobs as long as both queues can provide a buffer. Returns whether
    /// any buffer completed.
    fn run_jobs(&mut self) -> bool {
        let mut completed = false;

        while self.output.streaming
            && self.capture.streaming
            && !self.output.queued.is_empty()
            && !self.capture.queued.is_empty()
        {
            let (Some(input), Some(output)) =
                (self.output.queued.pop_front(), self.capture.queued.pop_front())
            else {
                break;
            };
            self.run_job(input, output);
            completed = true;
        }

        completed
    }

    fn run_job(&mut self, input: QBuffer, output: QBuffer) {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        let timestamp = monotonic_timestamp();

        self.scratch.clear();
        let result = match &input.memory {
            Some(handle) => {
                let data = handle.data();
                self.engine
                    .process(&data, &self.output.format, &mut self.scratch)
            }
            None => Err(EngineError::Encode("input buffer has no memory".into())),
        };

        let (bytes_used, flags) = match (result, &output.memory) {
            (Ok(kind), Some(handle)) if self.scratch.len() <= handle.capacity() => {
                handle.data_mut()[..self.scratch.len()].copy_from_slice(&self.scratch);
                let len = handle.set_bytes_used(self.scratch.len());
                let kind_flag = match kind {
                    FrameKind::Key => BufferFlags::KEYFRAME,
                    FrameKind::Delta => BufferFlags::PFRAME,
                };
                (len, kind_flag)
            }
            (Ok(_), Some(handle)) => {
                warn!(
                    "Encoded frame {} ({} bytes) does not fit in capture buffer {} ({} bytes)",
                    sequence,
                    self.scratch.len(),
                    handle.index(),
                    handle.capacity()
                );
                handle.set_bytes_used(0);
                (0, BufferFlags::ERROR)
            }
            (Ok(_), None) => (0, BufferFlags::ERROR),
            (Err(e), _) => {
                warn!("Failed to process frame {}: {}", sequence, e);
                if let Some(handle) = &output.memory {
                    handle.set_bytes_used(0);
                }
                (0, BufferFlags::ERROR)
            }
        };

        debug!(
            "Frame {}: input buffer {} ({} bytes) -> capture buffer {} ({} bytes, {:?})",
            sequence, input.index, input.bytes_used, output.index, bytes_used, flags
        );

        let common = BufferFlags::DONE | BufferFlags::TIMESTAMP_MONOTONIC;
        self.output.done.push_back(DqBuffer {
            index: input.index,
            bytes_used: input.bytes_used,
            flags: common,
            sequence,
            timestamp,
            memory: input.memory,
        });
        self.capture.done.push_back(DqBuffer {
            index: output.index,
            bytes_used,
            flags: common | flags,
            sequence,
            timestamp,
            memory: output.memory,
        });
    }
}

/// A memory-to-memory device driving a `FrameEngine`.
pub struct M2mDevice<E: FrameEngine> {
    state: Mutex<M2mState<E>>,
    job_done: Condvar,
}

impl<E: FrameEngine> M2mDevice<E> {
    pub fn with_engine(engine: E) -> Self {
        let output = QueueState {
            format: Format {
                pixelformat: engine.output_formats().first().copied().unwrap_or_default(),
                ..Default::default()
            },
            ..Default::default()
        };
        let capture = QueueState {
            format: Format {
                pixelformat: engine.capture_formats().first().copied().unwrap_or_default(),
                ..Default::default()
            },
            ..Default::default()
        };

        M2mDevice {
            state: Mutex::new(M2mState {
                engine,
                initialized: false,
                output,
                capture,
                sequence: 0,
                scratch: Vec::new(),
            }),
            job_done: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, M2mState<E>> {
        lock(&self.state)
    }

    /// Number of jobs run since the device was created.
    pub fn frames_processed(&self) -> u32 {
        self.state().sequence
    }

    fn supported_control(&self, state: &M2mState<E>, id: u32) -> DeviceResult<ControlId> {
        ControlId::n(id)
            .filter(|id| state.engine.controls().contains(id))
            .ok_or(DeviceError::InvalidArgument)
    }
}

impl<E: FrameEngine> VideoDevice for M2mDevice<E> {
    fn init(&self) -> DeviceResult<()> {
        let mut state = self.state();
        if !state.initialized {
            debug!("Initializing {} device", state.engine.card());
            state.initialized = true;
        }
        Ok(())
    }

    fn deinit(&self) -> DeviceResult<()> {
        let mut state = self.state();
        if !state.initialized {
            return Ok(());
        }

        for direction in [QueueDirection::Capture, QueueDirection::Output] {
            let queue = state.queue_mut(direction);
            queue.streaming = false;
            let canceled = queue.cancel_all();
            if !canceled.is_empty() {
                debug!(
                    "Dropped {} {} buffers on deinit",
                    canceled.len(),
                    direction
                );
            }
            queue.num_buffers = 0;
            queue.memory = None;
        }
        state.engine.reset();
        state.initialized = false;
        debug!("Deinitialized {} device", state.engine.card());
        Ok(())
    }

    fn query_capabilities(&self) -> Capability {
        let state = self.state();
        Capability {
            driver: state.engine.driver().into(),
            card: state.engine.card().into(),
            bus_info: format!("platform:{}", state.engine.driver()),
            version: DRIVER_VERSION,
            capabilities: Capabilities::VIDEO_M2M | Capabilities::STREAMING,
        }
    }

    fn enum_format(&self, direction: QueueDirection, index: usize) -> DeviceResult<PixelFormat> {
        let state = self.state();
        let formats = match direction {
            QueueDirection::Output => state.engine.output_formats(),
            QueueDirection::Capture => state.engine.capture_formats(),
        };
        formats
            .get(index)
            .copied()
            .ok_or(DeviceError::InvalidArgument)
    }

    fn set_format(&self, direction: QueueDirection, format: &Format) -> DeviceResult<Format> {
        let mut state = self.state();
        if format.width == 0 || format.height == 0 {
            return Err(DeviceError::InvalidArgument);
        }
        let queue = state.queue(direction);
        if queue.streaming || queue.num_buffers > 0 {
            return Err(DeviceError::Busy);
        }

        match direction {
            QueueDirection::Output => {
                let formats = state.engine.output_formats();
                let pixelformat = if formats.contains(&format.pixelformat) {
                    format.pixelformat
                } else {
                    formats.first().copied().ok_or(DeviceError::NotSupported)?
                };
                let output = Format {
                    width: format.width,
                    height: format.height,
                    pixelformat,
                    ..Default::default()
                }
                .with_computed_layout();

                // The capture queue follows the resolution of the output queue.
                let capture_format = state
                    .engine
                    .capture_format_for(state.capture.format.pixelformat, &output);
                state.capture.format = Format {
                    width: output.width,
                    height: output.height,
                    pixelformat: capture_format,
                    bytesperline: 0,
                    sizeimage: state.engine.capture_size(&output) as u32,
                };
                state.output.format = output.clone();
                Ok(output)
            }
            QueueDirection::Capture => {
                let output = &state.output.format;
                let (width, height) = if output.width > 0 {
                    (output.width, output.height)
                } else {
                    (format.width, format.height)
                };
                let pixelformat = state.engine.capture_format_for(format.pixelformat, output);
                let sizing = Format {
                    width,
                    height,
                    pixelformat: output.pixelformat,
                    ..Default::default()
                }
                .with_computed_layout();
                let capture = Format {
                    width,
                    height,
                    pixelformat,
                    bytesperline: 0,
                    sizeimage: state.engine.capture_size(&sizing) as u32,
                };
                state.capture.format = capture.clone();
                Ok(capture)
            }
        }
    }

    fn get_format(&self, direction: QueueDirection) -> DeviceResult<Format> {
        Ok(self.state().queue(direction).format.clone())
    }

    fn request_buffers(
        &self,
        direction: QueueDirection,
        count: usize,
        memory: MemoryType,
    ) -> DeviceResult<usize> {
        let mut state = self.state();
        if memory != MemoryType::UserPtr {
            return Err(DeviceError::NotSupported);
        }
        let queue = state.queue_mut(direction);
        if queue.streaming {
            return Err(DeviceError::InvalidState);
        }
        if !queue.queued.is_empty() || !queue.done.is_empty() {
            return Err(DeviceError::Busy);
        }

        let count = count.min(MAX_M2M_BUFFERS);
        queue.num_buffers = count;
        queue.memory = if count > 0 { Some(memory) } else { None };
        debug!("Allocated {} {:?} buffers on {} queue", count, memory, direction);
        Ok(count)
    }

    fn query_buffer(&self, direction: QueueDirection, index: usize) -> DeviceResult<QueryBuffer> {
        let state = self.state();
        let queue = state.queue(direction);
        let memory = queue.memory.ok_or(DeviceError::InvalidState)?;
        if index >= queue.num_buffers {
            return Err(DeviceError::InvalidArgument);
        }

        let mut flags = BufferFlags::empty();
        if queue.is_queued(index) {
            flags |= BufferFlags::QUEUED;
        }
        if queue.is_done(index) {
            flags |= BufferFlags::DONE;
        }

        Ok(QueryBuffer {
            index,
            memory,
            length: queue.format.sizeimage as usize,
            offset: index,
            flags,
        })
    }

    fn enqueue(&self, direction: QueueDirection, mut buffer: QBuffer) -> Result<(), QueueError> {
        let mut state = self.state();

        let check = {
            let queue = state.queue(direction);
            match (&buffer.memory, queue.memory) {
                (_, None) => Err(DeviceError::InvalidState),
                (None, Some(_)) => Err(DeviceError::InvalidArgument),
                (Some(_), Some(_)) if buffer.index >= queue.num_buffers => {
                    Err(DeviceError::InvalidArgument)
                }
                (Some(_), Some(_)) if queue.is_queued(buffer.index) || queue.is_done(buffer.index) => {
                    Err(DeviceError::Busy)
                }
                (Some(handle), Some(_))
                    if direction == QueueDirection::Capture
                        && handle.capacity() < queue.format.sizeimage as usize =>
                {
                    debug!(
                        "Capture buffer {} ({} bytes) is smaller than the format size ({} bytes)",
                        buffer.index,
                        handle.capacity(),
                        queue.format.sizeimage
                    );
                    Ok(())
                }
                _ => Ok(()),
            }
        };
        if let Err(error) = check {
            return Err(QueueError { error, buffer });
        }

        if let (QueueDirection::Output, Some(handle)) = (direction, &buffer.memory) {
            buffer.bytes_used = handle.set_bytes_used(buffer.bytes_used);
        }
        state.queue_mut(direction).queued.push_back(buffer);

        if state.run_jobs() {
            self.job_done.notify_all();
        }
        Ok(())
    }

    fn dequeue(
        &self,
        direction: QueueDirection,
        timeout: Option<Duration>,
    ) -> DeviceResult<DqBuffer> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state();

        loop {
            let queue = state.queue_mut(direction);
            if let Some(buffer) = queue.done.pop_front() {
                return Ok(buffer);
            }
            if !queue.streaming {
                return Err(DeviceError::InvalidState);
            }

            let Some(deadline) = deadline else {
                return Err(DeviceError::NoData);
            };
            let now = Instant::now();
            if now >= deadline {
                warn!("Timed out waiting for a {} buffer", direction);
                return Err(DeviceError::Timeout);
            }
            state = self
                .job_done
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn start(&self, direction: QueueDirection) -> DeviceResult<()> {
        let mut state = self.state();
        if !state.initialized {
            return Err(DeviceError::InvalidState);
        }
        let queue = state.queue_mut(direction);
        if queue.streaming {
            return Ok(());
        }
        if queue.num_buffers == 0 {
            return Err(DeviceError::InvalidState);
        }
        queue.streaming = true;
        debug!("{} queue streaming", direction);

        if state.run_jobs() {
            self.job_done.notify_all();
        }
        Ok(())
    }

    fn stop(&self, direction: QueueDirection) -> DeviceResult<Vec<CanceledBuffer>> {
        let mut state = self.state();
        let queue = state.queue_mut(direction);
        let was_streaming = queue.streaming;
        queue.streaming = false;
        // Queued buffers are returned even if the queue was not streaming.
        let canceled = queue.cancel_all();
        if was_streaming {
            debug!(
                "{} queue stopped, {} buffers canceled",
                direction,
                canceled.len()
            );
            state.engine.reset();
            // Wake up waiters so they notice streaming stopped.
            self.job_done.notify_all();
        }
        Ok(canceled)
    }

    fn is_streaming(&self, direction: QueueDirection) -> bool {
        self.state().queue(direction).streaming
    }

    fn get_control(&self, id: u32) -> DeviceResult<i32> {
        let state = self.state();
        let id = self.supported_control(&state, id)?;
        Ok(state.engine.get_control(id))
    }

    fn set_control(&self, id: u32, value: i32) -> DeviceResult<()> {
        let mut state = self.state();
        let id = self.supported_control(&state, id)?;
        if !id.range().contains(&value) {
            return Err(DeviceError::OutOfRange);
        }
        debug!("Setting control {} to {}", id, value);
        state.engine.set_control(id, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Placement;
    use crate::pool::{BufferPool, DEFAULT_ALIGNMENT};

    /// Engine inverting every byte of its input.
    struct InvertEngine {
        resets: usize,
    }

    impl FrameEngine for InvertEngine {
        fn driver(&self) -> &'static str {
            "invert"
        }
        fn card(&self) -> &'static str {
            "Inverter"
        }
        fn output_formats(&self) -> &[PixelFormat] {
            &[PixelFormat::RGB565]
        }
        fn capture_formats(&self) -> &[PixelFormat] {
            &[PixelFormat::RGB565]
        }
        fn capture_size(&self, output: &Format) -> usize {
            output.sizeimage as usize
        }
        fn process(
            &mut self,
            input: &[u8],
            _format: &Format,
            output: &mut Vec<u8>,
        ) -> Result<FrameKind, EngineError> {
            output.extend(input.iter().map(|b| !b));
            Ok(FrameKind::Key)
        }
        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    fn pool(size: usize) -> BufferPool {
        BufferPool::new(
            2,
            size,
            DEFAULT_ALIGNMENT,
            Placement::External,
            MemoryType::UserPtr,
        )
        .unwrap()
    }

    fn setup() -> M2mDevice<InvertEngine> {
        let device = M2mDevice::with_engine(InvertEngine { resets: 0 });
        device.init().unwrap();
        device
            .set_format(
                QueueDirection::Output,
                &Format::from((PixelFormat::RGB565, (4, 2))),
            )
            .unwrap();
        for direction in [QueueDirection::Output, QueueDirection::Capture] {
            assert_eq!(
                device
                    .request_buffers(direction, 2, MemoryType::UserPtr)
                    .unwrap(),
                2
            );
        }
        device
    }

    #[test]
    fn test_format_negotiation() {
        let device = M2mDevice::with_engine(InvertEngine { resets: 0 });
        let format = device
            .set_format(
                QueueDirection::Output,
                &Format::from((PixelFormat::JPEG, (4, 2))),
            )
            .unwrap();
        // Unsupported formats are replaced by the default one.
        assert_eq!(format.pixelformat, PixelFormat::RGB565);
        assert_eq!(format.sizeimage, 16);
        let capture = device.get_format(QueueDirection::Capture).unwrap();
        assert_eq!((capture.width, capture.height), (4, 2));
        assert_eq!(capture.sizeimage, 16);

        assert_eq!(
            device.set_format(
                QueueDirection::Output,
                &Format::from((PixelFormat::RGB565, (0, 2)))
            ),
            Err(DeviceError::InvalidArgument)
        );
    }

    #[test]
    fn test_job_and_dequeue() {
        let device = setup();
        let input_pool = pool(16);
        let output_pool = pool(16);

        let input = input_pool.claim_free().unwrap();
        input.write_clamped(&[0x0f; 16]);
        device
            .enqueue(QueueDirection::Output, QBuffer::userptr(input.clone(), 16))
            .unwrap();
        let output = output_pool.claim_free().unwrap();
        device
            .enqueue(QueueDirection::Capture, QBuffer::userptr(output.clone(), 0))
            .unwrap();

        // Not streaming yet: nothing can be dequeued.
        assert_eq!(
            device.dequeue(QueueDirection::Capture, None).unwrap_err(),
            DeviceError::InvalidState
        );
        let queried = device.query_buffer(QueueDirection::Output, 0).unwrap();
        assert!(queried.flags.contains(BufferFlags::QUEUED));
        assert_eq!(queried.offset, 0);

        device.start(QueueDirection::Output).unwrap();
        device.start(QueueDirection::Output).unwrap();
        device.start(QueueDirection::Capture).unwrap();

        let dq = device.dequeue(QueueDirection::Capture, None).unwrap();
        assert_eq!(dq.index, 0);
        assert_eq!(dq.bytes_used, 16);
        assert!(dq.flags.contains(BufferFlags::DONE | BufferFlags::KEYFRAME));
        assert_eq!(&*output.data(), &[0xf0; 16]);

        let dq = device
            .dequeue(QueueDirection::Output, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(dq.index, 0);
        assert!(!dq.has_error());

        assert_eq!(
            device.dequeue(QueueDirection::Capture, None).unwrap_err(),
            DeviceError::NoData
        );
        assert_eq!(
            device
                .dequeue(QueueDirection::Capture, Some(Duration::from_millis(5)))
                .unwrap_err(),
            DeviceError::Timeout
        );
        assert_eq!(device.frames_processed(), 1);
    }

    #[test]
    fn test_enqueue_errors_return_buffer() {
        let device = M2mDevice::with_engine(InvertEngine { resets: 0 });
        let input_pool = pool(16);
        let input = input_pool.claim_free().unwrap();

        // No buffers requested yet.
        let err = device
            .enqueue(QueueDirection::Output, QBuffer::userptr(input.clone(), 16))
            .unwrap_err();
        assert_eq!(err.error, DeviceError::InvalidState);
        assert!(err.buffer.memory.unwrap().ptr_eq(&input));

        let device = setup();
        device
            .enqueue(QueueDirection::Output, QBuffer::userptr(input.clone(), 16))
            .unwrap();
        let err = device
            .enqueue(QueueDirection::Output, QBuffer::userptr(input.clone(), 16))
            .unwrap_err();
        assert_eq!(err.error, DeviceError::Busy);

        let err = device
            .enqueue(QueueDirection::Output, QBuffer::mmap(1, 16))
            .unwrap_err();
        assert_eq!(err.error, DeviceError::InvalidArgument);
    }

    #[test]
    fn test_overflow_is_flagged() {
        let device = setup();
        let input_pool = pool(16);
        let output_pool = pool(8);

        let input = input_pool.claim_free().unwrap();
        input.write_clamped(&[1; 16]);
        let output = output_pool.claim_free().unwrap();
        device.start(QueueDirection::Output).unwrap();
        device.start(QueueDirection::Capture).unwrap();
        device
            .enqueue(QueueDirection::Output, QBuffer::userptr(input, 16))
            .unwrap();
        device
            .enqueue(QueueDirection::Capture, QBuffer::userptr(output, 0))
            .unwrap();

        let dq = device.dequeue(QueueDirection::Capture, None).unwrap();
        assert!(dq.has_error());
        assert_eq!(dq.bytes_used, 0);
    }

    #[test]
    fn test_stop_cancels_buffers() {
        let device = setup();
        let input_pool = pool(16);
        let input = input_pool.claim_free().unwrap();
        device.start(QueueDirection::Output).unwrap();
        device
            .enqueue(QueueDirection::Output, QBuffer::userptr(input.clone(), 16))
            .unwrap();

        assert_eq!(
            device.request_buffers(QueueDirection::Output, 0, MemoryType::UserPtr),
            Err(DeviceError::InvalidState)
        );

        let canceled = device.stop(QueueDirection::Output).unwrap();
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].index, input.index());
        assert!(device.stop(QueueDirection::Output).unwrap().is_empty());
        assert!(!device.is_streaming(QueueDirection::Output));
        assert_eq!(device.state().engine.resets, 1);
    }

    #[test]
    fn test_deinit_is_idempotent() {
        let device = setup();
        device.start(QueueDirection::Capture).unwrap();
        device.deinit().unwrap();
        device.deinit().unwrap();
        assert!(!device.is_streaming(QueueDirection::Capture));
        assert_eq!(
            device.start(QueueDirection::Capture),
            Err(DeviceError::InvalidState)
        );
    }

    #[test]
    fn test_unsupported_controls() {
        let device = setup();
        assert_eq!(
            device.set_control(ControlId::VideoBitrate as u32, 1_000_000),
            Err(DeviceError::InvalidArgument)
        );
        assert_eq!(device.get_control(42), Err(DeviceError::InvalidArgument));
        let caps = device.query_capabilities();
        assert_eq!(caps.driver, "invert");
        assert!(caps.capabilities.contains(Capabilities::VIDEO_M2M));
    }
}
