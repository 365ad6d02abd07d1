//! Buffer exchange protocol spoken with video devices.
//!
//! A device exposes two independent queues, `Output` (data flowing into the
//! device) and `Capture` (data flowing out of it). Clients negotiate a format
//! on each queue, request buffers, then exchange them with `enqueue` and
//! `dequeue` once streaming has been started. The `VideoDevice` trait is this
//! contract; its implementors translate it into whatever the underlying block
//! requires:
//!
//! * `jpeg::JpegDevice` and `h264::H264Device` are memory-to-memory encoders,
//! * `passthrough::PassthroughDevice` copies frames from one queue to the other,
//! * `camera::CameraDevice` turns a `FrameSource` into a capture-only device.
//!
//! Devices are registered into and opened from a `registry::DeviceRegistry`.
pub mod camera;
pub mod h264;
pub mod jpeg;
pub mod m2m;
pub mod passthrough;
pub mod registry;

use crate::error::ErrorKind;
use crate::memory::MemoryType;
use crate::pool::BufferHandle;
use crate::{Format, PixelFormat, QueueDirection};

use bitflags::bitflags;
use nix::errno::Errno;
use nix::sys::time::TimeVal;
use nix::time::{clock_gettime, ClockId};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Version reported by the devices of this crate, as major/minor/patch bytes.
pub const DRIVER_VERSION: u32 = 0x0001_0000;

bitflags! {
    /// Flags describing the state and content of a buffer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        const MAPPED = 0x0000_0001;
        const QUEUED = 0x0000_0002;
        const DONE = 0x0000_0004;
        const KEYFRAME = 0x0000_0008;
        const PFRAME = 0x0000_0010;
        const BFRAME = 0x0000_0020;
        const ERROR = 0x0000_0040;
        const TIMESTAMP_MONOTONIC = 0x0000_2000;
        const LAST = 0x0010_0000;
    }
}

bitflags! {
    /// Capabilities reported by `VideoDevice::query_capabilities`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const VIDEO_CAPTURE = 0x0000_0001;
        const VIDEO_OUTPUT = 0x0000_0002;
        const VIDEO_M2M = 0x0000_8000;
        const READWRITE = 0x0100_0000;
        const STREAMING = 0x0400_0000;
        const DEVICE_CAPS = 0x8000_0000;
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identification and capabilities of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capability {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub version: u32,
    pub capabilities: Capabilities,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("value out of range")]
    OutOfRange,
    #[error("operation not allowed in the current state")]
    InvalidState,
    #[error("device or resource busy")]
    Busy,
    #[error("no buffer ready")]
    NoData,
    #[error("timed out waiting for the device")]
    Timeout,
    #[error("out of memory")]
    NoMemory,
    #[error("operation not supported")]
    NotSupported,
    #[error("no such device")]
    NoDevice,
    #[error("unexpected device error: {0}")]
    Io(Errno),
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::InvalidArgument | DeviceError::OutOfRange => ErrorKind::InvalidArgument,
            DeviceError::NoMemory => ErrorKind::ResourceExhausted,
            DeviceError::NoDevice => ErrorKind::Configuration,
            _ => ErrorKind::Device,
        }
    }
}

/// The errno mapping table of the device control boundary.
impl From<DeviceError> for Errno {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::InvalidArgument => Errno::EINVAL,
            DeviceError::OutOfRange => Errno::ERANGE,
            DeviceError::InvalidState | DeviceError::Busy => Errno::EBUSY,
            DeviceError::NoData => Errno::EAGAIN,
            DeviceError::Timeout => Errno::ETIMEDOUT,
            DeviceError::NoMemory => Errno::ENOMEM,
            DeviceError::NotSupported => Errno::ENOTTY,
            DeviceError::NoDevice => Errno::ENODEV,
            DeviceError::Io(e) => e,
        }
    }
}

impl From<Errno> for DeviceError {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EINVAL => DeviceError::InvalidArgument,
            Errno::ERANGE => DeviceError::OutOfRange,
            Errno::EBUSY => DeviceError::Busy,
            Errno::EAGAIN => DeviceError::NoData,
            Errno::ETIMEDOUT => DeviceError::Timeout,
            Errno::ENOMEM => DeviceError::NoMemory,
            Errno::ENOTTY => DeviceError::NotSupported,
            Errno::ENODEV => DeviceError::NoDevice,
            e => DeviceError::Io(e),
        }
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Static information about a buffer of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBuffer {
    pub index: usize,
    pub memory: MemoryType,
    /// Size of the buffer.
    pub length: usize,
    /// Cookie used to map MMAP buffers. Buffers are addressed by index, so
    /// this is the index of the buffer rather than a byte offset.
    pub offset: usize,
    pub flags: BufferFlags,
}

/// A buffer being handed to a device.
#[derive(Debug)]
pub struct QBuffer {
    pub index: usize,
    /// Amount of valid data, for `Output` buffers.
    pub bytes_used: usize,
    /// Client memory backing the buffer, for `UserPtr` queues.
    pub memory: Option<BufferHandle>,
}

impl QBuffer {
    /// Queue buffer `index` of a `Mmap` queue.
    pub fn mmap(index: usize, bytes_used: usize) -> Self {
        QBuffer {
            index,
            bytes_used,
            memory: None,
        }
    }

    /// Queue client buffer `handle` on a `UserPtr` queue. The buffer index on
    /// the device side is the index of the handle in its pool.
    pub fn userptr(handle: BufferHandle, bytes_used: usize) -> Self {
        QBuffer {
            index: handle.index(),
            bytes_used,
            memory: Some(handle),
        }
    }
}

/// Error returned when queueing a buffer fails. The buffer is given back to
/// the caller, which remains responsible for it.
#[derive(Debug, Error)]
#[error("failed to queue buffer {}: {error}", buffer.index)]
pub struct QueueError {
    pub error: DeviceError,
    pub buffer: QBuffer,
}

/// A buffer returned by the device after completion.
#[derive(Debug)]
pub struct DqBuffer {
    pub index: usize,
    pub bytes_used: usize,
    pub flags: BufferFlags,
    pub sequence: u32,
    pub timestamp: TimeVal,
    /// Client memory the buffer was queued with, for `UserPtr` queues.
    pub memory: Option<BufferHandle>,
}

impl DqBuffer {
    /// Whether the device reported that the content of the buffer is invalid.
    pub fn has_error(&self) -> bool {
        self.flags.contains(BufferFlags::ERROR)
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(BufferFlags::KEYFRAME)
    }
}

/// A buffer that was queued when streaming stopped, returned unprocessed.
#[derive(Debug)]
pub struct CanceledBuffer {
    pub index: usize,
    pub memory: Option<BufferHandle>,
}

/// Contract between clients and video devices.
///
/// Methods take `&self`: implementors synchronize internally, so a device can
/// be shared between the thread queueing buffers and the one dequeuing them.
pub trait VideoDevice: Send + Sync {
    /// Power up the device. Initializing an initialized device succeeds.
    fn init(&self) -> DeviceResult<()>;
    /// Stop both queues, free all buffers and power the device down.
    /// Deinitializing an uninitialized device succeeds.
    fn deinit(&self) -> DeviceResult<()>;

    fn query_capabilities(&self) -> Capability;

    /// Returns the `index`-th pixel format supported by the `direction` queue.
    fn enum_format(&self, direction: QueueDirection, index: usize) -> DeviceResult<PixelFormat>;
    /// Try to apply `format` to the `direction` queue. The device may adjust
    /// it; the format actually applied is returned.
    fn set_format(&self, direction: QueueDirection, format: &Format) -> DeviceResult<Format>;
    fn get_format(&self, direction: QueueDirection) -> DeviceResult<Format>;

    /// Allocate `count` buffers on the `direction` queue. The device may
    /// adjust the count; the number actually allocated is returned. A count of
    /// 0 frees the buffers of the queue.
    fn request_buffers(
        &self,
        direction: QueueDirection,
        count: usize,
        memory: MemoryType,
    ) -> DeviceResult<usize>;
    fn query_buffer(&self, direction: QueueDirection, index: usize) -> DeviceResult<QueryBuffer>;
    /// Give access to the memory of a `Mmap` buffer.
    fn map_buffer(&self, _direction: QueueDirection, _index: usize) -> DeviceResult<BufferHandle> {
        Err(DeviceError::NotSupported)
    }

    fn enqueue(&self, direction: QueueDirection, buffer: QBuffer) -> Result<(), QueueError>;
    /// Returns the next completed buffer of the `direction` queue. Without a
    /// timeout this does not block and fails with `NoData` if no buffer is
    /// ready; otherwise it waits at most `timeout` and fails with `Timeout`.
    fn dequeue(&self, direction: QueueDirection, timeout: Option<Duration>)
        -> DeviceResult<DqBuffer>;

    /// Start streaming on `direction`. Starting a started queue succeeds.
    fn start(&self, direction: QueueDirection) -> DeviceResult<()>;
    /// Stop streaming on `direction`, returning the buffers that were still
    /// queued. Stopping a stopped queue succeeds and still returns its queued
    /// buffers.
    fn stop(&self, direction: QueueDirection) -> DeviceResult<Vec<CanceledBuffer>>;
    fn is_streaming(&self, direction: QueueDirection) -> bool;

    fn get_control(&self, _id: u32) -> DeviceResult<i32> {
        Err(DeviceError::InvalidArgument)
    }
    fn set_control(&self, _id: u32, _value: i32) -> DeviceResult<()> {
        Err(DeviceError::InvalidArgument)
    }
}

/// Current time of the monotonic clock, used to timestamp completed buffers.
pub(crate) fn monotonic_timestamp() -> TimeVal {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => TimeVal::new(ts.tv_sec(), (ts.tv_nsec() / 1000) as _),
        Err(_) => TimeVal::new(0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let errors = [
            DeviceError::InvalidArgument,
            DeviceError::OutOfRange,
            DeviceError::Busy,
            DeviceError::NoData,
            DeviceError::Timeout,
            DeviceError::NoMemory,
            DeviceError::NotSupported,
            DeviceError::NoDevice,
            DeviceError::Io(Errno::EIO),
        ];
        for error in errors {
            assert_eq!(DeviceError::from(Errno::from(error)), error);
        }
        // Both are reported as busy to protocol clients.
        assert_eq!(Errno::from(DeviceError::InvalidState), Errno::EBUSY);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(DeviceError::NoData.kind(), ErrorKind::Device);
        assert_eq!(DeviceError::OutOfRange.kind(), ErrorKind::InvalidArgument);
        assert_eq!(DeviceError::NoDevice.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_monotonic_timestamp() {
        let a = monotonic_timestamp();
        let b = monotonic_timestamp();
        assert!(b >= a);
    }
}
