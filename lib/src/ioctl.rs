//! Command-code interface to the devices.
//!
//! Some clients address devices the way they would address a V4L2 node: with
//! a numeric command code and a structure serving as both input and output
//! of the command. This module maps such command/argument pairs onto the
//! `VideoDevice` trait:
//!
//! ```text
//! let mut arg = IoctlArg::Format { direction: QueueDirection::Output, format };
//! ioctl(&*device, Command::SFmt.request(), &mut arg)?;
//! ```
//!
//! Command codes can be given either as the full V4L2 request code (e.g.
//! `VIDIOC_S_FMT`) or as the bare command number. Failures are reported as
//! an `Errno`, following the mapping of `DeviceError`. As with a
//! non-blocking V4L2 node, `VIDIOC_DQBUF` returns `EAGAIN` when no buffer is
//! ready.
use crate::controls::Control;
use crate::device::{BufferFlags, Capability, QBuffer, VideoDevice};
use crate::memory::MemoryType;
use crate::pool::BufferHandle;
use crate::{Format, PixelFormat, QueueDirection};

use enumn::N;
use log::debug;
use nix::errno::Errno;
use nix::sys::time::TimeVal;
use nix::{request_code_read, request_code_readwrite, request_code_write};
use std::fmt;

// Sizes of the V4L2 structures on 64-bit targets, which are part of the
// request codes.
const CAPABILITY_SIZE: usize = 104;
const FMTDESC_SIZE: usize = 64;
const FORMAT_SIZE: usize = 208;
const REQUESTBUFFERS_SIZE: usize = 20;
const BUFFER_SIZE: usize = 88;
const INT_SIZE: usize = 4;
const CONTROL_SIZE: usize = 8;

/// Commands understood by `ioctl`, numbered like their V4L2 counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum Command {
    QueryCap = 0,
    EnumFmt = 2,
    GFmt = 4,
    SFmt = 5,
    ReqBufs = 8,
    QueryBuf = 9,
    QBuf = 15,
    DqBuf = 17,
    StreamOn = 18,
    StreamOff = 19,
    GCtrl = 27,
    SCtrl = 28,
}

impl Command {
    /// Full request code of the command, e.g. `VIDIOC_QUERYCAP`.
    pub fn request(self) -> u32 {
        let nr = self as u32;
        let code = match self {
            Command::QueryCap => request_code_read!(b'V', nr, CAPABILITY_SIZE),
            Command::EnumFmt => request_code_readwrite!(b'V', nr, FMTDESC_SIZE),
            Command::GFmt | Command::SFmt => request_code_readwrite!(b'V', nr, FORMAT_SIZE),
            Command::ReqBufs => request_code_readwrite!(b'V', nr, REQUESTBUFFERS_SIZE),
            Command::QueryBuf | Command::QBuf | Command::DqBuf => {
                request_code_readwrite!(b'V', nr, BUFFER_SIZE)
            }
            Command::StreamOn | Command::StreamOff => request_code_write!(b'V', nr, INT_SIZE),
            Command::GCtrl | Command::SCtrl => request_code_readwrite!(b'V', nr, CONTROL_SIZE),
        };
        code as u32
    }

    /// Identify the command of `request`, which can be a full request code or
    /// a bare command number.
    pub fn from_request(request: u32) -> Option<Self> {
        if (request >> 8) & 0xff == b'V' as u32 {
            Command::n(request & 0xff)
        } else {
            Command::n(request)
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::QueryCap => "VIDIOC_QUERYCAP",
            Command::EnumFmt => "VIDIOC_ENUM_FMT",
            Command::GFmt => "VIDIOC_G_FMT",
            Command::SFmt => "VIDIOC_S_FMT",
            Command::ReqBufs => "VIDIOC_REQBUFS",
            Command::QueryBuf => "VIDIOC_QUERYBUF",
            Command::QBuf => "VIDIOC_QBUF",
            Command::DqBuf => "VIDIOC_DQBUF",
            Command::StreamOn => "VIDIOC_STREAMON",
            Command::StreamOff => "VIDIOC_STREAMOFF",
            Command::GCtrl => "VIDIOC_G_CTRL",
            Command::SCtrl => "VIDIOC_S_CTRL",
        };
        f.write_str(name)
    }
}

/// Equivalent of `struct v4l2_buffer`.
#[derive(Debug)]
pub struct BufferArg {
    pub direction: QueueDirection,
    pub index: usize,
    pub memory: MemoryType,
    pub bytes_used: usize,
    pub length: usize,
    pub offset: usize,
    pub flags: BufferFlags,
    pub sequence: u32,
    pub timestamp: TimeVal,
    /// Client memory, for `UserPtr` buffers. Taken by `VIDIOC_QBUF` and
    /// given back by `VIDIOC_DQBUF`, or by `VIDIOC_QBUF` if it fails.
    pub userptr: Option<BufferHandle>,
}

impl BufferArg {
    pub fn new(direction: QueueDirection, memory: MemoryType, index: usize) -> Self {
        BufferArg {
            direction,
            index,
            memory,
            bytes_used: 0,
            length: 0,
            offset: 0,
            flags: BufferFlags::empty(),
            sequence: 0,
            timestamp: TimeVal::new(0, 0),
            userptr: None,
        }
    }

    /// Argument to queue client buffer `handle` with `bytes_used` bytes of
    /// valid data.
    pub fn userptr(direction: QueueDirection, handle: BufferHandle, bytes_used: usize) -> Self {
        BufferArg {
            bytes_used,
            length: handle.capacity(),
            userptr: Some(handle.clone()),
            ..Self::new(direction, MemoryType::UserPtr, handle.index())
        }
    }
}

/// Argument of a command.
#[derive(Debug)]
pub enum IoctlArg {
    /// `VIDIOC_QUERYCAP`
    Capability(Capability),
    /// `VIDIOC_ENUM_FMT`
    FmtDesc {
        direction: QueueDirection,
        index: usize,
        pixelformat: PixelFormat,
    },
    /// `VIDIOC_G_FMT`, `VIDIOC_S_FMT`
    Format {
        direction: QueueDirection,
        format: Format,
    },
    /// `VIDIOC_REQBUFS`
    RequestBuffers {
        direction: QueueDirection,
        count: usize,
        memory: MemoryType,
    },
    /// `VIDIOC_QUERYBUF`, `VIDIOC_QBUF`, `VIDIOC_DQBUF`
    Buffer(BufferArg),
    /// `VIDIOC_STREAMON`, `VIDIOC_STREAMOFF`
    StreamType(QueueDirection),
    /// `VIDIOC_G_CTRL`, `VIDIOC_S_CTRL`
    Control(Control),
}

/// Run the command `request` on `device`, with `arg` as input and output.
///
/// Returns `ENOTTY` if the command is unknown and `EINVAL` if `arg` is not
/// the argument type of the command.
pub fn ioctl(device: &dyn VideoDevice, request: u32, arg: &mut IoctlArg) -> Result<(), Errno> {
    let command = Command::from_request(request).ok_or(Errno::ENOTTY)?;
    debug!("{}", command);

    match (command, arg) {
        (Command::QueryCap, IoctlArg::Capability(cap)) => {
            *cap = device.query_capabilities();
        }
        (
            Command::EnumFmt,
            IoctlArg::FmtDesc {
                direction,
                index,
                pixelformat,
            },
        ) => {
            *pixelformat = device.enum_format(*direction, *index)?;
        }
        (Command::GFmt, IoctlArg::Format { direction, format }) => {
            *format = device.get_format(*direction)?;
        }
        (Command::SFmt, IoctlArg::Format { direction, format }) => {
            *format = device.set_format(*direction, format)?;
        }
        (
            Command::ReqBufs,
            IoctlArg::RequestBuffers {
                direction,
                count,
                memory,
            },
        ) => {
            *count = device.request_buffers(*direction, *count, *memory)?;
        }
        (Command::QueryBuf, IoctlArg::Buffer(buf)) => {
            let info = device.query_buffer(buf.direction, buf.index)?;
            buf.memory = info.memory;
            buf.length = info.length;
            buf.offset = info.offset;
            buf.flags = info.flags;
        }
        (Command::QBuf, IoctlArg::Buffer(buf)) => {
            let qbuf = QBuffer {
                index: buf.index,
                bytes_used: buf.bytes_used,
                memory: buf.userptr.take(),
            };
            if let Err(e) = device.enqueue(buf.direction, qbuf) {
                buf.userptr = e.buffer.memory;
                return Err(e.error.into());
            }
            buf.flags = BufferFlags::QUEUED;
        }
        (Command::DqBuf, IoctlArg::Buffer(buf)) => {
            let dq = device.dequeue(buf.direction, None)?;
            buf.index = dq.index;
            buf.bytes_used = dq.bytes_used;
            buf.flags = dq.flags;
            buf.sequence = dq.sequence;
            buf.timestamp = dq.timestamp;
            buf.userptr = dq.memory;
        }
        (Command::StreamOn, IoctlArg::StreamType(direction)) => {
            device.start(*direction)?;
        }
        (Command::StreamOff, IoctlArg::StreamType(direction)) => {
            let canceled = device.stop(*direction)?;
            if !canceled.is_empty() {
                debug!("{} buffers canceled by {}", canceled.len(), command);
            }
        }
        (Command::GCtrl, IoctlArg::Control(ctrl)) => {
            ctrl.value = device.get_control(ctrl.id)?;
        }
        (Command::SCtrl, IoctlArg::Control(ctrl)) => {
            device.set_control(ctrl.id, ctrl.value)?;
        }
        _ => return Err(Errno::EINVAL),
    }

    Ok(())
}
