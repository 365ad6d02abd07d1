//! This library implements zero-copy video buffer exchange between a camera
//! capture pipeline and one or more codec or display consumers:
//!
//! * The `pool` module owns fixed sets of equally-sized, aligned memory regions
//!   and enforces the ownership state machine of each buffer. Every other layer
//!   borrows buffers from a pool and must always give them back.
//!
//! * The `device` module defines the buffer exchange protocol spoken with a
//!   codec or capture device (format negotiation, enqueue/dequeue on two
//!   independent queues, streaming control) along with the adapters
//!   implementing it, and the registry through which devices are opened.
//!
//! * The `ioctl` module exposes the same protocol as command/argument pairs,
//!   for callers that need to speak the numeric vocabulary of the device
//!   control interface.
//!
//! * The `encoder` module builds synchronous "submit frame, get compressed
//!   frame" sessions on top of a device and two buffer pools.
//!
//! * The `capture` module is the top-level consumer: it pulls frames from a
//!   source, optionally transforms them, feeds encoders and publishes to a
//!   display surface at a fixed cadence.
//!
pub mod capture;
pub mod controls;
pub mod device;
pub mod encoder;
pub mod error;
pub mod ioctl;
pub mod memory;
pub mod pool;

use std::fmt;
use std::fmt::{Debug, Display};
use std::sync::{Mutex, MutexGuard, PoisonError};

use enumn::N;

/// Possible directions for a device queue.
///
/// `Output` queues carry data into the device (e.g. raw pixels into an
/// encoder), `Capture` queues carry data out of it (e.g. compressed bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, N)]
#[repr(u32)]
pub enum QueueDirection {
    Capture = 1,
    Output = 2,
}

impl QueueDirection {
    /// Returns the other queue of the same device.
    pub fn opposite(self) -> Self {
        match self {
            QueueDirection::Capture => QueueDirection::Output,
            QueueDirection::Output => QueueDirection::Capture,
        }
    }
}

impl Display for QueueDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// A Fourcc pixel format. It can be converted back and forth from a 32-bit
/// integer, or a 4-bytes string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PixelFormat(u32);

impl PixelFormat {
    /// 16-bit RGB, 5-6-5.
    pub const RGB565: PixelFormat = PixelFormat::from_fourcc(b"RGBP");
    /// 24-bit RGB, 8-8-8.
    pub const RGB24: PixelFormat = PixelFormat::from_fourcc(b"RGB3");
    /// Planar YUV 4:2:0 (I420).
    pub const YUV420: PixelFormat = PixelFormat::from_fourcc(b"YU12");
    /// 8-bit Bayer, BGGR order.
    pub const SBGGR8: PixelFormat = PixelFormat::from_fourcc(b"BA81");
    pub const JPEG: PixelFormat = PixelFormat::from_fourcc(b"JPEG");
    pub const H264: PixelFormat = PixelFormat::from_fourcc(b"H264");

    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub const fn to_fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Whether this format carries compressed data, in which case frames do
    /// not have a fixed size.
    pub fn is_compressed(self) -> bool {
        matches!(self, PixelFormat::JPEG | PixelFormat::H264)
    }

    /// Returns the size in bytes of a `width`x`height` frame, or `None` if the
    /// format is compressed or unknown.
    ///
    /// # Examples
    ///
    /// ```
    /// # use vidbuf::PixelFormat;
    /// assert_eq!(PixelFormat::RGB565.frame_size(640, 480), Some(640 * 480 * 2));
    /// assert_eq!(PixelFormat::YUV420.frame_size(4, 4), Some(24));
    /// assert_eq!(PixelFormat::JPEG.frame_size(640, 480), None);
    /// ```
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize).checked_mul(height as usize)?;
        match self {
            PixelFormat::RGB565 => pixels.checked_mul(2),
            PixelFormat::RGB24 => pixels.checked_mul(3),
            PixelFormat::YUV420 => {
                let chroma = (width as usize).div_ceil(2) * (height as usize).div_ceil(2);
                pixels.checked_add(chroma.checked_mul(2)?)
            }
            PixelFormat::SBGGR8 => Some(pixels),
            _ => None,
        }
    }

    /// Returns the number of bytes of one line of a `width` pixels wide frame,
    /// or 0 if this is not meaningful for this format.
    pub fn bytes_per_line(self, width: u32) -> u32 {
        match self {
            PixelFormat::RGB565 => width * 2,
            PixelFormat::RGB24 => width * 3,
            PixelFormat::YUV420 | PixelFormat::SBGGR8 => width,
            _ => 0,
        }
    }
}

/// Converts a Fourcc in 32-bit integer format into the matching pixel format.
///
/// # Examples
///
/// ```
/// # use vidbuf::PixelFormat;
/// // Fourcc representation of RGB565.
/// let rgbp = u32::from_le(0x50424752);
/// let f = PixelFormat::from(rgbp);
/// assert_eq!(f, PixelFormat::RGB565);
/// assert_eq!(u32::from(f), rgbp);
/// ```
impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

/// Simple way to convert a string litteral (e.g. b"JPEG") into a pixel
/// format.
///
/// # Examples
///
/// ```
/// # use vidbuf::PixelFormat;
/// let jpeg = b"JPEG";
/// let f = PixelFormat::from(jpeg);
/// assert_eq!(&<[u8; 4]>::from(f), jpeg);
/// ```
impl From<&[u8; 4]> for PixelFormat {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_fourcc(n)
    }
}

impl From<PixelFormat> for [u8; 4] {
    fn from(format: PixelFormat) -> Self {
        format.to_fourcc()
    }
}

/// Produces a debug string for this PixelFormat, including its hexadecimal
/// and string representation.
///
/// # Examples
///
/// ```
/// # use vidbuf::PixelFormat;
/// assert_eq!(format!("{:?}", PixelFormat::H264), "0x34363248 (H264)");
/// ```
impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self
            .0
            .to_le_bytes()
            .iter()
            .map(|&x| x as char)
            .collect::<String>();
        f.write_str(fourcc.as_str())
    }
}

/// Format of the frames going through one queue of a device.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Format {
    /// Width of the image in pixels.
    pub width: u32,
    /// Height of the image in pixels.
    pub height: u32,
    /// Format each pixel is encoded in.
    pub pixelformat: PixelFormat,
    /// Bytes per line of data. Only meaningful for raw formats.
    pub bytesperline: u32,
    /// Size of a frame; buffers of the queue must be at least that large. For
    /// compressed formats, this is an upper bound chosen by the device.
    pub sizeimage: u32,
}

impl Format {
    /// Fill `bytesperline` and `sizeimage` from the pixel format and
    /// resolution, if the format has a fixed frame size.
    pub fn with_computed_layout(mut self) -> Self {
        if let Some(size) = self.pixelformat.frame_size(self.width, self.height) {
            self.bytesperline = self.pixelformat.bytes_per_line(self.width);
            self.sizeimage = size as u32;
        }
        self
    }
}

/// Quickly build a usable `Format` from a pixel format and resolution.
///
/// # Examples
///
/// ```
/// # use vidbuf::Format;
/// let f = Format::from((b"RGBP", (640, 480)));
/// assert_eq!(f.width, 640);
/// assert_eq!(f.height, 480);
/// assert_eq!(f.pixelformat.to_string(), "RGBP");
/// assert_eq!(f.sizeimage, 0);
/// ```
impl<T: Into<PixelFormat>> From<(T, (usize, usize))> for Format {
    fn from((pixel_format, (width, height)): (T, (usize, usize))) -> Self {
        Format {
            width: width as u32,
            height: height as u32,
            pixelformat: pixel_format.into(),
            ..Default::default()
        }
    }
}

/// Lock `mutex`, recovering its data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_constants() {
        assert_eq!(PixelFormat::RGB565.to_fourcc(), *b"RGBP");
        assert_eq!(PixelFormat::JPEG.to_string(), "JPEG");
        assert!(PixelFormat::H264.is_compressed());
        assert!(!PixelFormat::RGB565.is_compressed());
    }

    #[test]
    fn test_format_layout() {
        let f = Format::from((PixelFormat::RGB565, (64, 48))).with_computed_layout();
        assert_eq!(f.bytesperline, 128);
        assert_eq!(f.sizeimage, 64 * 48 * 2);

        let f = Format::from((PixelFormat::JPEG, (64, 48))).with_computed_layout();
        assert_eq!(f.sizeimage, 0);
    }
}
