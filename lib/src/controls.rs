//! Scalar controls understood by the codec devices.
//!
//! Control IDs use the numeric values of the V4L2 control vocabulary so that
//! they can cross the `ioctl` boundary unchanged.
use enumn::N;
use std::fmt;
use std::ops::RangeInclusive;

/// Default JPEG compression quality.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;
/// Default H.264 target bitrate, in bits per second.
pub const DEFAULT_H264_BITRATE: u32 = 2_000_000;
/// Default H.264 keyframe interval, in frames.
pub const DEFAULT_H264_GOP_SIZE: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, N)]
#[repr(u32)]
pub enum ControlId {
    /// `V4L2_CID_MPEG_VIDEO_GOP_SIZE`
    VideoGopSize = 0x009909cb,
    /// `V4L2_CID_MPEG_VIDEO_BITRATE`
    VideoBitrate = 0x009909cf,
    /// `V4L2_CID_MPEG_VIDEO_FORCE_KEY_FRAME`
    ForceKeyFrame = 0x009909e5,
    /// `V4L2_CID_JPEG_COMPRESSION_QUALITY`
    JpegCompressionQuality = 0x009d0903,
}

impl ControlId {
    /// Range of values accepted by the control.
    pub fn range(self) -> RangeInclusive<i32> {
        match self {
            ControlId::VideoGopSize => 1..=300,
            ControlId::VideoBitrate => 100_000..=20_000_000,
            ControlId::ForceKeyFrame => 0..=1,
            ControlId::JpegCompressionQuality => 1..=100,
        }
    }

    /// Value of the control when a device is created.
    pub fn default_value(self) -> i32 {
        match self {
            ControlId::VideoGopSize => DEFAULT_H264_GOP_SIZE as i32,
            ControlId::VideoBitrate => DEFAULT_H264_BITRATE as i32,
            ControlId::ForceKeyFrame => 0,
            ControlId::JpegCompressionQuality => DEFAULT_JPEG_QUALITY as i32,
        }
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:08x})", self, *self as u32)
    }
}

/// A control and its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    pub id: u32,
    pub value: i32,
}

impl Control {
    pub fn new(id: ControlId, value: i32) -> Self {
        Control {
            id: id as u32,
            value,
        }
    }
}

/// Clamp a requested JPEG quality to the valid `1..=100` range.
pub fn clamp_quality(quality: i32) -> u8 {
    quality.clamp(1, 100) as u8
}

/// Keyframe interval actually applied for a requested GOP size: a GOP of 0
/// means every frame is a keyframe.
pub fn effective_gop_size(gop_size: u32) -> u32 {
    gop_size.max(1)
}
