//! JPEG encoder device.
use super::m2m::{EngineError, FrameEngine, FrameKind, M2mDevice};
use crate::controls::{clamp_quality, ControlId, DEFAULT_JPEG_QUALITY};
use crate::{Format, PixelFormat};

use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb};

/// Minimum size of the capture buffers. Headers and quantization tables
/// alone take several hundred bytes, which matters for tiny frames.
pub const MIN_JPEG_BUFFER_SIZE: usize = 16 * 1024;

const OUTPUT_FORMATS: [PixelFormat; 2] = [PixelFormat::RGB565, PixelFormat::RGB24];
const CAPTURE_FORMATS: [PixelFormat; 1] = [PixelFormat::JPEG];
const CONTROLS: [ControlId; 1] = [ControlId::JpegCompressionQuality];

/// Expand a little-endian RGB565 frame into packed RGB888. Pixels missing
/// from a short input are black.
pub(crate) fn rgb565_to_rgb888(input: &[u8], width: u32, height: u32) -> Vec<u8> {
    let num_pixels = width as usize * height as usize;
    let mut rgb = Vec::with_capacity(num_pixels * 3);

    for pixel in input.chunks_exact(2).take(num_pixels) {
        let v = u16::from_le_bytes([pixel[0], pixel[1]]);
        let r = ((v >> 11) & 0x1f) as u8;
        let g = ((v >> 5) & 0x3f) as u8;
        let b = (v & 0x1f) as u8;
        rgb.extend_from_slice(&[(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]);
    }
    rgb.resize(num_pixels * 3, 0);

    rgb
}

pub struct JpegEngine {
    quality: u8,
}

impl JpegEngine {
    pub fn new(quality: u8) -> Self {
        JpegEngine {
            quality: clamp_quality(quality as i32),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegEngine {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl FrameEngine for JpegEngine {
    fn driver(&self) -> &'static str {
        "vidbuf_jpeg"
    }

    fn card(&self) -> &'static str {
        "JPEG encoder"
    }

    fn output_formats(&self) -> &[PixelFormat] {
        &OUTPUT_FORMATS
    }

    fn capture_formats(&self) -> &[PixelFormat] {
        &CAPTURE_FORMATS
    }

    fn capture_size(&self, output: &Format) -> usize {
        (output.sizeimage as usize).max(MIN_JPEG_BUFFER_SIZE)
    }

    fn controls(&self) -> &[ControlId] {
        &CONTROLS
    }

    fn get_control(&self, id: ControlId) -> i32 {
        match id {
            ControlId::JpegCompressionQuality => self.quality as i32,
            _ => 0,
        }
    }

    fn set_control(&mut self, id: ControlId, value: i32) {
        if id == ControlId::JpegCompressionQuality {
            self.quality = clamp_quality(value);
        }
    }

    fn process(
        &mut self,
        input: &[u8],
        format: &Format,
        output: &mut Vec<u8>,
    ) -> Result<FrameKind, EngineError> {
        let (width, height) = (format.width, format.height);
        let rgb = match format.pixelformat {
            PixelFormat::RGB565 => rgb565_to_rgb888(input, width, height),
            PixelFormat::RGB24 => {
                let mut rgb = input.to_vec();
                rgb.resize(width as usize * height as usize * 3, 0);
                rgb
            }
            f => return Err(EngineError::UnsupportedFormat(f)),
        };

        let img = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, rgb)
            .ok_or_else(|| EngineError::Encode("invalid image dimensions".into()))?;
        let mut encoder = JpegEncoder::new_with_quality(output, self.quality);
        encoder
            .encode_image(&img)
            .map_err(|e| EngineError::Encode(e.to_string()))?;

        Ok(FrameKind::Key)
    }
}

/// JPEG encoder device: raw frames on the `Output` queue, JPEG images on the
/// `Capture` queue. Every frame is a keyframe.
pub type JpegDevice = M2mDevice<JpegEngine>;

impl M2mDevice<JpegEngine> {
    pub fn new() -> Self {
        Self::with_engine(JpegEngine::default())
    }
}

impl Default for M2mDevice<JpegEngine> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, VideoDevice};
    use crate::QueueDirection;

    fn frame(width: u32, height: u32) -> Vec<u8> {
        (0..width * height)
            .flat_map(|i| ((i * 37) as u16).to_le_bytes())
            .collect()
    }

    #[test]
    fn test_rgb565_expansion() {
        // Pure red, pure green, pure blue.
        let input = [0x00, 0xf8, 0xe0, 0x07, 0x1f, 0x00];
        let rgb = rgb565_to_rgb888(&input, 4, 1);
        assert_eq!(rgb, vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 0, 0, 0]);
    }

    #[test]
    fn test_encode_frame() {
        let mut engine = JpegEngine::default();
        let format = Format::from((PixelFormat::RGB565, (32, 16))).with_computed_layout();
        let mut out = Vec::new();

        let kind = engine.process(&frame(32, 16), &format, &mut out).unwrap();
        assert_eq!(kind, FrameKind::Key);
        assert_eq!(&out[..2], &[0xff, 0xd8]);
        assert_eq!(&out[out.len() - 2..], &[0xff, 0xd9]);
    }

    #[test]
    fn test_quality_affects_size() {
        let format = Format::from((PixelFormat::RGB565, (64, 64))).with_computed_layout();
        let input = frame(64, 64);

        let mut low = Vec::new();
        JpegEngine::new(5)
            .process(&input, &format, &mut low)
            .unwrap();
        let mut high = Vec::new();
        JpegEngine::new(100)
            .process(&input, &format, &mut high)
            .unwrap();
        assert!(low.len() < high.len());
    }

    #[test]
    fn test_unsupported_format() {
        let mut engine = JpegEngine::default();
        let format = Format::from((PixelFormat::SBGGR8, (8, 8))).with_computed_layout();
        assert!(matches!(
            engine.process(&[0; 64], &format, &mut Vec::new()),
            Err(EngineError::UnsupportedFormat(PixelFormat::SBGGR8))
        ));
    }

    #[test]
    fn test_quality_control() {
        let device = JpegDevice::new();
        let id = ControlId::JpegCompressionQuality as u32;
        assert_eq!(device.get_control(id), Ok(80));
        device.set_control(id, 42).unwrap();
        assert_eq!(device.get_control(id), Ok(42));
        assert_eq!(device.set_control(id, 0), Err(DeviceError::OutOfRange));
        assert_eq!(device.set_control(id, 101), Err(DeviceError::OutOfRange));
        assert_eq!(device.get_control(id), Ok(42));
    }

    #[test]
    fn test_formats() {
        let device = JpegDevice::new();
        assert_eq!(
            device.enum_format(QueueDirection::Output, 0),
            Ok(PixelFormat::RGB565)
        );
        assert_eq!(
            device.enum_format(QueueDirection::Output, 1),
            Ok(PixelFormat::RGB24)
        );
        assert_eq!(
            device.enum_format(QueueDirection::Output, 2),
            Err(DeviceError::InvalidArgument)
        );
        assert_eq!(
            device.enum_format(QueueDirection::Capture, 0),
            Ok(PixelFormat::JPEG)
        );

        let output = device
            .set_format(
                QueueDirection::Output,
                &Format::from((PixelFormat::RGB565, (320, 240))),
            )
            .unwrap();
        assert_eq!(output.sizeimage, 320 * 240 * 2);
        let capture = device
            .set_format(
                QueueDirection::Capture,
                &Format::from((PixelFormat::JPEG, (320, 240))),
            )
            .unwrap();
        assert_eq!(capture.pixelformat, PixelFormat::JPEG);
        assert_eq!(capture.sizeimage, 320 * 240 * 2);
        assert_eq!(device.query_capabilities().driver, "vidbuf_jpeg");
    }
}
