use super::{Codec, Encoder};
use crate::controls::{clamp_quality, Control, ControlId, DEFAULT_JPEG_QUALITY};
use crate::device::registry::JPEG_DEVICE_ID;
use crate::PixelFormat;

/// Baseline JPEG. Every frame is a keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jpeg {
    quality: u8,
}

impl Jpeg {
    /// `quality` is clamped to `1..=100`.
    pub fn new(quality: i32) -> Self {
        Jpeg {
            quality: clamp_quality(quality),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for Jpeg {
    fn default() -> Self {
        Jpeg {
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl Codec for Jpeg {
    const NAME: &'static str = "JPEG";
    const CAPTURE_FORMAT: PixelFormat = PixelFormat::JPEG;
    const DEFAULT_DEVICE_ID: usize = JPEG_DEVICE_ID;

    // A JPEG is not larger than the raw frame it comes from, save for
    // pathological inputs.
    fn output_buffer_size(&self, width: u32, height: u32, input_format: PixelFormat) -> usize {
        input_format
            .frame_size(width, height)
            .unwrap_or(width as usize * height as usize * 2)
    }

    fn initial_controls(&self) -> Vec<Control> {
        vec![Control::new(
            ControlId::JpegCompressionQuality,
            self.quality as i32,
        )]
    }

    fn is_keyframe(&self, _frame_index: u64) -> bool {
        true
    }
}

impl Encoder<Jpeg> {
    /// Change the compression quality, clamped to `1..=100`. Takes effect on
    /// the next frame if the session is running.
    pub fn set_quality(&mut self, quality: i32) {
        self.codec.quality = clamp_quality(quality);
        self.push_control(
            ControlId::JpegCompressionQuality,
            self.codec.quality as i32,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::registry::{register_default_codecs, DeviceRegistry};
    use crate::encoder::{JpegEncoder, SessionConfig};

    fn device_quality(encoder: &JpegEncoder) -> i32 {
        encoder
            .session
            .as_ref()
            .unwrap()
            .device
            .get_control(ControlId::JpegCompressionQuality as u32)
            .unwrap()
    }

    #[test]
    fn test_quality_clamp() {
        assert_eq!(Jpeg::new(0).quality(), 1);
        assert_eq!(Jpeg::new(255).quality(), 100);
        assert_eq!(Jpeg::new(75).quality(), 75);
        assert_eq!(Jpeg::default().quality(), DEFAULT_JPEG_QUALITY);
    }

    #[test]
    fn test_output_buffer_size() {
        let jpeg = Jpeg::default();
        assert_eq!(
            jpeg.output_buffer_size(640, 480, PixelFormat::RGB565),
            640 * 480 * 2
        );
        assert_eq!(
            jpeg.output_buffer_size(640, 480, PixelFormat::RGB24),
            640 * 480 * 3
        );
        assert!((0..100).all(|i| jpeg.is_keyframe(i)));
    }

    #[test]
    fn test_set_quality() {
        let registry = DeviceRegistry::new();
        register_default_codecs(&registry).unwrap();

        let mut encoder = JpegEncoder::new(Jpeg::new(40), SessionConfig::new(16, 16));
        // Not running yet: only the session is updated.
        encoder.set_quality(300);
        assert_eq!(encoder.codec().quality(), 100);

        encoder.init(&registry).unwrap();
        assert_eq!(device_quality(&encoder), 100);

        encoder.set_quality(-5);
        assert_eq!(encoder.codec().quality(), 1);
        assert_eq!(device_quality(&encoder), 1);
    }

    #[test]
    fn test_quality_changes_output() {
        let registry = DeviceRegistry::new();
        register_default_codecs(&registry).unwrap();
        let frame = (0..32 * 32)
            .flat_map(|i: u32| ((i * 7919) as u16).to_le_bytes())
            .collect::<Vec<_>>();

        let mut encoder = JpegEncoder::new(Jpeg::new(95), SessionConfig::new(32, 32));
        encoder.init(&registry).unwrap();
        let high = encoder.encode(&frame).unwrap().len();
        encoder.set_quality(5);
        let low = encoder.encode(&frame).unwrap().len();
        assert!(low < high, "quality 5 gave {} bytes, quality 95 {}", low, high);
    }
}
