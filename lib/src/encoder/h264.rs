use super::{Codec, Encoder};
use crate::controls::{
    effective_gop_size, Control, ControlId, DEFAULT_H264_BITRATE, DEFAULT_H264_GOP_SIZE,
};
use crate::device::registry::H264_DEVICE_ID;
use crate::PixelFormat;

/// H.264 Annex B stream with a fixed keyframe interval.
///
/// The target bitrate is forwarded to the device, which may or may not honor
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H264 {
    bitrate: u32,
    gop_size: u32,
}

impl H264 {
    /// A `gop_size` of 0 is treated as 1, i.e. every frame is a keyframe.
    pub fn new(bitrate: u32, gop_size: u32) -> Self {
        H264 { bitrate, gop_size }
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// The keyframe interval as configured.
    pub fn gop_size(&self) -> u32 {
        self.gop_size
    }

    /// The keyframe interval actually used.
    pub fn effective_gop_size(&self) -> u32 {
        effective_gop_size(self.gop_size)
    }
}

impl Default for H264 {
    fn default() -> Self {
        H264::new(DEFAULT_H264_BITRATE, DEFAULT_H264_GOP_SIZE)
    }
}

fn control_value(v: u32) -> i32 {
    v.min(i32::MAX as u32) as i32
}

impl Codec for H264 {
    const NAME: &'static str = "H.264";
    const CAPTURE_FORMAT: PixelFormat = PixelFormat::H264;
    const DEFAULT_DEVICE_ID: usize = H264_DEVICE_ID;

    fn output_buffer_size(&self, width: u32, height: u32, input_format: PixelFormat) -> usize {
        input_format
            .frame_size(width, height)
            .unwrap_or(width as usize * height as usize * 2)
            / 2
    }

    fn initial_controls(&self) -> Vec<Control> {
        vec![
            Control::new(ControlId::VideoBitrate, control_value(self.bitrate)),
            Control::new(
                ControlId::VideoGopSize,
                control_value(self.effective_gop_size()),
            ),
        ]
    }

    fn is_keyframe(&self, frame_index: u64) -> bool {
        frame_index % self.effective_gop_size() as u64 == 0
    }

    fn keyframe_control(&self) -> Option<ControlId> {
        Some(ControlId::ForceKeyFrame)
    }
}

impl Encoder<H264> {
    pub fn set_bitrate(&mut self, bitrate: u32) {
        self.codec.bitrate = bitrate;
        self.push_control(ControlId::VideoBitrate, control_value(bitrate));
    }

    /// Change the keyframe interval. The cadence keeps counting from the
    /// frames already encoded: the next keyframe is the next frame whose
    /// number is a multiple of the new interval.
    pub fn set_gop_size(&mut self, gop_size: u32) {
        self.codec.gop_size = gop_size;
        self.push_control(
            ControlId::VideoGopSize,
            control_value(self.codec.effective_gop_size()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::registry::{register_default_codecs, DeviceRegistry};
    use crate::encoder::{H264Encoder, SessionConfig};

    fn device_control(encoder: &H264Encoder, id: ControlId) -> i32 {
        encoder
            .session
            .as_ref()
            .unwrap()
            .device
            .get_control(id as u32)
            .unwrap()
    }

    #[test]
    fn test_keyframe_cadence() {
        let h264 = H264::new(1_000_000, 4);
        let keyframes = (0..9).map(|i| h264.is_keyframe(i)).collect::<Vec<_>>();
        assert_eq!(
            keyframes,
            vec![true, false, false, false, true, false, false, false, true]
        );

        for gop in [0, 1] {
            let every_frame = H264::new(1_000_000, gop);
            assert_eq!(every_frame.gop_size(), gop);
            assert_eq!(every_frame.effective_gop_size(), 1);
            assert!((0..10).all(|i| every_frame.is_keyframe(i)));
        }
    }

    #[test]
    fn test_output_buffer_size() {
        assert_eq!(
            H264::default().output_buffer_size(640, 480, PixelFormat::RGB565),
            640 * 480
        );
    }

    #[test]
    fn test_controls_follow_session() {
        let registry = DeviceRegistry::new();
        register_default_codecs(&registry).unwrap();
        let mut encoder = H264Encoder::new(H264::new(1_500_000, 10), SessionConfig::new(16, 16));
        encoder.init(&registry).unwrap();
        assert_eq!(device_control(&encoder, ControlId::VideoBitrate), 1_500_000);
        assert_eq!(device_control(&encoder, ControlId::VideoGopSize), 10);

        encoder.set_bitrate(4_000_000);
        encoder.set_gop_size(0);
        assert_eq!(encoder.codec().bitrate(), 4_000_000);
        assert_eq!(encoder.codec().gop_size(), 0);
        assert_eq!(encoder.codec().effective_gop_size(), 1);
        assert_eq!(device_control(&encoder, ControlId::VideoBitrate), 4_000_000);
        assert_eq!(device_control(&encoder, ControlId::VideoGopSize), 1);
    }

    #[test]
    fn test_gop_change_mid_stream() {
        let registry = DeviceRegistry::new();
        register_default_codecs(&registry).unwrap();
        let frame = vec![0x5au8; 16 * 16 * 2];
        let mut encoder = H264Encoder::new(H264::default(), SessionConfig::new(16, 16));
        encoder.init(&registry).unwrap();

        let mut keyframes = Vec::new();
        for i in 0..5 {
            if i == 2 {
                encoder.set_gop_size(2);
            }
            let frame = encoder.encode(&frame).unwrap();
            // Keyframes start with the SPS.
            assert_eq!(frame.data()[4] & 0x1f == 7, frame.is_keyframe());
            keyframes.push(frame.is_keyframe());
        }
        assert_eq!(keyframes, vec![true, false, true, false, true]);
    }

    fn encode_all(encoder: &mut H264Encoder, count: usize) -> Vec<bool> {
        let frame = vec![0x3cu8; 16 * 16 * 2];
        (0..count)
            .map(|_| {
                let frame = encoder.encode(&frame).unwrap();
                // IDR access units start with the SPS.
                let idr = frame.data()[4] & 0x1f == 7;
                assert_eq!(idr, frame.is_keyframe(), "sequence {}", frame.sequence());
                idr
            })
            .collect()
    }

    #[test]
    fn test_keyframes_match_bitstream() {
        let registry = DeviceRegistry::new();
        register_default_codecs(&registry).unwrap();
        // The device does not accept a GOP that large.
        let mut encoder = H264Encoder::new(
            H264::new(2_000_000, 500),
            SessionConfig::new(16, 16).num_buffers(2, 2),
        );
        encoder.init(&registry).unwrap();
        assert_eq!(device_control(&encoder, ControlId::VideoGopSize), 30);

        let keyframes = encode_all(&mut encoder, 40);
        assert_eq!(keyframes.iter().filter(|&&k| k).count(), 1);
        assert!(keyframes[0]);

        // Restarting the stream starts with a keyframe.
        encoder.session.as_mut().unwrap().stop_streaming();
        let keyframes = encode_all(&mut encoder, 3);
        assert_eq!(keyframes, vec![true, false, false]);

        encoder.set_gop_size(4);
        let keyframes = encode_all(&mut encoder, 4);
        // Frames 43 to 46: 44 is a multiple of 4.
        assert_eq!(keyframes, vec![false, true, false, false]);
        assert_eq!(encoder.frame_count(), 47);
    }
}
