//! H.264 encoder device.
//!
//! The engine produces a Baseline profile Annex B stream in which every
//! macroblock is coded as `I_PCM`, i.e. raw samples. The output is large, but
//! any conforming decoder can play it. IDR frames are preceded by the SPS and
//! PPS so that each of them is a valid entry point into the stream.
mod bitstream;

use bitstream::{write_nal_unit, BitWriter, NalUnitType};

use super::m2m::{EngineError, FrameEngine, FrameKind, M2mDevice};
use crate::controls::{ControlId, DEFAULT_H264_BITRATE, DEFAULT_H264_GOP_SIZE};
use crate::{Format, PixelFormat};

use log::debug;

const OUTPUT_FORMATS: [PixelFormat; 2] = [PixelFormat::RGB565, PixelFormat::YUV420];
const CAPTURE_FORMATS: [PixelFormat; 1] = [PixelFormat::H264];
const CONTROLS: [ControlId; 3] = [
    ControlId::VideoBitrate,
    ControlId::VideoGopSize,
    ControlId::ForceKeyFrame,
];

const MB_SIZE: usize = 16;
/// `mb_type` of `I_PCM` in an I slice.
const MB_TYPE_I_PCM: u32 = 25;
/// `slice_type` of an I slice, all slices of the picture being I slices.
const SLICE_TYPE_I: u32 = 7;
/// `frame_num` is coded on `log2_max_frame_num_minus4 + 4` bits.
const LOG2_MAX_FRAME_NUM: u8 = 4;
/// Largest frame, in macroblocks, allowed by level 4.0.
const LEVEL_40_MAX_FS: usize = 8192;

/// Planar YUV 4:2:0 picture.
struct YuvPicture {
    width: usize,
    height: usize,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
}

fn rgb565_components(pixel: u16) -> (i32, i32, i32) {
    let r = ((pixel >> 11) & 0x1f) as i32;
    let g = ((pixel >> 5) & 0x3f) as i32;
    let b = (pixel & 0x1f) as i32;
    ((r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2))
}

fn clamp_sample(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited range conversion.
fn rgb_to_yuv(r: i32, g: i32, b: i32) -> (u8, u8, u8) {
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (clamp_sample(y), clamp_sample(u), clamp_sample(v))
}

impl YuvPicture {
    fn chroma_size(width: usize, height: usize) -> (usize, usize) {
        (width.div_ceil(2), height.div_ceil(2))
    }

    fn from_rgb565(data: &[u8], width: usize, height: usize) -> Self {
        let (cw, ch) = Self::chroma_size(width, height);
        let pixel = |x: usize, y: usize| {
            let offset = (y * width + x) * 2;
            data.get(offset..offset + 2)
                .map(|p| u16::from_le_bytes([p[0], p[1]]))
                .unwrap_or(0)
        };

        let mut y_plane = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let (r, g, b) = rgb565_components(pixel(x, y));
                y_plane.push(rgb_to_yuv(r, g, b).0);
            }
        }

        let mut u_plane = Vec::with_capacity(cw * ch);
        let mut v_plane = Vec::with_capacity(cw * ch);
        for cy in 0..ch {
            for cx in 0..cw {
                let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
                for (x, y) in [(0usize, 0usize), (1, 0), (0, 1), (1, 1)]
                    .into_iter()
                    .map(|(dx, dy)| (cx * 2 + dx, cy * 2 + dy))
                    .filter(|&(x, y)| x < width && y < height)
                {
                    let (pr, pg, pb) = rgb565_components(pixel(x, y));
                    r += pr;
                    g += pg;
                    b += pb;
                    n += 1;
                }
                let (_, u, v) = rgb_to_yuv(r / n, g / n, b / n);
                u_plane.push(u);
                v_plane.push(v);
            }
        }

        YuvPicture {
            width,
            height,
            y: y_plane,
            u: u_plane,
            v: v_plane,
        }
    }

    fn from_yuv420(data: &[u8], width: usize, height: usize) -> Self {
        let (cw, ch) = Self::chroma_size(width, height);
        let plane = |start: usize, len: usize, fill: u8| {
            let mut plane = data
                .get(start.min(data.len())..(start + len).min(data.len()))
                .unwrap_or_default()
                .to_vec();
            plane.resize(len, fill);
            plane
        };

        YuvPicture {
            width,
            height,
            y: plane(0, width * height, 0),
            u: plane(width * height, cw * ch, 128),
            v: plane(width * height + cw * ch, cw * ch, 128),
        }
    }

    /// Sample of `plane` at `(x, y)`, replicating the edges of the picture.
    fn sample(plane: &[u8], plane_width: usize, plane_height: usize, x: usize, y: usize) -> u8 {
        let x = x.min(plane_width - 1);
        let y = y.min(plane_height - 1);
        // PCM samples of 0 are reserved by early revisions of the standard.
        plane[y * plane_width + x].max(1)
    }

    /// Append the PCM samples of macroblock `(mbx, mby)` to `out`.
    fn write_macroblock(&self, mbx: usize, mby: usize, out: &mut Vec<u8>) {
        for y in 0..MB_SIZE {
            for x in 0..MB_SIZE {
                out.push(Self::sample(
                    &self.y,
                    self.width,
                    self.height,
                    mbx * MB_SIZE + x,
                    mby * MB_SIZE + y,
                ));
            }
        }

        let (cw, ch) = Self::chroma_size(self.width, self.height);
        for plane in [&self.u, &self.v] {
            for y in 0..MB_SIZE / 2 {
                for x in 0..MB_SIZE / 2 {
                    out.push(Self::sample(
                        plane,
                        cw,
                        ch,
                        mbx * MB_SIZE / 2 + x,
                        mby * MB_SIZE / 2 + y,
                    ));
                }
            }
        }
    }
}

fn size_in_mbs(width: u32, height: u32) -> (usize, usize) {
    (
        (width as usize).div_ceil(MB_SIZE),
        (height as usize).div_ceil(MB_SIZE),
    )
}

/// Upper bound of the size of an encoded frame: 384 PCM bytes plus the
/// macroblock header for each macroblock, plus parameter sets and slice
/// header.
pub fn max_frame_size(width: u32, height: u32) -> usize {
    let (mbw, mbh) = size_in_mbs(width, height);
    mbw * mbh * 386 + 128
}

pub struct H264Engine {
    bitrate: u32,
    gop_size: u32,
    force_key_frame: bool,
    /// Frames encoded since streaming started.
    frame_index: u64,
    frame_num: u32,
    idr_pic_id: u32,
}

impl H264Engine {
    pub fn new(bitrate: u32, gop_size: u32) -> Self {
        H264Engine {
            bitrate,
            gop_size,
            force_key_frame: false,
            frame_index: 0,
            frame_num: 0,
            idr_pic_id: 0,
        }
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn gop_size(&self) -> u32 {
        self.gop_size
    }

    fn write_sps(&self, width: u32, height: u32, out: &mut Vec<u8>) {
        let (mbw, mbh) = size_in_mbs(width, height);
        let level = if mbw * mbh > LEVEL_40_MAX_FS { 51 } else { 40 };
        let crop_right = (mbw * MB_SIZE - width as usize) / 2;
        let crop_bottom = (mbh * MB_SIZE - height as usize) / 2;

        let mut w = BitWriter::new();
        // Baseline, constrained.
        w.write_bits(66, 8);
        w.write_bits(0xc0, 8);
        w.write_bits(level, 8);
        // seq_parameter_set_id
        w.write_ue(0);
        w.write_ue((LOG2_MAX_FRAME_NUM - 4) as u32);
        // pic_order_cnt_type: derived from frame_num.
        w.write_ue(2);
        // max_num_ref_frames
        w.write_ue(1);
        // gaps_in_frame_num_value_allowed_flag
        w.write_bit(false);
        w.write_ue(mbw as u32 - 1);
        w.write_ue(mbh as u32 - 1);
        // frame_mbs_only_flag
        w.write_bit(true);
        // direct_8x8_inference_flag
        w.write_bit(true);
        let cropping = crop_right > 0 || crop_bottom > 0;
        w.write_bit(cropping);
        if cropping {
            w.write_ue(0);
            w.write_ue(crop_right as u32);
            w.write_ue(0);
            w.write_ue(crop_bottom as u32);
        }
        // vui_parameters_present_flag
        w.write_bit(false);
        w.write_trailing_bits();

        write_nal_unit(out, 3, NalUnitType::Sps, &w.into_bytes());
    }

    fn write_pps(&self, out: &mut Vec<u8>) {
        let mut w = BitWriter::new();
        // pic_parameter_set_id, seq_parameter_set_id
        w.write_ue(0);
        w.write_ue(0);
        // entropy_coding_mode_flag: CAVLC
        w.write_bit(false);
        // bottom_field_pic_order_in_frame_present_flag
        w.write_bit(false);
        // num_slice_groups_minus1
        w.write_ue(0);
        // num_ref_idx_l0/l1_default_active_minus1
        w.write_ue(0);
        w.write_ue(0);
        // weighted_pred_flag, weighted_bipred_idc
        w.write_bit(false);
        w.write_bits(0, 2);
        // pic_init_qp_minus26, pic_init_qs_minus26, chroma_qp_index_offset
        w.write_se(0);
        w.write_se(0);
        w.write_se(0);
        // deblocking_filter_control_present_flag
        w.write_bit(true);
        // constrained_intra_pred_flag, redundant_pic_cnt_present_flag
        w.write_bit(false);
        w.write_bit(false);
        w.write_trailing_bits();

        write_nal_unit(out, 3, NalUnitType::Pps, &w.into_bytes());
    }

    fn write_slice(&self, picture: &YuvPicture, idr: bool, out: &mut Vec<u8>) {
        let (mbw, mbh) = size_in_mbs(picture.width as u32, picture.height as u32);
        let mut w = BitWriter::with_capacity(mbw * mbh * 386 + 16);

        // first_mb_in_slice
        w.write_ue(0);
        w.write_ue(SLICE_TYPE_I);
        // pic_parameter_set_id
        w.write_ue(0);
        w.write_bits(self.frame_num, LOG2_MAX_FRAME_NUM);
        if idr {
            w.write_ue(self.idr_pic_id);
            // no_output_of_prior_pics_flag, long_term_reference_flag
            w.write_bit(false);
            w.write_bit(false);
        } else {
            // adaptive_ref_pic_marking_mode_flag
            w.write_bit(false);
        }
        // slice_qp_delta
        w.write_se(0);
        // disable_deblocking_filter_idc: nothing to filter in PCM macroblocks.
        w.write_ue(1);

        let mut samples = Vec::with_capacity(384);
        for mby in 0..mbh {
            for mbx in 0..mbw {
                w.write_ue(MB_TYPE_I_PCM);
                w.align_zero();
                samples.clear();
                picture.write_macroblock(mbx, mby, &mut samples);
                w.write_aligned_bytes(&samples);
            }
        }
        w.write_trailing_bits();

        let (nal_ref_idc, nal_type) = if idr {
            (3, NalUnitType::IdrSlice)
        } else {
            (2, NalUnitType::Slice)
        };
        write_nal_unit(out, nal_ref_idc, nal_type, &w.into_bytes());
    }
}

impl Default for H264Engine {
    fn default() -> Self {
        Self::new(DEFAULT_H264_BITRATE, DEFAULT_H264_GOP_SIZE)
    }
}

impl FrameEngine for H264Engine {
    fn driver(&self) -> &'static str {
        "vidbuf_h264"
    }

    fn card(&self) -> &'static str {
        "H.264 encoder"
    }

    fn output_formats(&self) -> &[PixelFormat] {
        &OUTPUT_FORMATS
    }

    fn capture_formats(&self) -> &[PixelFormat] {
        &CAPTURE_FORMATS
    }

    fn capture_size(&self, output: &Format) -> usize {
        max_frame_size(output.width, output.height)
    }

    fn controls(&self) -> &[ControlId] {
        &CONTROLS
    }

    fn get_control(&self, id: ControlId) -> i32 {
        match id {
            ControlId::VideoBitrate => self.bitrate as i32,
            ControlId::VideoGopSize => self.gop_size as i32,
            ControlId::ForceKeyFrame => self.force_key_frame as i32,
            ControlId::JpegCompressionQuality => 0,
        }
    }

    fn set_control(&mut self, id: ControlId, value: i32) {
        match id {
            ControlId::VideoBitrate => self.bitrate = value as u32,
            ControlId::VideoGopSize => self.gop_size = value as u32,
            ControlId::ForceKeyFrame => self.force_key_frame = value != 0,
            ControlId::JpegCompressionQuality => (),
        }
    }

    fn process(
        &mut self,
        input: &[u8],
        format: &Format,
        output: &mut Vec<u8>,
    ) -> Result<FrameKind, EngineError> {
        let (width, height) = (format.width as usize, format.height as usize);
        if width == 0 || height == 0 {
            return Err(EngineError::Encode("format not set".into()));
        }
        let picture = match format.pixelformat {
            PixelFormat::RGB565 => YuvPicture::from_rgb565(input, width, height),
            PixelFormat::YUV420 => YuvPicture::from_yuv420(input, width, height),
            f => return Err(EngineError::UnsupportedFormat(f)),
        };

        // Only the first frame of a stream is an IDR frame unless the client
        // asks for one.
        let idr = self.force_key_frame || self.frame_index == 0;
        if idr {
            if self.force_key_frame {
                debug!("Forcing IDR frame at frame {}", self.frame_index);
            }
            self.force_key_frame = false;
            self.frame_num = 0;
            self.write_sps(format.width, format.height, output);
            self.write_pps(output);
        }
        self.write_slice(&picture, idr, output);

        if idr {
            self.idr_pic_id = (self.idr_pic_id + 1) % 65536;
        }
        self.frame_num = (self.frame_num + 1) % (1 << LOG2_MAX_FRAME_NUM);
        self.frame_index += 1;

        Ok(if idr { FrameKind::Key } else { FrameKind::Delta })
    }

    fn reset(&mut self) {
        self.frame_index = 0;
        self.frame_num = 0;
        self.force_key_frame = false;
    }
}

/// H.264 encoder device: raw frames on the `Output` queue, Annex B access
/// units on the `Capture` queue. IDR frames are flagged as keyframes, the
/// others as P frames.
///
/// The first frame after streaming starts is an IDR frame, and so is every
/// frame queued after `ForceKeyFrame` is set: the keyframe cadence belongs to
/// the client. The bitrate and GOP size controls are accepted and reported but
/// do not influence the output, which is always coded losslessly.
pub type H264Device = M2mDevice<H264Engine>;

impl M2mDevice<H264Engine> {
    pub fn new() -> Self {
        Self::with_engine(H264Engine::default())
    }
}

impl Default for M2mDevice<H264Engine> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, VideoDevice};

    fn nal_types(stream: &[u8]) -> Vec<u8> {
        stream
            .windows(5)
            .filter(|w| w[..4] == [0, 0, 0, 1])
            .map(|w| w[4] & 0x1f)
            .collect()
    }

    fn encode(engine: &mut H264Engine, width: usize, height: usize) -> (FrameKind, Vec<u8>) {
        let format = Format::from((PixelFormat::RGB565, (width, height))).with_computed_layout();
        let input = vec![0x55; width * height * 2];
        let mut out = Vec::new();
        let kind = engine.process(&input, &format, &mut out).unwrap();
        (kind, out)
    }

    #[test]
    fn test_idr_only_when_requested() {
        // The GOP size does not make the engine emit IDR frames by itself.
        let mut engine = H264Engine::new(DEFAULT_H264_BITRATE, 1);
        let kinds = (0..4)
            .map(|_| encode(&mut engine, 16, 16).0)
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                FrameKind::Key,
                FrameKind::Delta,
                FrameKind::Delta,
                FrameKind::Delta
            ]
        );
    }

    #[test]
    fn test_stream_structure() {
        let mut engine = H264Engine::default();
        let (_, idr) = encode(&mut engine, 40, 24);
        assert_eq!(nal_types(&idr), vec![7, 8, 5]);
        // Baseline profile, level 4.0.
        assert_eq!(&idr[5..8], &[66, 0xc0, 40]);

        let (_, delta) = encode(&mut engine, 40, 24);
        assert_eq!(nal_types(&delta), vec![1]);
        assert!(delta.len() <= max_frame_size(40, 24));
        assert!(idr.len() <= max_frame_size(40, 24));
    }

    #[test]
    fn test_force_key_frame() {
        let mut engine = H264Engine::default();
        encode(&mut engine, 16, 16);
        assert_eq!(encode(&mut engine, 16, 16).0, FrameKind::Delta);
        engine.set_control(ControlId::ForceKeyFrame, 1);
        assert_eq!(encode(&mut engine, 16, 16).0, FrameKind::Key);
        assert_eq!(engine.get_control(ControlId::ForceKeyFrame), 0);
        assert_eq!(encode(&mut engine, 16, 16).0, FrameKind::Delta);
    }

    #[test]
    fn test_reset_restarts_gop() {
        let mut engine = H264Engine::default();
        encode(&mut engine, 16, 16);
        assert_eq!(encode(&mut engine, 16, 16).0, FrameKind::Delta);
        engine.reset();
        assert_eq!(encode(&mut engine, 16, 16).0, FrameKind::Key);
    }

    #[test]
    fn test_pcm_samples() {
        // A black 16x16 frame: luma 16, chroma 128.
        let mut engine = H264Engine::default();
        let format = Format::from((PixelFormat::RGB565, (16, 16))).with_computed_layout();
        let mut out = Vec::new();
        engine.process(&[0; 512], &format, &mut out).unwrap();

        let slice_start = out
            .windows(5)
            .rposition(|w| w[..4] == [0, 0, 0, 1])
            .unwrap();
        let slice = &out[slice_start..];
        let luma = slice.windows(256).any(|w| w.iter().all(|&s| s == 16));
        let chroma = slice.windows(128).any(|w| w.iter().all(|&s| s == 128));
        assert!(luma);
        assert!(chroma);
    }

    #[test]
    fn test_yuv_conversion() {
        assert_eq!(rgb_to_yuv(0, 0, 0), (16, 128, 128));
        assert_eq!(rgb_to_yuv(255, 255, 255), (235, 128, 128));
    }

    #[test]
    fn test_controls() {
        let device = H264Device::new();
        let bitrate = ControlId::VideoBitrate as u32;
        let gop = ControlId::VideoGopSize as u32;
        assert_eq!(device.get_control(bitrate), Ok(2_000_000));
        assert_eq!(device.get_control(gop), Ok(30));
        device.set_control(bitrate, 4_000_000).unwrap();
        assert_eq!(device.get_control(bitrate), Ok(4_000_000));
        assert_eq!(device.set_control(bitrate, 50), Err(DeviceError::OutOfRange));
        assert_eq!(device.set_control(gop, 301), Err(DeviceError::OutOfRange));
        assert_eq!(
            device.get_control(ControlId::JpegCompressionQuality as u32),
            Err(DeviceError::InvalidArgument)
        );
    }
}
