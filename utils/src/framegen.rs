use thiserror::Error;
use vidbuf::PixelFormat;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NewFrameGeneratorError {
    #[error("Invalid stride")]
    InvalidStride,
    #[error("Unsupported pixel format {0}")]
    UnsupportedFormat(PixelFormat),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerateFrameError {
    #[error("Provided buffer is too small")]
    BufferTooSmall,
}

/// Generates a moving pattern of RGB565 or RGB24 frames.
pub struct FrameGenerator {
    width: usize,
    height: usize,
    stride: usize,
    format: PixelFormat,
    step: u32,
}

fn bytes_per_pixel(format: PixelFormat) -> Option<usize> {
    match format {
        PixelFormat::RGB565 => Some(2),
        PixelFormat::RGB24 => Some(3),
        _ => None,
    }
}

impl FrameGenerator {
    pub fn new(
        width: usize,
        height: usize,
        stride: usize,
        format: PixelFormat,
    ) -> Result<Self, NewFrameGeneratorError> {
        let bpp =
            bytes_per_pixel(format).ok_or(NewFrameGeneratorError::UnsupportedFormat(format))?;
        if stride < width * bpp {
            return Err(NewFrameGeneratorError::InvalidStride);
        }

        Ok(FrameGenerator {
            width,
            height,
            stride,
            format,
            step: 0,
        })
    }

    /// Generator of tightly packed RGB565 frames.
    pub fn rgb565(width: usize, height: usize) -> Self {
        FrameGenerator {
            width,
            height,
            stride: width * 2,
            format: PixelFormat::RGB565,
            step: 0,
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn frame_size(&self) -> usize {
        self.stride * self.height
    }

    /// Number of frames generated so far.
    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn next_frame<S: AsMut<[u8]>>(&mut self, frame: &mut S) -> Result<(), GenerateFrameError> {
        let frame = frame.as_mut();

        if frame.len() < self.frame_size() {
            return Err(GenerateFrameError::BufferTooSmall);
        }

        self.gen_pattern(frame);
        self.step = self.step.wrapping_add(1);

        Ok(())
    }

    fn gen_pattern(&mut self, frame: &mut [u8]) {
        let bpp = if self.format == PixelFormat::RGB565 {
            2
        } else {
            3
        };
        frame
            .chunks_exact_mut(self.stride)
            .map(|l| &mut l[0..self.width * bpp])
            .enumerate()
            .for_each(|(y, line)| {
                line.chunks_exact_mut(bpp).enumerate().for_each(|(x, pixel)| {
                    let rgba = self.step.wrapping_add((x ^ y) as u32).to_le_bytes();
                    if bpp == 2 {
                        let rgb565 = ((rgba[0] as u16 >> 3) << 11)
                            | ((rgba[1] as u16 >> 2) << 5)
                            | (rgba[2] as u16 >> 3);
                        pixel.copy_from_slice(&rgb565.to_le_bytes());
                    } else {
                        pixel.copy_from_slice(&rgba[0..3]);
                    }
                });
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_parameters() {
        assert_eq!(
            FrameGenerator::new(4, 4, 7, PixelFormat::RGB565).err(),
            Some(NewFrameGeneratorError::InvalidStride)
        );
        assert_eq!(
            FrameGenerator::new(4, 4, 16, PixelFormat::JPEG).err(),
            Some(NewFrameGeneratorError::UnsupportedFormat(PixelFormat::JPEG))
        );

        let mut gen = FrameGenerator::rgb565(4, 4);
        assert_eq!(gen.frame_size(), 32);
        assert_eq!(
            gen.next_frame(&mut vec![0u8; 31]),
            Err(GenerateFrameError::BufferTooSmall)
        );
    }

    #[test]
    fn test_pattern_moves() {
        let mut gen = FrameGenerator::new(4, 2, 12, PixelFormat::RGB24).unwrap();
        let mut first = vec![0u8; gen.frame_size()];
        let mut second = first.clone();
        gen.next_frame(&mut first).unwrap();
        gen.next_frame(&mut second).unwrap();
        assert_eq!(gen.step(), 2);

        // Pixel (1, 0) of frame 0 is 1, pixel (0, 0) of frame 1 is 1 too.
        assert_eq!(&first[3..6], &[1, 0, 0]);
        assert_eq!(&second[0..3], &[1, 0, 0]);
        assert_ne!(first, second);
    }

    #[test]
    fn test_rgb565_packing() {
        let mut gen = FrameGenerator::rgb565(64, 1);
        let mut frame = vec![0u8; gen.frame_size()];
        gen.next_frame(&mut frame).unwrap();
        let pixel = |x: usize| u16::from_le_bytes([frame[x * 2], frame[x * 2 + 1]]);
        assert_eq!(pixel(0), 0);
        // Red 8 keeps its top 5 bits.
        assert_eq!(pixel(8), 1 << 11);
        assert_eq!(pixel(63), (63 >> 3) << 11);
    }
}
