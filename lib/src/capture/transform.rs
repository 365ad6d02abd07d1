//! Geometry transforms applied to captured frames before display.
use enumn::N;
use std::fmt;
use thiserror::Error;

/// Bytes per pixel of the frames `SoftwareTransform` works on.
pub const BYTES_PER_PIXEL: usize = 2;

/// Clockwise rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, N)]
#[repr(u32)]
pub enum Rotation {
    #[default]
    Deg0 = 0,
    Deg90 = 90,
    Deg180 = 180,
    Deg270 = 270,
}

impl Rotation {
    /// Whether the rotation swaps width and height.
    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

impl TryFrom<u32> for Rotation {
    type Error = TransformError;

    fn try_from(degrees: u32) -> Result<Self, Self::Error> {
        Rotation::n(degrees).ok_or(TransformError::InvalidRotation(degrees))
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", *self as u32)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("invalid rotation {0}, must be 0, 90, 180 or 270")]
    InvalidRotation(u32),
    #[error("source holds {got} bytes, {needed} needed")]
    SourceTooSmall { needed: usize, got: usize },
    #[error("destination holds {got} bytes, {needed} needed")]
    DestinationTooSmall { needed: usize, got: usize },
}

/// A transform from one frame to another of possibly different dimensions.
pub trait GeometryTransform: Send {
    /// Dimensions of the result of transforming a `width`x`height` frame.
    fn output_size(&self, width: u32, height: u32) -> (u32, u32);

    /// Transform `src`, a `width`x`height` frame, into `dst`. Returns the
    /// number of bytes written.
    fn apply(
        &self,
        src: &[u8],
        dst: &mut [u8],
        width: u32,
        height: u32,
    ) -> Result<usize, TransformError>;
}

/// Rotation and mirroring of 16-bit pixels on the CPU. Mirroring applies to
/// the rotated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftwareTransform {
    pub rotation: Rotation,
    pub mirror_x: bool,
    pub mirror_y: bool,
}

impl SoftwareTransform {
    pub fn new(rotation: Rotation, mirror_x: bool, mirror_y: bool) -> Self {
        SoftwareTransform {
            rotation,
            mirror_x,
            mirror_y,
        }
    }

    /// Whether applying the transform changes anything.
    pub fn is_identity(&self) -> bool {
        self.rotation == Rotation::Deg0 && !self.mirror_x && !self.mirror_y
    }

    /// Position in the source frame of the pixel ending at (`x`, `y`).
    fn source_position(&self, x: usize, y: usize, width: usize, height: usize) -> (usize, usize) {
        let (out_w, out_h) = if self.rotation.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        };
        let x = if self.mirror_x { out_w - 1 - x } else { x };
        let y = if self.mirror_y { out_h - 1 - y } else { y };

        match self.rotation {
            Rotation::Deg0 => (x, y),
            Rotation::Deg90 => (y, height - 1 - x),
            Rotation::Deg180 => (width - 1 - x, height - 1 - y),
            Rotation::Deg270 => (width - 1 - y, x),
        }
    }
}

impl GeometryTransform for SoftwareTransform {
    fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        if self.rotation.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        }
    }

    fn apply(
        &self,
        src: &[u8],
        dst: &mut [u8],
        width: u32,
        height: u32,
    ) -> Result<usize, TransformError> {
        let (width, height) = (width as usize, height as usize);
        let needed = width * height * BYTES_PER_PIXEL;
        if src.len() < needed {
            return Err(TransformError::SourceTooSmall {
                needed,
                got: src.len(),
            });
        }
        if dst.len() < needed {
            return Err(TransformError::DestinationTooSmall {
                needed,
                got: dst.len(),
            });
        }

        let (out_w, out_h) = self.output_size(width as u32, height as u32);
        let (out_w, out_h) = (out_w as usize, out_h as usize);
        for y in 0..out_h {
            for x in 0..out_w {
                let (sx, sy) = self.source_position(x, y, width, height);
                let s = (sy * width + sx) * BYTES_PER_PIXEL;
                let d = (y * out_w + x) * BYTES_PER_PIXEL;
                dst[d..d + BYTES_PER_PIXEL].copy_from_slice(&src[s..s + BYTES_PER_PIXEL]);
            }
        }

        Ok(needed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 3x2 frame whose pixels hold their own index:
    // 0 1 2
    // 3 4 5
    fn frame() -> Vec<u8> {
        (0u16..6).flat_map(|p| p.to_le_bytes()).collect()
    }

    fn transform(t: SoftwareTransform) -> (Vec<u16>, (u32, u32)) {
        let mut dst = vec![0u8; 12];
        assert_eq!(t.apply(&frame(), &mut dst, 3, 2).unwrap(), 12);
        let pixels = dst
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        (pixels, t.output_size(3, 2))
    }

    #[test]
    fn test_rotations() {
        let rotate = |r| transform(SoftwareTransform::new(r, false, false));

        assert_eq!(rotate(Rotation::Deg0), (vec![0, 1, 2, 3, 4, 5], (3, 2)));
        // 3 0
        // 4 1
        // 5 2
        assert_eq!(rotate(Rotation::Deg90), (vec![3, 0, 4, 1, 5, 2], (2, 3)));
        assert_eq!(rotate(Rotation::Deg180), (vec![5, 4, 3, 2, 1, 0], (3, 2)));
        // 2 5
        // 1 4
        // 0 3
        assert_eq!(rotate(Rotation::Deg270), (vec![2, 5, 1, 4, 0, 3], (2, 3)));
    }

    #[test]
    fn test_mirrors() {
        let (x, _) = transform(SoftwareTransform::new(Rotation::Deg0, true, false));
        assert_eq!(x, vec![2, 1, 0, 5, 4, 3]);
        let (y, _) = transform(SoftwareTransform::new(Rotation::Deg0, false, true));
        assert_eq!(y, vec![3, 4, 5, 0, 1, 2]);
        // Mirroring both ways is a half turn.
        let both = transform(SoftwareTransform::new(Rotation::Deg0, true, true));
        assert_eq!(
            both,
            transform(SoftwareTransform::new(Rotation::Deg180, false, false))
        );
        // Mirroring applies after rotating.
        let (rx, size) = transform(SoftwareTransform::new(Rotation::Deg90, true, false));
        assert_eq!(rx, vec![0, 3, 1, 4, 2, 5]);
        assert_eq!(size, (2, 3));
    }

    #[test]
    fn test_invalid_input() {
        let t = SoftwareTransform::new(Rotation::Deg90, false, false);
        let mut dst = vec![0u8; 12];
        assert_eq!(
            t.apply(&[0; 4], &mut dst, 3, 2),
            Err(TransformError::SourceTooSmall { needed: 12, got: 4 })
        );
        assert_eq!(
            t.apply(&frame(), &mut dst[..8], 3, 2),
            Err(TransformError::DestinationTooSmall { needed: 12, got: 8 })
        );
        assert_eq!(Rotation::try_from(270), Ok(Rotation::Deg270));
        assert_eq!(
            Rotation::try_from(45),
            Err(TransformError::InvalidRotation(45))
        );
        assert!(SoftwareTransform::default().is_identity());
        assert!(!t.is_identity());
    }
}
