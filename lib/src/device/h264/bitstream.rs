//! H.264 bitstream writing: Exp-Golomb coded RBSPs and NAL unit framing.

/// NAL unit types used by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NalUnitType {
    Slice = 1,
    IdrSlice = 5,
    Sps = 7,
    Pps = 8,
}

/// Writes a raw byte sequence payload, MSB first.
#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    num_bits: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        BitWriter {
            bytes: Vec::with_capacity(capacity),
            ..Default::default()
        }
    }

    pub fn write_bit(&mut self, bit: bool) {
        self.current = (self.current << 1) | bit as u8;
        self.num_bits += 1;
        if self.num_bits == 8 {
            self.bytes.push(self.current);
            self.current = 0;
            self.num_bits = 0;
        }
    }

    /// Write the `count` low bits of `value`. `count` must be 32 at most.
    pub fn write_bits(&mut self, value: u32, count: u8) {
        for i in (0..count).rev() {
            self.write_bit((value >> i) & 1 != 0);
        }
    }

    /// Unsigned Exp-Golomb code, `ue(v)`.
    pub fn write_ue(&mut self, value: u32) {
        let coded = value as u64 + 1;
        let len = 64 - coded.leading_zeros() as u8;
        for _ in 1..len {
            self.write_bit(false);
        }
        for i in (0..len).rev() {
            self.write_bit((coded >> i) & 1 != 0);
        }
    }

    /// Signed Exp-Golomb code, `se(v)`.
    pub fn write_se(&mut self, value: i32) {
        let mapped = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };
        self.write_ue(mapped);
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.num_bits == 0
    }

    /// Pad with zero bits up to the next byte boundary.
    pub fn align_zero(&mut self) {
        while !self.is_byte_aligned() {
            self.write_bit(false);
        }
    }

    /// Write whole bytes. The writer must be byte-aligned.
    pub fn write_aligned_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.is_byte_aligned());
        self.bytes.extend_from_slice(bytes);
    }

    /// `rbsp_trailing_bits()`: a stop bit followed by zero bits.
    pub fn write_trailing_bits(&mut self) {
        self.write_bit(true);
        self.align_zero();
    }

    /// Returns the written bytes. Bits of an incomplete byte are dropped.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Append `rbsp` to `out` as an Annex B NAL unit: start code, NAL header,
/// then the payload with emulation prevention bytes inserted.
pub fn write_nal_unit(out: &mut Vec<u8>, nal_ref_idc: u8, nal_type: NalUnitType, rbsp: &[u8]) {
    out.extend_from_slice(&[0, 0, 0, 1]);
    out.push(((nal_ref_idc & 0x3) << 5) | nal_type as u8);

    let mut zeros = 0;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 3 {
            out.push(3);
            zeros = 0;
        }
        out.push(byte);
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exp_golomb() {
        let mut w = BitWriter::new();
        // 1, 010, 011, 00100
        w.write_ue(0);
        w.write_ue(1);
        w.write_ue(2);
        w.write_ue(3);
        w.write_trailing_bits();
        assert_eq!(w.into_bytes(), vec![0b1010_0110, 0b0100_1000]);

        let mut w = BitWriter::new();
        // se(1) = ue(1) = 010, se(-1) = ue(2) = 011, se(0) = 1
        w.write_se(1);
        w.write_se(-1);
        w.write_se(0);
        w.align_zero();
        assert_eq!(w.into_bytes(), vec![0b0100_1110]);
    }

    #[test]
    fn test_write_bits() {
        let mut w = BitWriter::new();
        w.write_bits(66, 8);
        w.write_bits(0b101, 3);
        assert!(!w.is_byte_aligned());
        w.align_zero();
        w.write_aligned_bytes(&[0xab]);
        assert_eq!(w.into_bytes(), vec![66, 0b1010_0000, 0xab]);
    }

    #[test]
    fn test_ue_large() {
        let mut w = BitWriter::new();
        // 25 + 1 = 11010b: 4 leading zeros, 9 bits.
        w.write_ue(25);
        w.align_zero();
        assert_eq!(w.into_bytes(), vec![0b0000_1101, 0b0000_0000]);
    }

    #[test]
    fn test_emulation_prevention() {
        let mut out = Vec::new();
        write_nal_unit(
            &mut out,
            3,
            NalUnitType::Sps,
            &[0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x80],
        );
        assert_eq!(
            out,
            vec![
                0x00, 0x00, 0x00, 0x01, 0x67, 0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00,
                0x00, 0x03, 0x00, 0x04, 0x80
            ]
        );
    }
}
