//! Generic addressed command frame.
//!
//! Layout: `[address, command, reg1, reg2, reg3, checksum]` where the checksum is the XOR of
//! the first five bytes. Parsing never fails; validity is checked explicitly with
//! [`Frame::is_valid`].

use log::error;

/// Six-byte checksummed frame
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    /// Size of a well-formed frame in bytes
    pub const SIZE: usize = 6;

    /// Build a frame and compute its checksum
    pub fn new(address: u8, command: u8, reg1: u8, reg2: u8, reg3: u8) -> Self {
        let mut bytes = vec![address, command, reg1, reg2, reg3, 0];
        bytes[5] = Self::checksum(&bytes[..5]);
        Self { bytes }
    }

    /// Frame without register payload
    pub fn command(address: u8, command: u8) -> Self {
        Self::new(address, command, 0, 0, 0)
    }

    /// Wrap raw bytes without validating them
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    /// XOR of all given bytes
    pub fn checksum(bytes: &[u8]) -> u8 {
        bytes.iter().fold(0u8, |acc, b| acc ^ b)
    }

    pub fn is_valid(&self) -> bool {
        if self.bytes.len() != Self::SIZE {
            error!(
                "Invalid frame size: {} (expected {})",
                self.bytes.len(),
                Self::SIZE
            );
            return false;
        }

        let expected = Self::checksum(&self.bytes[..5]);
        if self.bytes[5] != expected {
            error!(
                "Invalid frame checksum: {:02X} (expected {:02X})",
                self.bytes[5], expected
            );
            return false;
        }

        true
    }

    fn byte(&self, index: usize) -> u8 {
        self.bytes.get(index).copied().unwrap_or(0)
    }

    pub fn addr(&self) -> u8 {
        self.byte(0)
    }

    pub fn cmd(&self) -> u8 {
        self.byte(1)
    }

    pub fn reg1(&self) -> u8 {
        self.byte(2)
    }

    pub fn reg2(&self) -> u8 {
        self.byte(3)
    }

    pub fn reg3(&self) -> u8 {
        self.byte(4)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Split a buffer into consecutive frames. A trailing partial frame is dropped.
    pub fn split(buffer: &[u8]) -> Vec<Frame> {
        buffer
            .chunks_exact(Self::SIZE)
            .map(Frame::from_bytes)
            .collect()
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_frame_is_valid() {
        for (addr, cmd) in [(0u8, 0u8), (1, 0x10), (0xFF, 0xFF), (0x7E, 0x42)] {
            let frame = Frame::new(addr, cmd, 1, 2, 3);
            assert!(frame.is_valid());
            assert_eq!(frame.as_bytes()[5], addr ^ cmd ^ 1 ^ 2 ^ 3);
        }
    }

    #[test]
    fn flipping_a_checksum_bit_invalidates() {
        let frame = Frame::new(0x21, 0x05, 0x10, 0x00, 0xA0);
        for bit in 0..8 {
            let mut bytes = frame.as_bytes().to_vec();
            bytes[5] ^= 1 << bit;
            assert!(!Frame::from_bytes(&bytes).is_valid());
        }
    }

    #[test]
    fn wrong_length_is_invalid() {
        assert!(!Frame::from_bytes(&[1, 2, 3]).is_valid());
        assert!(!Frame::from_bytes(&[0; 7]).is_valid());
        assert!(!Frame::default().is_valid());
    }

    #[test]
    fn accessors_on_short_frame_return_zero() {
        let frame = Frame::from_bytes(&[7, 8]);
        assert_eq!(frame.addr(), 7);
        assert_eq!(frame.cmd(), 8);
        assert_eq!(frame.reg1(), 0);
        assert_eq!(frame.reg3(), 0);
    }

    #[test]
    fn split_drops_trailing_bytes() {
        let mut buffer = Vec::new();
        buffer.extend(Frame::new(1, 2, 3, 4, 5).into_bytes());
        buffer.extend(Frame::new(6, 7, 8, 9, 10).into_bytes());
        let frames = Frame::split(&buffer);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].as_bytes(), &buffer[6..12]);

        buffer.extend([0xAA, 0xBB, 0xCC]);
        let frames = Frame::split(&buffer);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(Frame::is_valid));

        assert!(Frame::split(&[1, 2, 3, 4, 5]).is_empty());
    }
}
