//! Bit-addressed reading and writing.
//!
//! The cracker reads through a [`BitReader`], which tracks an absolute bit
//! position and an upper limit. Sized containers narrow the limit while their
//! children are read; Choice and Array rewind by seeking back to a saved
//! position. Generation writes through a [`BitWriter`].

/// A reader over a byte slice addressed in bits, most significant bit first.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: u64,
    limit: u64,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            limit: data.len() as u64 * 8,
        }
    }

    /// Current position in bits from the start of the data.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn total_bits(&self) -> u64 {
        self.data.len() as u64 * 8
    }

    /// Bits left before the current limit.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.pos)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Moves to an absolute bit position. Fails when the position lies past the
    /// current limit.
    pub fn seek(&mut self, pos: u64) -> bool {
        if pos > self.limit {
            return false;
        }
        self.pos = pos;
        true
    }

    /// Narrows the readable region to `len` bits from the current position and
    /// returns the previous limit, to be handed back to [`BitReader::restore_limit`].
    pub fn narrow(&mut self, len: u64) -> Option<u64> {
        if len > self.remaining() {
            return None;
        }
        let previous = self.limit;
        self.limit = self.pos + len;
        Some(previous)
    }

    pub fn restore_limit(&mut self, previous: u64) {
        self.limit = previous;
    }

    /// Reads up to 64 bits as an unsigned integer.
    pub fn read_bits(&mut self, count: u32) -> Option<u64> {
        debug_assert!(count <= 64);
        if u64::from(count) > self.remaining() {
            return None;
        }
        let mut value = 0u64;
        for _ in 0..count {
            let byte = self.data[(self.pos / 8) as usize];
            let bit = (byte >> (7 - (self.pos % 8))) & 1;
            value = (value << 1) | u64::from(bit);
            self.pos += 1;
        }
        Some(value)
    }

    /// Reads `count` bits into a byte buffer, left aligned. The final byte is
    /// zero padded when `count` is not a multiple of eight.
    pub fn read_bit_buffer(&mut self, count: u64) -> Option<Vec<u8>> {
        if count > self.remaining() {
            return None;
        }
        if self.pos % 8 == 0 && count % 8 == 0 {
            let start = (self.pos / 8) as usize;
            let end = start + (count / 8) as usize;
            self.pos += count;
            return Some(self.data[start..end].to_vec());
        }
        let mut out = Vec::with_capacity(count.div_ceil(8) as usize);
        let mut left = count;
        while left > 0 {
            let take = left.min(8) as u32;
            let chunk = self.read_bits(take)? as u8;
            out.push(chunk << (8 - take));
            left -= u64::from(take);
        }
        Some(out)
    }

    pub fn read_bytes(&mut self, count: usize) -> Option<Vec<u8>> {
        self.read_bit_buffer(count as u64 * 8)
    }
}

/// An append-only bit buffer.
#[derive(Debug, Clone, Default)]
pub struct BitWriter {
    data: Vec<u8>,
    len: u64,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bits written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write_bits(&mut self, value: u64, count: u32) {
        debug_assert!(count <= 64);
        for i in (0..count).rev() {
            let bit = ((value >> i) & 1) as u8;
            if self.len % 8 == 0 {
                self.data.push(0);
            }
            if bit == 1 {
                let last = self.data.len() - 1;
                self.data[last] |= 1 << (7 - (self.len % 8));
            }
            self.len += 1;
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.len % 8 == 0 {
            self.data.extend_from_slice(bytes);
            self.len += bytes.len() as u64 * 8;
        } else {
            for byte in bytes {
                self.write_bits(u64::from(*byte), 8);
            }
        }
    }

    /// Writes the first `count` bits of a left-aligned buffer.
    pub fn write_bit_buffer(&mut self, bytes: &[u8], count: u64) {
        if count % 8 == 0 && count / 8 <= bytes.len() as u64 {
            self.write_bytes(&bytes[..(count / 8) as usize]);
            return;
        }
        let mut left = count;
        for byte in bytes {
            if left == 0 {
                break;
            }
            let take = left.min(8) as u32;
            self.write_bits(u64::from(*byte >> (8 - take)), take);
            left -= u64::from(take);
        }
    }

    pub fn append(&mut self, other: &BitWriter) {
        self.write_bit_buffer(&other.data, other.len);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the writer; a trailing partial byte is zero padded.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_bits_msb_first() {
        let data = [0b1010_0000, 0xFF];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(1), Some(1));
        assert_eq!(reader.read_bits(3), Some(0b010));
        assert_eq!(reader.position(), 4);
        assert_eq!(reader.read_bits(8), Some(0b0000_1111));
        assert_eq!(reader.remaining(), 4);
        assert_eq!(reader.read_bits(5), None);
    }

    #[test]
    fn narrow_and_restore_limit() {
        let data = [1, 2, 3, 4];
        let mut reader = BitReader::new(&data);
        reader.read_bytes(1).unwrap();
        let previous = reader.narrow(16).unwrap();
        assert_eq!(reader.read_bytes(2), Some(vec![2, 3]));
        assert!(reader.is_exhausted());
        assert_eq!(reader.read_bytes(1), None);
        reader.restore_limit(previous);
        assert_eq!(reader.read_bytes(1), Some(vec![4]));
        assert!(reader.narrow(8).is_none());
    }

    #[test]
    fn seek_is_bounded_by_limit() {
        let data = [0u8; 2];
        let mut reader = BitReader::new(&data);
        assert!(reader.seek(16));
        assert!(!reader.seek(17));
        assert!(reader.seek(3));
        assert_eq!(reader.position(), 3);
    }

    #[test]
    fn unaligned_buffers() {
        let data = [0b1111_0000, 0b1010_1010];
        let mut reader = BitReader::new(&data);
        reader.read_bits(4).unwrap();
        assert_eq!(reader.read_bit_buffer(12), Some(vec![0b0000_1010, 0b1010_0000]));
    }

    #[test]
    fn writer_packs_bits() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b101, 3);
        writer.write_bits(0b11111, 5);
        writer.write_bytes(&[0xAB]);
        assert_eq!(writer.len(), 16);
        assert_eq!(writer.as_bytes(), &[0b1011_1111, 0xAB]);

        let mut partial = BitWriter::new();
        partial.write_bits(1, 1);
        partial.write_bytes(&[0xFF]);
        assert_eq!(partial.len(), 9);
        assert_eq!(partial.into_bytes(), vec![0xFF, 0x80]);
    }

    #[test]
    fn writer_appends_unaligned_buffers() {
        let mut first = BitWriter::new();
        first.write_bits(0b11, 2);
        let mut second = BitWriter::new();
        second.write_bits(0b0101, 4);
        first.append(&second);
        assert_eq!(first.len(), 6);
        assert_eq!(first.as_bytes(), &[0b1101_0100]);
    }
}
