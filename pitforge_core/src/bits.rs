use std::fmt;

/// A growable, bit-addressable byte sequence.
///
/// Bits are stored most-significant-bit first within each byte, so a buffer
/// of `n` bits occupies `ceil(n / 8)` bytes and any unused trailing bits of
/// the final byte are always zero.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct BitBuffer {
    bytes: Vec<u8>,
    len_bits: u64,
}

impl BitBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer holding exactly the given bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            len_bits: bytes.len() as u64 * 8,
        }
    }

    /// Creates a buffer of `len_bits` zero bits.
    pub fn zeroed(len_bits: u64) -> Self {
        Self {
            bytes: vec![0; len_bits.div_ceil(8) as usize],
            len_bits,
        }
    }

    pub fn len_bits(&self) -> u64 {
        self.len_bits
    }

    /// Number of bytes needed to hold the buffer, counting a trailing partial byte.
    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len_bits == 0
    }

    /// Returns `true` when the buffer ends on a byte boundary.
    pub fn is_byte_aligned(&self) -> bool {
        self.len_bits % 8 == 0
    }

    pub fn push_bit(&mut self, bit: bool) {
        let offset = (self.len_bits % 8) as u8;
        if offset == 0 {
            self.bytes.push(0);
        }
        if bit {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 0x80 >> offset;
        }
        self.len_bits += 1;
    }

    /// Appends the low `count` bits of `value`, most significant first.
    pub fn push_bits(&mut self, value: u64, count: u32) {
        assert!(count <= 64, "cannot push more than 64 bits at once");
        for shift in (0..count).rev() {
            self.push_bit((value >> shift) & 1 == 1);
        }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        if self.is_byte_aligned() {
            self.bytes.extend_from_slice(bytes);
            self.len_bits += bytes.len() as u64 * 8;
        } else {
            for byte in bytes {
                self.push_bits(*byte as u64, 8);
            }
        }
    }

    pub fn append(&mut self, other: &BitBuffer) {
        if self.is_byte_aligned() {
            self.bytes.extend_from_slice(&other.bytes);
            self.len_bits += other.len_bits;
        } else {
            for index in 0..other.len_bits {
                self.push_bit(other.bit(index));
            }
        }
    }

    /// Appends `count` zero bits.
    pub fn push_zeros(&mut self, count: u64) {
        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(64) as u32;
            self.push_bits(0, chunk);
            remaining -= chunk as u64;
        }
    }

    pub fn bit(&self, index: u64) -> bool {
        assert!(index < self.len_bits, "bit index {index} out of range");
        let byte = self.bytes[(index / 8) as usize];
        byte & (0x80 >> (index % 8)) != 0
    }

    pub fn set_bit(&mut self, index: u64, bit: bool) {
        assert!(index < self.len_bits, "bit index {index} out of range");
        let mask = 0x80 >> (index % 8);
        let byte = &mut self.bytes[(index / 8) as usize];
        if bit {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }

    /// Overwrites bits starting at `at` with the contents of `src`.
    ///
    /// The write must fit inside the current length.
    pub fn overwrite(&mut self, at: u64, src: &BitBuffer) {
        assert!(
            at + src.len_bits <= self.len_bits,
            "overwrite of {} bits at {at} exceeds buffer of {} bits",
            src.len_bits,
            self.len_bits
        );
        if at % 8 == 0 && src.is_byte_aligned() {
            let start = (at / 8) as usize;
            self.bytes[start..start + src.bytes.len()].copy_from_slice(&src.bytes);
            return;
        }
        for index in 0..src.len_bits {
            self.set_bit(at + index, src.bit(index));
        }
    }

    /// Copies `len` bits starting at `start` into a new buffer.
    pub fn slice(&self, start: u64, len: u64) -> BitBuffer {
        assert!(start + len <= self.len_bits, "slice out of range");
        if start % 8 == 0 && len % 8 == 0 {
            let from = (start / 8) as usize;
            return BitBuffer::from_bytes(&self.bytes[from..from + (len / 8) as usize]);
        }
        let mut out = BitBuffer::new();
        for index in start..start + len {
            out.push_bit(self.bit(index));
        }
        out
    }

    /// Shortens the buffer to `len_bits`, clearing any bits past the new end.
    pub fn truncate(&mut self, len_bits: u64) {
        if len_bits >= self.len_bits {
            return;
        }
        self.len_bits = len_bits;
        self.bytes.truncate(len_bits.div_ceil(8) as usize);
        let rem = (len_bits % 8) as u32;
        if rem != 0 {
            let last = self.bytes.len() - 1;
            self.bytes[last] &= 0xffu8 << (8 - rem);
        }
    }

    /// The backing bytes; a trailing partial byte is zero padded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Reads up to 64 bits starting at `start` as an unsigned integer, most significant first.
    pub fn read_u64(&self, start: u64, count: u32) -> u64 {
        assert!(count <= 64);
        let mut value = 0u64;
        for index in 0..count as u64 {
            value = (value << 1) | self.bit(start + index) as u64;
        }
        value
    }

    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for BitBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitBuffer({} bits: {})", self.len_bits, self.to_hex())
    }
}

impl From<Vec<u8>> for BitBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        let len_bits = bytes.len() as u64 * 8;
        Self { bytes, len_bits }
    }
}

/// A cursor over a bit-addressable region of an input byte slice.
///
/// All positions are absolute bit offsets into the underlying slice, so a
/// reader carved out of another reader reports positions that can be compared
/// directly with its parent's.
#[derive(Clone, Copy, Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    start: u64,
    end: u64,
    pos: u64,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            start: 0,
            end: data.len() as u64 * 8,
            pos: 0,
        }
    }

    /// Absolute bit position of the cursor.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Absolute bit offset where this region begins.
    pub fn region_start(&self) -> u64 {
        self.start
    }

    /// Absolute bit offset one past the end of this region.
    pub fn region_end(&self) -> u64 {
        self.end
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.end
    }

    /// Moves the cursor to an absolute position inside this region.
    pub fn seek(&mut self, pos: u64) -> bool {
        if pos < self.start || pos > self.end {
            return false;
        }
        self.pos = pos;
        true
    }

    fn bit_at(&self, pos: u64) -> bool {
        let byte = self.data[(pos / 8) as usize];
        byte & (0x80 >> (pos % 8)) != 0
    }

    pub fn read_bit(&mut self) -> Option<bool> {
        if self.pos >= self.end {
            return None;
        }
        let bit = self.bit_at(self.pos);
        self.pos += 1;
        Some(bit)
    }

    /// Reads `count` bits (at most 64) as an unsigned integer, most significant first.
    pub fn read_bits(&mut self, count: u32) -> Option<u64> {
        assert!(count <= 64);
        if self.remaining() < count as u64 {
            return None;
        }
        let mut value = 0u64;
        for _ in 0..count {
            value = (value << 1) | self.bit_at(self.pos) as u64;
            self.pos += 1;
        }
        Some(value)
    }

    pub fn read_buffer(&mut self, count: u64) -> Option<BitBuffer> {
        if self.remaining() < count {
            return None;
        }
        if self.pos % 8 == 0 && count % 8 == 0 {
            let from = (self.pos / 8) as usize;
            let buffer = BitBuffer::from_bytes(&self.data[from..from + (count / 8) as usize]);
            self.pos += count;
            return Some(buffer);
        }
        let mut buffer = BitBuffer::new();
        for _ in 0..count {
            buffer.push_bit(self.bit_at(self.pos));
            self.pos += 1;
        }
        Some(buffer)
    }

    /// Carves an independent region of `len` bits starting at the cursor.
    ///
    /// The parent cursor is left untouched.
    pub fn carve(&self, len: u64) -> Option<BitReader<'a>> {
        if self.remaining() < len {
            return None;
        }
        Some(BitReader {
            data: self.data,
            start: self.pos,
            end: self.pos + len,
            pos: self.pos,
        })
    }

    /// Searches forward from absolute position `from` for the first occurrence
    /// of `needle`, returning its absolute bit offset.
    pub fn find(&self, needle: &BitBuffer, from: u64) -> Option<u64> {
        let len = needle.len_bits();
        if len == 0 || from < self.start {
            return None;
        }
        let mut candidate = from;
        while candidate + len <= self.end {
            if (0..len).all(|index| self.bit_at(candidate + index) == needle.bit(index)) {
                return Some(candidate);
            }
            candidate += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_bits_packs_msb_first() {
        let mut buffer = BitBuffer::new();
        buffer.push_bits(0b101, 3);
        buffer.push_bits(0b11111, 5);
        assert_eq!(buffer.as_bytes(), &[0b1011_1111]);
        buffer.push_bits(1, 1);
        assert_eq!(buffer.len_bits(), 9);
        assert_eq!(buffer.as_bytes(), &[0b1011_1111, 0x80]);
    }

    #[test]
    fn append_handles_unaligned_tail() {
        let mut buffer = BitBuffer::new();
        buffer.push_bits(0b1, 1);
        buffer.append(&BitBuffer::from_bytes(&[0xff]));
        assert_eq!(buffer.len_bits(), 9);
        assert_eq!(buffer.as_bytes(), &[0xff, 0x80]);
    }

    #[test]
    fn overwrite_and_slice_agree() {
        let mut buffer = BitBuffer::zeroed(24);
        let mut patch = BitBuffer::new();
        patch.push_bits(0b1111, 4);
        buffer.overwrite(10, &patch);
        assert_eq!(buffer.slice(10, 4).read_u64(0, 4), 0b1111);
        assert_eq!(buffer.as_bytes(), &[0x00, 0x3c, 0x00]);
        buffer.overwrite(16, &BitBuffer::from_bytes(&[0xaa]));
        assert_eq!(buffer.as_bytes()[2], 0xaa);
    }

    #[test]
    fn truncate_clears_trailing_bits() {
        let mut buffer = BitBuffer::from_bytes(&[0xff, 0xff]);
        buffer.truncate(9);
        assert_eq!(buffer.len_bits(), 9);
        assert_eq!(buffer.as_bytes(), &[0xff, 0x80]);
    }

    #[test]
    fn reader_reads_across_byte_boundaries() {
        let data = [0b1010_1010, 0b0101_0101];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(4), Some(0b1010));
        assert_eq!(reader.read_bits(8), Some(0b1010_0101));
        assert_eq!(reader.remaining(), 4);
        assert_eq!(reader.read_bits(5), None, "short read must not consume");
        assert_eq!(reader.position(), 12);
    }

    #[test]
    fn carved_reader_is_bounded() {
        let data = [1, 2, 3, 4];
        let mut reader = BitReader::new(&data);
        reader.read_bits(8);
        let mut region = reader.carve(16).unwrap();
        assert_eq!(region.region_start(), 8);
        assert_eq!(region.read_bits(16), Some(0x0203));
        assert!(region.is_exhausted());
        assert_eq!(reader.position(), 8, "parent cursor is unchanged");
        assert!(reader.carve(32).is_none());
    }

    #[test]
    fn find_locates_unaligned_needles() {
        let data = [0x0f, 0xf0];
        let reader = BitReader::new(&data);
        let needle = BitBuffer::from_bytes(&[0xff]);
        assert_eq!(reader.find(&needle, 0), Some(4));
        assert_eq!(reader.find(&needle, 5), None);
    }
}
