/// Where `ByteBuffer::set_offset` measures from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seek {
    Set,
    Current,
    End,
}

/// Encoded size of `v` as an unsigned varint.
pub fn unvarint_size(mut v: u32) -> usize {
    let mut size = 1;
    while v >= 0x80 {
        v >>= 7;
        size += 1;
    }
    size
}

/// Fixed-capacity read/write cursor used for all wire serialization.
///
/// Writes append at `cursize`; reads advance `readpos`. Overflow in either
/// direction is sticky: a write that would exceed capacity wipes the buffer
/// and raises `overflowed`, and every later write is dropped until `clear`.
/// A read past the written data raises the same flag and yields `None`,
/// as does every later read until `clear`.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
    cursize: usize,
    readpos: usize,
    overflowed: bool,
}

impl ByteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            cursize: 0,
            readpos: 0,
            overflowed: false,
        }
    }

    /// Wraps received bytes for reading. Capacity equals the data length.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            cursize: bytes.len(),
            readpos: 0,
            overflowed: false,
        }
    }

    pub fn clear(&mut self) {
        self.cursize = 0;
        self.readpos = 0;
        self.overflowed = false;
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.cursize
    }

    pub fn is_empty(&self) -> bool {
        self.cursize == 0
    }

    pub fn read_pos(&self) -> usize {
        self.readpos
    }

    pub fn bytes_left(&self) -> usize {
        self.cursize - self.readpos
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.cursize]
    }

    /// Unread portion of the buffer.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.readpos..self.cursize]
    }

    /// Reallocates to `len` bytes. With `keep` the written bytes survive when
    /// they fit, otherwise the buffer is cleared and flagged as overflowed.
    pub fn resize(&mut self, len: usize, keep: bool) {
        let old = std::mem::replace(&mut self.data, vec![0u8; len]);

        if keep && self.cursize <= len {
            self.data[..self.cursize].copy_from_slice(&old[..self.cursize]);
            self.readpos = self.readpos.min(self.cursize);
        } else if keep {
            self.clear();
            self.overflowed = true;
            log::warn!("ByteBuffer::resize: overflow");
        } else {
            self.clear();
        }
    }

    /// The single allocation primitive every writer goes through.
    fn get_space(&mut self, length: usize) -> Option<&mut [u8]> {
        if self.overflowed {
            return None;
        }

        if self.cursize + length > self.data.len() {
            self.clear();
            self.overflowed = true;
            log::debug!("ByteBuffer::get_space: overflow");
            return None;
        }

        let start = self.cursize;
        self.cursize += length;
        Some(&mut self.data[start..start + length])
    }

    pub fn write_byte(&mut self, b: u8) {
        if let Some(buf) = self.get_space(1) {
            buf[0] = b;
        }
    }

    pub fn write_bool(&mut self, b: bool) {
        self.write_byte(b as u8);
    }

    pub fn write_short(&mut self, s: i16) {
        if let Some(buf) = self.get_space(2) {
            buf.copy_from_slice(&s.to_le_bytes());
        }
    }

    pub fn write_long(&mut self, l: i32) {
        if let Some(buf) = self.get_space(4) {
            buf.copy_from_slice(&l.to_le_bytes());
        }
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_short(v as i16);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_long(v as i32);
    }

    /// Protobuf-compatible unsigned varint: seven bits per byte, low group
    /// first, high bit set on every byte but the last.
    pub fn write_unvarint(&mut self, mut v: u32) {
        loop {
            let out = (v & 0x7F) as u8;
            v >>= 7;
            if v == 0 {
                self.write_byte(out);
                return;
            }
            self.write_byte(out | 0x80);
        }
    }

    /// Zig-zag encoded signed varint.
    pub fn write_varint(&mut self, v: i32) {
        self.write_unvarint(((v << 1) ^ (v >> 31)) as u32);
    }

    /// Null-terminated string. An empty string is a lone terminator.
    pub fn write_string(&mut self, s: &str) {
        let bytes = s.as_bytes();
        if let Some(buf) = self.get_space(bytes.len() + 1) {
            buf[..bytes.len()].copy_from_slice(bytes);
            buf[bytes.len()] = 0;
        }
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) {
        if let Some(buf) = self.get_space(chunk.len()) {
            buf.copy_from_slice(chunk);
        }
    }

    fn take(&mut self, size: usize) -> Option<&[u8]> {
        if self.overflowed {
            return None;
        }
        if self.readpos + size > self.cursize {
            self.overflowed = true;
            return None;
        }
        let start = self.readpos;
        self.readpos += size;
        Some(&self.data[start..start + size])
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub fn next_byte(&mut self) -> Option<u8> {
        if self.overflowed {
            return None;
        }
        if self.readpos + 1 > self.cursize {
            self.overflowed = true;
            return None;
        }
        Some(self.data[self.readpos])
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        self.read_byte().map(|b| b != 0)
    }

    pub fn read_short(&mut self) -> Option<i16> {
        self.take(2).map(|b| i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_long(&mut self) -> Option<i32> {
        self.take(4).map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.read_short().map(|s| s as u16)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.read_long().map(|l| l as u32)
    }

    pub fn read_unvarint(&mut self) -> Option<u32> {
        let mut out = 0u32;
        let mut offset = 0u32;

        loop {
            let b = self.read_byte()?;
            out |= ((b & 0x7F) as u32) << offset;
            offset += 7;

            if b & 0x80 == 0 {
                return Some(out);
            }

            if offset >= 32 {
                self.overflowed = true;
                return None;
            }
        }
    }

    pub fn read_varint(&mut self) -> Option<i32> {
        let uv = self.read_unvarint()?;
        Some(((uv >> 1) as i32) ^ -((uv & 1) as i32))
    }

    pub fn read_chunk(&mut self, size: usize) -> Option<Vec<u8>> {
        self.take(size).map(|b| b.to_vec())
    }

    /// Reads up to the next terminator. An unterminated string overflows
    /// and yields an empty string.
    pub fn read_string(&mut self) -> String {
        if self.overflowed {
            return String::new();
        }
        let begin = self.readpos;
        loop {
            match self.read_byte() {
                Some(0) => break,
                Some(_) => continue,
                None => return String::new(),
            }
        }
        String::from_utf8_lossy(&self.data[begin..self.readpos - 1]).into_owned()
    }

    /// Moves the read cursor. Returns the new position, or 0 with the
    /// overflow flag raised if the target lies outside the written data.
    pub fn set_offset(&mut self, offset: usize, from: Seek) -> usize {
        let target = match from {
            Seek::Set => Some(offset),
            Seek::Current => self.readpos.checked_add(offset),
            Seek::End => self.readpos.checked_sub(offset),
        };

        match target {
            Some(pos) if pos <= self.cursize => {
                self.readpos = pos;
                pos
            }
            _ => {
                self.overflowed = true;
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_roundtrip() {
        let mut buf = ByteBuffer::new(16);
        buf.write_byte(8);
        buf.write_short(1234);
        buf.write_long(1234567);
        buf.write_byte(255);

        assert_eq!(buf.len(), 8);
        assert_eq!(buf.read_byte(), Some(8));
        assert_eq!(buf.read_short(), Some(1234));
        assert_eq!(buf.read_long(), Some(1234567));
        assert_eq!(buf.read_byte(), Some(255));
        assert!(!buf.overflowed());
    }

    #[test]
    fn test_little_endian_layout() {
        let mut buf = ByteBuffer::new(8);
        buf.write_long(0x0403_0201);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_varint_edges() {
        let values = [0, 1, -1, 63, -64, 64, 300, -300, i32::MAX, i32::MIN];
        let mut buf = ByteBuffer::new(128);
        for v in values {
            buf.write_varint(v);
        }
        for v in values {
            assert_eq!(buf.read_varint(), Some(v));
        }
        assert!(!buf.overflowed());
    }

    #[test]
    fn test_varint_matches_protobuf_encoding() {
        let mut buf = ByteBuffer::new(8);
        buf.write_unvarint(300);
        assert_eq!(buf.as_slice(), &[0xAC, 0x02]);

        buf.clear();
        buf.write_varint(-1);
        assert_eq!(buf.as_slice(), &[0x01]);
    }

    #[test]
    fn test_unvarint_size() {
        for v in [0, 127, 128, 16383, 16384, u32::MAX] {
            let mut buf = ByteBuffer::new(8);
            buf.write_unvarint(v);
            assert_eq!(buf.len(), unvarint_size(v));
        }
    }

    #[test]
    fn test_oversized_varint_overflows() {
        let mut buf = ByteBuffer::from_bytes(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert_eq!(buf.read_unvarint(), None);
        assert!(buf.overflowed());
    }

    #[test]
    fn test_write_overflow_clears_buffer() {
        let mut buf = ByteBuffer::new(8);
        buf.write_long(1);
        buf.write_short(2);
        buf.write_long(3);

        assert!(buf.overflowed());
        assert_eq!(buf.len(), 0);

        buf.write_byte(9);
        assert_eq!(buf.len(), 0);

        buf.clear();
        buf.write_byte(9);
        assert_eq!(buf.len(), 1);
        assert!(!buf.overflowed());
    }

    #[test]
    fn test_read_past_end_is_sticky() {
        let mut buf = ByteBuffer::new(8);
        buf.write_short(7);
        assert_eq!(buf.read_long(), None);
        assert!(buf.overflowed());
        assert_eq!(buf.read_chunk(4), None);
        assert_eq!(buf.read_short(), None);
        assert_eq!(buf.read_byte(), None);
        assert_eq!(buf.next_byte(), None);
        assert_eq!(buf.read_unvarint(), None);

        buf.clear();
        buf.write_short(7);
        assert_eq!(buf.read_short(), Some(7));
    }

    #[test]
    fn test_string_after_overflow_is_empty() {
        let mut buf = ByteBuffer::new(16);
        buf.write_string("map01");
        assert_eq!(buf.read_chunk(32), None);
        assert_eq!(buf.read_string(), "");
    }

    #[test]
    fn test_strings() {
        let mut buf = ByteBuffer::new(32);
        buf.write_string("doom2.wad");
        buf.write_string("");
        buf.write_byte(5);

        assert_eq!(buf.read_string(), "doom2.wad");
        assert_eq!(buf.read_string(), "");
        assert_eq!(buf.read_byte(), Some(5));
    }

    #[test]
    fn test_unterminated_string() {
        let mut buf = ByteBuffer::from_bytes(b"abc");
        assert_eq!(buf.read_string(), "");
        assert!(buf.overflowed());
    }

    #[test]
    fn test_set_offset() {
        let mut buf = ByteBuffer::from_bytes(&[1, 2, 3, 4]);
        assert_eq!(buf.set_offset(2, Seek::Set), 2);
        assert_eq!(buf.read_byte(), Some(3));
        assert_eq!(buf.set_offset(2, Seek::End), 1);
        assert_eq!(buf.next_byte(), Some(2));
        assert_eq!(buf.set_offset(9, Seek::Current), 0);
        assert!(buf.overflowed());
    }

    #[test]
    fn test_resize_keeps_data() {
        let mut buf = ByteBuffer::new(4);
        buf.write_short(42);
        buf.resize(16, true);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.read_short(), Some(42));

        buf.resize(1, true);
        assert!(buf.overflowed());
        assert_eq!(buf.len(), 0);
    }
}
