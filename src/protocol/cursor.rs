//! Resumable decoding primitives.
//!
//! Every primitive either produces a value or reports that more bytes are
//! needed without consuming anything, so a decoder can be re-run on the same
//! buffer once more bytes arrive.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Why a decoding step stopped.
#[derive(Debug)]
pub enum DecodeError {
    /// The buffer ends before the frame does.
    Incomplete,
    /// The bytes violate the protocol.
    Protocol(ProtocolError),
}

impl From<ProtocolError> for DecodeError {
    fn from(e: ProtocolError) -> Self {
        DecodeError::Protocol(e)
    }
}

/// Result of a decoding step.
pub type Step<T> = std::result::Result<T, DecodeError>;

// ==================== Text ====================

/// Position of a line terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEnd {
    /// End of the line content, terminator excluded.
    pub content_end: usize,
    /// Start of the next line.
    pub next: usize,
    /// Whether the terminator was a bare `LF`.
    pub bare_lf: bool,
}

/// Find the end of the first line of `buf`.
pub fn line_end(buf: &[u8]) -> Option<LineEnd> {
    let lf = buf.iter().position(|b| *b == b'\n')?;
    let (content_end, bare_lf) = if lf > 0 && buf[lf - 1] == b'\r' {
        (lf - 1, false)
    } else {
        (lf, true)
    };
    Some(LineEnd {
        content_end,
        next: lf + 1,
        bare_lf,
    })
}

/// Cursor over the text protocol's space separated fields.
#[derive(Debug)]
pub struct TextCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    accept_bare_lf: bool,
}

impl<'a> TextCursor<'a> {
    /// Create a cursor at the start of `buf`.
    pub fn new(buf: &'a [u8], accept_bare_lf: bool) -> Self {
        Self {
            buf,
            pos: 0,
            accept_bare_lf,
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read one field up to a space or the line terminator.
    ///
    /// Returns the field and whether the terminator was reached, or `None`
    /// when neither a space nor a terminator is buffered yet.
    pub fn read_field(&mut self) -> Option<(&'a [u8], bool)> {
        let rest = &self.buf[self.pos..];
        for (i, b) in rest.iter().enumerate() {
            match *b {
                b' ' => {
                    self.pos += i + 1;
                    return Some((&rest[..i], false));
                }
                b'\r' if rest.get(i + 1) == Some(&b'\n') => {
                    self.pos += i + 2;
                    return Some((&rest[..i], true));
                }
                b'\r' if i + 1 == rest.len() => return None,
                b'\n' if self.accept_bare_lf => {
                    self.pos += i + 1;
                    return Some((&rest[..i], true));
                }
                _ => {}
            }
        }
        None
    }

    /// Skip the rest of the current line, terminator included.
    ///
    /// Returns false, consuming nothing, when no terminator is buffered.
    pub fn discard_line(&mut self) -> bool {
        match line_end(&self.buf[self.pos..]) {
            Some(end) => {
                self.pos += end.next;
                true
            }
            None => false,
        }
    }
}

/// Split a line into its non-empty space separated fields.
pub fn split_line(line: &[u8]) -> Vec<&[u8]> {
    line.split(|b| *b == b' ')
        .filter(|f| !f.is_empty())
        .collect()
}

// ==================== Binary ====================

/// Longest valid varint encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Append a LEB128 varint.
pub fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Append a varint length followed by the bytes.
pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

/// Cursor over a binary frame.
#[derive(Debug)]
pub struct BinaryCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BinaryCursor<'a> {
    /// Create a cursor at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes buffered after the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Step<u8> {
        let b = *self.buf.get(self.pos).ok_or(DecodeError::Incomplete)?;
        self.pos += 1;
        Ok(b)
    }

    /// Read a big-endian `u16`.
    pub fn read_u16(&mut self) -> Step<u16> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    /// Read a LEB128 varint.
    pub fn read_varint(&mut self) -> Step<u64> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let b = self.read_u8()?;
            let bits = (b & 0x7f) as u64;
            if i == MAX_VARINT_LEN - 1 && bits > 1 {
                return Err(
                    ProtocolError::InvalidLength("varint overflows 64 bits".to_string()).into(),
                );
            }
            value |= bits << (7 * i);
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::InvalidLength("varint longer than 10 bytes".to_string()).into())
    }

    /// Read a varint that must fit in a `u32`.
    pub fn read_varint_u32(&mut self) -> Step<u32> {
        let value = self.read_varint()?;
        u32::try_from(value).map_err(|_| {
            ProtocolError::InvalidLength(format!("{} does not fit in 32 bits", value)).into()
        })
    }

    /// Read a varint length prefix. Lengths above `hard_limit` desynchronize
    /// the decoder.
    pub fn read_len(&mut self, hard_limit: usize) -> Step<usize> {
        let len = self.read_varint()?;
        if len > hard_limit as u64 {
            return Err(ProtocolError::InvalidLength(format!(
                "length {} exceeds {}",
                len, hard_limit
            ))
            .into());
        }
        Ok(len as usize)
    }

    /// Read `len` raw bytes.
    pub fn read_slice(&mut self, len: usize) -> Step<&'a [u8]> {
        if self.remaining() < len {
            return Err(DecodeError::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self, hard_limit: usize) -> Step<Bytes> {
        let len = self.read_len(hard_limit)?;
        Ok(Bytes::copy_from_slice(self.read_slice(len)?))
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self, hard_limit: usize) -> Step<String> {
        let len = self.read_len(hard_limit)?;
        let raw = self.read_slice(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::Malformed("string is not valid UTF-8".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_read_field() {
        let mut cursor = TextCursor::new(b"get foo\r\n", false);
        assert_eq!(cursor.read_field(), Some((&b"get"[..], false)));
        assert_eq!(cursor.read_field(), Some((&b"foo"[..], true)));
        assert_eq!(cursor.position(), 9);
    }

    #[test]
    fn test_read_field_incomplete() {
        let mut cursor = TextCursor::new(b"get fo", false);
        assert_eq!(cursor.read_field(), Some((&b"get"[..], false)));
        assert_eq!(cursor.read_field(), None);
        assert_eq!(cursor.position(), 4);

        // A trailing CR may be the first half of the terminator.
        let mut cursor = TextCursor::new(b"foo\r", false);
        assert_eq!(cursor.read_field(), None);
    }

    #[test]
    fn test_bare_lf() {
        let mut strict = TextCursor::new(b"foo\n", false);
        assert_eq!(strict.read_field(), None);

        let mut tolerant = TextCursor::new(b"foo\n", true);
        assert_eq!(tolerant.read_field(), Some((&b"foo"[..], true)));
    }

    #[test]
    fn test_discard_line() {
        let mut cursor = TextCursor::new(b"garbage here\r\nget", false);
        assert!(cursor.discard_line());
        assert_eq!(cursor.position(), 14);
        assert!(!cursor.discard_line());
        assert_eq!(cursor.position(), 14);
    }

    #[test]
    fn test_split_line() {
        let fields = split_line(b"set  foo 0 0 3");
        assert_eq!(fields, vec![&b"set"[..], b"foo", b"0", b"0", b"3"]);
    }

    #[test]
    fn test_line_end() {
        assert_eq!(
            line_end(b"ab\r\ncd"),
            Some(LineEnd {
                content_end: 2,
                next: 4,
                bare_lf: false
            })
        );
        assert!(line_end(b"ab\r").is_none());
        assert!(line_end(b"ab\n").unwrap().bare_lf);
    }

    #[test]
    fn test_varint_incomplete() {
        let mut cursor = BinaryCursor::new(&[0x80, 0x80]);
        assert!(matches!(cursor.read_varint(), Err(DecodeError::Incomplete)));
    }

    #[test]
    fn test_varint_too_long() {
        let bytes = [0xffu8; 11];
        let mut cursor = BinaryCursor::new(&bytes);
        assert!(matches!(
            cursor.read_varint(),
            Err(DecodeError::Protocol(ProtocolError::InvalidLength(_)))
        ));
    }

    #[test]
    fn test_length_above_hard_limit() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 1_000);
        let mut cursor = BinaryCursor::new(&buf);
        assert!(matches!(
            cursor.read_len(999),
            Err(DecodeError::Protocol(ProtocolError::InvalidLength(_)))
        ));
    }

    proptest! {
        #[test]
        fn prop_varint(value in any::<u64>()) {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            prop_assert!(buf.len() <= MAX_VARINT_LEN);

            let mut cursor = BinaryCursor::new(&buf);
            prop_assert_eq!(cursor.read_varint().unwrap(), value);
            prop_assert_eq!(cursor.remaining(), 0);
        }
    }
}
