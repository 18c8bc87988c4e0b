//! LEB128 variable-length integers and a bounds-checked byte reader.
//!
//! Every multi-byte integer on the wire goes through this module, so a
//! truncated or hostile buffer surfaces as a [`ReadError`] instead of a
//! panic or an oversized allocation.

/// Maximum encoded size of a `u64` varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Errors raised while reading encoded data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// Input ended before the value was complete.
    UnexpectedEof,
    /// Varint does not fit in 64 bits.
    VarintOverflow,
    /// A declared length exceeds the bytes actually available.
    LengthOutOfBounds { declared: u64, available: usize },
    /// Payload bytes are not valid UTF-8.
    InvalidUtf8,
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of input"),
            Self::VarintOverflow => write!(f, "varint overflows u64"),
            Self::LengthOutOfBounds { declared, available } => {
                write!(f, "declared length {declared} exceeds {available} available bytes")
            }
            Self::InvalidUtf8 => write!(f, "invalid utf-8 payload"),
        }
    }
}

impl std::error::Error for ReadError {}

/// Append `value` as an unsigned LEB128 varint.
#[inline]
pub fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Append a varint length prefix followed by the raw bytes.
pub fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Try to decode a varint at the start of `bytes` without consuming.
///
/// Returns `Ok(None)` when more input is needed, `Ok(Some((value, len)))`
/// when complete. Used by the frame decoder to peek at length prefixes.
pub fn peek_var_u64(bytes: &[u8]) -> Result<Option<(u64, usize)>, ReadError> {
    let mut value: u64 = 0;
    for (i, &byte) in bytes.iter().enumerate().take(MAX_VARINT_LEN) {
        let chunk = (byte & 0x7F) as u64;
        if i == MAX_VARINT_LEN - 1 && chunk > 1 {
            return Err(ReadError::VarintOverflow);
        }
        value |= chunk << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if bytes.len() >= MAX_VARINT_LEN {
        return Err(ReadError::VarintOverflow);
    }
    Ok(None)
}

/// Cursor over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        let byte = *self.buf.get(self.pos).ok_or(ReadError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_var_u64(&mut self) -> Result<u64, ReadError> {
        match peek_var_u64(&self.buf[self.pos..])? {
            Some((value, len)) => {
                self.pos += len;
                Ok(value)
            }
            None => Err(ReadError::UnexpectedEof),
        }
    }

    /// Read a length that must not exceed the remaining input.
    ///
    /// `unit` is the minimum encoded size of one counted element, so a
    /// count of N elements needs at least `N * unit` bytes to follow.
    pub fn read_len(&mut self, unit: usize) -> Result<usize, ReadError> {
        let declared = self.read_var_u64()?;
        let available = self.remaining();
        let needed = declared.saturating_mul(unit.max(1) as u64);
        if needed > available as u64 {
            return Err(ReadError::LengthOutOfBounds { declared, available });
        }
        Ok(declared as usize)
    }

    /// Read a varint length prefix and that many bytes.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], ReadError> {
        let len = self.read_len(1)?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_str(&mut self) -> Result<&'a str, ReadError> {
        std::str::from_utf8(self.read_bytes()?).map_err(|_| ReadError::InvalidUtf8)
    }
}
