//! Bounds-checked, non-copying access to the fields of an NTLM message.
//!
//! NTLM messages consist of a fixed header followed by a payload. Variable-length items live in the
//! payload and are addressed from the header through security buffers, i.e.
//! `(u16 length, u16 allocated length, u32 offset)` triples. Everything read through a
//! [`FieldView`] borrows the underlying buffer.


use crate::Error;


/// A read-only view over the bytes of an NTLM message.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FieldView<'a> {
    buf: &'a [u8],
}

impl<'a> FieldView<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// The number of bytes in the underlying buffer.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The underlying buffer.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }

    /// Returns `length` bytes starting at `at`.
    pub fn slice(&self, at: usize, length: usize) -> Result<&'a [u8], Error> {
        let end = at.checked_add(length)
            .ok_or(Error::Truncated { expected_min_len: usize::MAX, obtained_len: self.buf.len() })?;
        self.buf.get(at..end)
            .ok_or(Error::Truncated { expected_min_len: end, obtained_len: self.buf.len() })
    }

    /// Reads a fixed-size array starting at `at`.
    pub fn read_array<const N: usize>(&self, at: usize) -> Result<[u8; N], Error> {
        let mut ret = [0u8; N];
        ret.copy_from_slice(self.slice(at, N)?);
        Ok(ret)
    }

    /// Reads a little-endian 16-bit integer starting at `at`.
    pub fn read_u16(&self, at: usize) -> Result<u16, Error> {
        self.read_array(at).map(u16::from_le_bytes)
    }

    /// Reads a little-endian 32-bit integer starting at `at`.
    pub fn read_u32(&self, at: usize) -> Result<u32, Error> {
        self.read_array(at).map(u32::from_le_bytes)
    }

    /// Reads the security buffer whose triple starts at `at`.
    pub fn security_buffer(&self, at: usize) -> Result<SecurityBuffer, Error> {
        Ok(SecurityBuffer {
            length: self.read_u16(at)?,
            capacity: self.read_u16(at + 2)?,
            offset: self.read_u32(at + 4)?,
        })
    }

    /// Reads the security buffer whose triple starts at `at` and returns it along with the data it
    /// points to.
    pub fn field(&self, at: usize) -> Result<(SecurityBuffer, &'a [u8]), Error> {
        let sb = self.security_buffer(at)?;
        let data = sb.apply_to_slice(self.buf)?;
        Ok((sb, data))
    }
}


/// An NTLM security buffer, pointing to data contained later in the message.
///
/// The capacity ("allocated length") is carried along but never checked.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SecurityBuffer {
    pub length: u16,
    pub capacity: u16,
    pub offset: u32,
}

impl SecurityBuffer {
    /// Generates a security buffer for data of the given length placed at `offset`.
    pub fn new(length: u16, offset: u32) -> Self {
        Self {
            length,
            capacity: length,
            offset,
        }
    }

    /// Serializes the security buffer into bytes.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut ret = [0u8; 8];
        ret[0..2].copy_from_slice(&self.length.to_le_bytes());
        ret[2..4].copy_from_slice(&self.capacity.to_le_bytes());
        ret[4..8].copy_from_slice(&self.offset.to_le_bytes());
        ret
    }

    /// Applies the security buffer to a whole message, extracting the data itself.
    ///
    /// Empty items resolve to an empty slice wherever their offset points.
    pub fn apply_to_slice<'a>(&self, message: &'a [u8]) -> Result<&'a [u8], Error> {
        if self.length == 0 {
            // short-circuit
            return Ok(&[]);
        }

        let start = usize::try_from(self.offset)
            .or(Err(Error::Truncated { expected_min_len: usize::MAX, obtained_len: message.len() }))?;
        FieldView::new(message).slice(start, usize::from(self.length))
    }
}
