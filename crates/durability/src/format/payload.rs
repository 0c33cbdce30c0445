//! Payload field primitives
//!
//! Payload fields are written back to back with no padding:
//! - integers: fixed-width little-endian
//! - strings: `u32` length + UTF-8 bytes
//! - JSON documents: `u32` length + UTF-8 JSON text
//! - optional fields: one presence byte (0 or 1) then the field

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Error raised while reading payload fields
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// Field extends past the end of the payload
    #[error("payload ended at byte {offset} while reading {field} ({needed} more bytes needed)")]
    UnexpectedEnd {
        /// Field being read
        field: &'static str,
        /// Offset where reading stopped
        offset: usize,
        /// Bytes missing
        needed: usize,
    },

    /// String field is not valid UTF-8
    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 {
        /// Field being read
        field: &'static str,
    },

    /// JSON field failed to parse
    #[error("field {field} is not valid JSON: {message}")]
    InvalidJson {
        /// Field being read
        field: &'static str,
        /// Parser message
        message: String,
    },

    /// Presence byte other than 0 or 1
    #[error("field {field} has invalid presence tag {tag}")]
    InvalidTag {
        /// Field being read
        field: &'static str,
        /// The tag byte
        tag: u8,
    },

    /// Bytes left over after the last field
    #[error("{0} trailing bytes after last payload field")]
    TrailingBytes(usize),
}

/// Append-only payload builder
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a `u8`
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Write a little-endian `u32`
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a little-endian `u64`
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write raw fixed-size bytes
    pub fn put_fixed(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Write a length-prefixed string
    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Write a length-prefixed JSON document.
    ///
    /// Serializing the plain data types used in payloads cannot fail;
    /// a failure would indicate a non-string map key and is written as `null`.
    pub fn put_json<T: Serialize>(&mut self, value: &T) -> &mut Self {
        let json = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
        self.put_u32(json.len() as u32);
        self.buf.extend_from_slice(&json);
        self
    }

    /// Write an optional JSON document with a presence byte
    pub fn put_opt_json<T: Serialize>(&mut self, value: Option<&T>) -> &mut Self {
        match value {
            Some(v) => {
                self.put_u8(1);
                self.put_json(v)
            }
            None => self.put_u8(0),
        }
    }

    /// Finish and return the payload bytes
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over payload bytes
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Start reading at the beginning of `buf`
    pub fn new(buf: &'a [u8]) -> Self {
        PayloadReader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], PayloadError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(PayloadError::UnexpectedEnd {
                field,
                offset: self.pos,
                needed: n - remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a `u8`
    pub fn u8(&mut self, field: &'static str) -> Result<u8, PayloadError> {
        Ok(self.take(1, field)?[0])
    }

    /// Read a little-endian `u32`
    pub fn u32(&mut self, field: &'static str) -> Result<u32, PayloadError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4, field)?);
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read a little-endian `u64`
    pub fn u64(&mut self, field: &'static str) -> Result<u64, PayloadError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8, field)?);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Read `N` raw bytes
    pub fn fixed<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], PayloadError> {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(self.take(N, field)?);
        Ok(bytes)
    }

    /// Read a length-prefixed string
    pub fn string(&mut self, field: &'static str) -> Result<String, PayloadError> {
        let len = self.u32(field)? as usize;
        let bytes = self.take(len, field)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| PayloadError::InvalidUtf8 { field })
    }

    /// Read a length-prefixed JSON document
    pub fn json<T: DeserializeOwned>(&mut self, field: &'static str) -> Result<T, PayloadError> {
        let len = self.u32(field)? as usize;
        let bytes = self.take(len, field)?;
        serde_json::from_slice(bytes).map_err(|e| PayloadError::InvalidJson {
            field,
            message: e.to_string(),
        })
    }

    /// Read an optional JSON document
    pub fn opt_json<T: DeserializeOwned>(
        &mut self,
        field: &'static str,
    ) -> Result<Option<T>, PayloadError> {
        match self.u8(field)? {
            0 => Ok(None),
            1 => self.json(field).map(Some),
            tag => Err(PayloadError::InvalidTag { field, tag }),
        }
    }

    /// Require that every byte was consumed
    pub fn finish(self) -> Result<(), PayloadError> {
        let trailing = self.buf.len() - self.pos;
        if trailing > 0 {
            return Err(PayloadError::TrailingBytes(trailing));
        }
        Ok(())
    }
}
