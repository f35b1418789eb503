//! SSH wire encoding for channel-request payloads
//!
//! Per-channel requests carry their arguments in the SSH wire format:
//! 32-bit big-endian integers, booleans as a single byte, and strings as a
//! 32-bit big-endian length prefix followed by the bytes. This module is the
//! low-level codec; the typed payloads live in [`message`].

mod message;

pub use message::{
    EnvRequest, ExecRequest, ExitSignalMessage, ExitStatusMessage, PtyRequest, SignalRequest,
    SubsystemRequest, WindowChangeRequest, ENV_REQUEST, EXEC_REQUEST, EXIT_SIGNAL, EXIT_STATUS,
    KEEPALIVE_REQUEST, PTY_REQUEST, SHELL_REQUEST, SIGNAL_REQUEST, SUBSYSTEM_REQUEST,
    WINDOW_CHANGE_REQUEST,
};

use thiserror::Error;

/// Maximum length accepted for a single string field, to keep a malformed
/// length prefix from forcing a huge allocation.
pub const MAX_STRING_LEN: u32 = 1024 * 1024;

/// Wire decode/encode errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("payload truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("string length {len} exceeds limit {max}")]
    StringTooLong { len: u32, max: u32 },

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Cursor over a request payload.
///
/// Field reads consume from the front; [`Reader::finish`] asserts the payload
/// was fully consumed, which is how a typed decode rejects oversized input.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated {
                needed: n - self.buf.len(),
            });
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    /// Read a big-endian 32-bit integer.
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a single-byte boolean (zero is false, anything else true).
    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.take(1)?[0] != 0)
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.read_u32()?;
        if len > MAX_STRING_LEN {
            return Err(WireError::StringTooLong {
                len,
                max: MAX_STRING_LEN,
            });
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
    }

    /// Assert the payload has been fully consumed.
    pub fn finish(self) -> Result<(), WireError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes(self.buf.len()))
        }
    }
}

/// Builder for an outgoing payload.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.buf.push(u8::from(value));
        self
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
        self
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
