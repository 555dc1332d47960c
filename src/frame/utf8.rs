use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use core::str;
use std::fmt;

/// Utf8 payload.
#[derive(Debug, Default, Clone, Eq, PartialEq, Hash)]
pub struct Utf8Bytes(Bytes);

impl Utf8Bytes {
    /// Creates from a static str.
    #[inline]
    pub const fn from_static(str: &'static str) -> Self {
        Self(Bytes::from_static(str.as_bytes()))
    }

    /// Returns as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        // SAFETY: is valid utf8
        unsafe { str::from_utf8_unchecked(&self.0) }
    }

    /// Creates from a [`Bytes`] object without checking the encoding.
    ///
    /// # Safety
    ///
    /// The bytes passed in must be valid UTF-8.
    pub unsafe fn from_bytes_unchecked(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl std::ops::Deref for Utf8Bytes {
    type Target = str;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<str> for Utf8Bytes {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for Utf8Bytes {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<Bytes> for Utf8Bytes {
    type Error = str::Utf8Error;

    #[inline]
    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        str::from_utf8(&bytes)?;
        Ok(Self(bytes))
    }
}

impl TryFrom<BytesMut> for Utf8Bytes {
    type Error = str::Utf8Error;

    #[inline]
    fn try_from(bytes: BytesMut) -> Result<Self, Self::Error> {
        bytes.freeze().try_into()
    }
}

impl From<String> for Utf8Bytes {
    #[inline]
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&str> for Utf8Bytes {
    #[inline]
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Utf8Bytes> for Bytes {
    #[inline]
    fn from(Utf8Bytes(bytes): Utf8Bytes) -> Self {
        bytes
    }
}

impl<T> PartialEq<T> for Utf8Bytes
where
    for<'a> &'a str: PartialEq<T>,
{
    #[inline]
    fn eq(&self, other: &T) -> bool {
        self.as_str() == *other
    }
}

/// Incremental UTF-8 stream validation.
///
/// Chunks may split a multi-byte character anywhere; the validator carries
/// the partial character over to the next chunk. This lets TEXT messages
/// fail fast on the first bad fragment without buffering the whole message.
#[derive(Default, Copy, Clone)]
pub struct Utf8Validator {
    incomplete: Option<utf8::Incomplete>,
}

impl Utf8Validator {
    /// Validate the next chunk of the stream.
    pub fn feed(&mut self, mut input: &[u8]) -> Result<()> {
        if let Some(mut incomplete) = self.incomplete.take() {
            match incomplete.try_complete(input) {
                Some((Ok(_), rest)) => input = rest,
                Some((Err(_), _)) => return Err(Error::Utf8),
                None => {
                    // Consumed the whole chunk, character still open.
                    self.incomplete = Some(incomplete);
                    return Ok(());
                }
            }
        }
        match utf8::decode(input) {
            Ok(_) => Ok(()),
            Err(utf8::DecodeError::Incomplete { incomplete_suffix, .. }) => {
                self.incomplete = Some(incomplete_suffix);
                Ok(())
            }
            Err(utf8::DecodeError::Invalid { .. }) => Err(Error::Utf8),
        }
    }

    /// The stream ends here; it must end on a character boundary.
    pub fn finish(&mut self) -> Result<()> {
        if self.incomplete.take().is_some() {
            return Err(Error::Utf8);
        }
        Ok(())
    }
}

impl fmt::Debug for Utf8Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Utf8Validator")
            .field("mid_character", &self.incomplete.is_some())
            .finish()
    }
}
