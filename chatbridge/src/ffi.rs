#![allow(unsafe_code)]
//! Internal FFI utilities: RAII owned buffer + C string helpers.

use std::ffi::{CStr, CString, c_char};
use std::{fmt, mem};

use chatbridge_ffi::{ChatOwnedBuffer, chatbridge_free_buffer};

use crate::error::{Error, Result};

/// Bytes handed over by the library. Released exactly once, on drop or by
/// [`into_vec`](Self::into_vec).
pub struct OwnedBuffer {
    raw: ChatOwnedBuffer,
}

// The bytes are never written through a shared reference.
unsafe impl Sync for OwnedBuffer {}

impl OwnedBuffer {
    /// Take ownership of a buffer returned by the C ABI.
    pub(crate) const fn new(raw: ChatOwnedBuffer) -> Self {
        Self { raw }
    }

    /// Borrow the bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { self.raw.as_slice() }
    }

    /// Number of bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        if self.raw.is_empty() { 0 } else { self.raw.length }
    }

    /// Whether there are no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Take the bytes, consuming the buffer.
    #[must_use]
    pub fn into_vec(mut self) -> Vec<u8> {
        let raw = mem::replace(&mut self.raw, ChatOwnedBuffer::empty());
        unsafe { raw.into_vec() }
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        let raw = mem::replace(&mut self.raw, ChatOwnedBuffer::empty());
        unsafe { chatbridge_free_buffer(raw) };
    }
}

impl AsRef<[u8]> for OwnedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedBuffer")
            .field("len", &self.len())
            .finish()
    }
}

/// Convert `&str` to `CString` for FFI.
pub(crate) fn to_c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::InvalidArgument("string contains NUL".into()))
}

/// Read an interned command name. These live for the whole process.
pub(crate) unsafe fn static_name(ptr: *const c_char) -> &'static str {
    if ptr.is_null() {
        return "error";
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().unwrap_or("error")
}
