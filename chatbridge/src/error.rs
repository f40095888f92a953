#![allow(unsafe_code)]
//! Unified error type for the safe client.

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the chatbridge client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error reported by the C ABI through its last-error string.
    #[error("chatbridge ffi: {0}")]
    Ffi(String),

    /// Starting the instance failed; the instance can be started again.
    #[error("start failed (code {code}): {message}")]
    Start {
        /// Nonzero code returned by `chatbridge_start_with_context`.
        code: i32,
        /// Last-error message recorded for the failure.
        message: String,
    },

    /// The engine answered a command with an `"error"` response.
    #[error("command failed: {0}")]
    Command(String),

    /// An argument passed to the client was invalid.
    #[error("{0}")]
    InvalidArgument(String),
}

/// Read the last FFI error message from thread-local storage.
pub(crate) fn last_ffi_error_message() -> String {
    let len = chatbridge_ffi::chatbridge_last_error_length();
    let Ok(capacity) = usize::try_from(len) else {
        return "unknown FFI error".into();
    };
    if capacity == 0 {
        return "unknown FFI error".into();
    }
    let mut buf = vec![0u8; capacity];
    let written =
        unsafe { chatbridge_ffi::chatbridge_last_error_message(buf.as_mut_ptr().cast(), len) };
    let Ok(written) = usize::try_from(written) else {
        return "failed to read FFI error".into();
    };
    String::from_utf8_lossy(&buf[..written]).into_owned()
}

/// The last FFI error as an [`Error`].
pub(crate) fn last_ffi_error() -> Error {
    Error::Ffi(last_ffi_error_message())
}

/// Check an FFI return code. `0` = success.
#[inline]
pub(crate) fn check(rc: i32) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(last_ffi_error())
    }
}
