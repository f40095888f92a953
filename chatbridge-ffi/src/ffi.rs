//! Core FFI infrastructure: last-error storage, lock and string helpers, logger, version.

use std::cell::RefCell;
use std::ffi::{CStr, c_char};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::error::BridgeError;

// ---------------------------------------------------------------------------
// Handle type exposed to C
// ---------------------------------------------------------------------------

/// Opaque instance handle as seen by C. `0` means "no instance".
pub type ChatHandle = usize;

// ---------------------------------------------------------------------------
// Thread-local error
// ---------------------------------------------------------------------------

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Store an error message for later retrieval.
pub(crate) fn set_last_error(msg: impl Into<String>) {
    LAST_ERROR.with(|e| *e.borrow_mut() = msg.into());
}

/// Get the length of the last error message (including NUL terminator).
/// Returns 0 if no error.
#[unsafe(no_mangle)]
pub extern "C" fn chatbridge_last_error_length() -> i32 {
    LAST_ERROR.with(|e| {
        let s = e.borrow();
        if s.is_empty() {
            0
        } else {
            i32::try_from(s.len() + 1).unwrap_or(i32::MAX)
        }
    })
}

/// Copy the last error message into `buf`. Returns bytes written (excluding NUL),
/// or -1 if `buf` is null or `buf_len` is not positive. Longer messages are truncated.
///
/// # Safety
///
/// `buf` must point to at least `buf_len` writable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn chatbridge_last_error_message(buf: *mut c_char, buf_len: i32) -> i32 {
    let Ok(capacity) = usize::try_from(buf_len) else {
        return -1;
    };
    if buf.is_null() || capacity == 0 {
        return -1;
    }
    LAST_ERROR.with(|e| {
        let s = e.borrow();
        let bytes = s.as_bytes();
        let copy_len = bytes.len().min(capacity - 1);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.cast::<u8>(), copy_len);
            *buf.add(copy_len) = 0;
        }
        i32::try_from(copy_len).unwrap_or(i32::MAX)
    })
}

// ---------------------------------------------------------------------------
// Error-catching wrapper
// ---------------------------------------------------------------------------

/// Run `f`, record the error message on failure and return its C code (0 = ok).
pub(crate) fn catch<F>(f: F) -> i32
where
    F: FnOnce() -> Result<(), BridgeError>,
{
    match f() {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(e.to_string());
            e.code()
        }
    }
}

// ---------------------------------------------------------------------------
// Locking
// ---------------------------------------------------------------------------

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// String helpers
// ---------------------------------------------------------------------------

/// Borrow a C string as `&str` for the duration of the current call.
///
/// # Safety
///
/// `s` must be null or point to a NUL-terminated string that outlives `'a`.
pub(crate) unsafe fn borrow_c_str<'a>(
    s: *const c_char,
    what: &'static str,
) -> Result<&'a str, BridgeError> {
    if s.is_null() {
        return Err(BridgeError::NullPointer(what));
    }
    unsafe { CStr::from_ptr(s) }
        .to_str()
        .map_err(|_| BridgeError::InvalidUtf8(what))
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

const VERSION: &CStr = match CStr::from_bytes_with_nul(
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes(),
) {
    Ok(v) => v,
    Err(_) => c"unknown",
};

/// Library version string. Static; never free it.
#[unsafe(no_mangle)]
pub extern "C" fn chatbridge_version() -> *const c_char {
    VERSION.as_ptr()
}

// ---------------------------------------------------------------------------
// Logger initialization
// ---------------------------------------------------------------------------

static LOGGER_INIT: OnceLock<()> = OnceLock::new();

/// Install the tracing subscriber for `level` (an `EnvFilter` directive such as
/// "debug" or "chatbridge_ffi=trace"). Only the first call has an effect.
pub fn init_logger(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};
    LOGGER_INIT.get_or_init(|| {
        let filter = EnvFilter::builder().parse_lossy(level);
        // Logs go to stderr so they never mix with a host's stdout protocol.
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .try_init();
    });
}

/// Initialize the tracing logger. Call at most once. `level` is a C string like
/// "debug", "info", "warn", "error", or "off". Pass null for default ("info").
/// Returns 0 on success.
///
/// # Safety
///
/// `level` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn chatbridge_init_logger(level: *const c_char) -> i32 {
    catch(|| {
        let level = if level.is_null() {
            "info"
        } else {
            unsafe { borrow_c_str(level, "level")? }
        };
        init_logger(level);
        Ok(())
    })
}
