//! Buffer ownership protocol.
//!
//! Two kinds of byte buffers cross the boundary:
//!
//! - [`ChatBorrowedBuffer`] is memory owned by whoever made the call. The
//!   receiver views it for the duration of that call and nothing more: it is
//!   never stored, written or released.
//! - [`ChatOwnedBuffer`] hands ownership to the receiver, which must release it
//!   exactly once with [`chatbridge_free_buffer`]. The all-zero value is the
//!   empty buffer and releasing it is a no-op.
//!
//! On the Rust side `ChatOwnedBuffer` is move-only, so releasing it consumes
//! the value and a second release does not compile. Debug builds additionally
//! track every live allocation and refuse to release pointers the library does
//! not own.

use std::ptr;

use crate::error::BridgeError;

/// A byte view lent by the caller for the duration of one call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ChatBorrowedBuffer {
    /// Start of the bytes. May be null when `length` is 0.
    pub base: *const u8,
    /// Number of bytes.
    pub length: usize,
}

impl ChatBorrowedBuffer {
    /// The empty buffer.
    pub const EMPTY: Self = Self {
        base: ptr::null(),
        length: 0,
    };

    /// Lend `bytes` across the boundary. The result must not outlive `bytes`.
    #[must_use]
    pub const fn from_slice(bytes: &[u8]) -> Self {
        Self {
            base: bytes.as_ptr(),
            length: bytes.len(),
        }
    }

    /// Whether the buffer has a null base (as opposed to a zero-length view).
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.base.is_null()
    }

    /// View the borrowed bytes.
    ///
    /// # Safety
    ///
    /// `base` must be null or point to `length` readable bytes that stay valid
    /// and unmodified for `'a`, which must not extend past the current call.
    pub unsafe fn as_slice<'a>(&self) -> Result<&'a [u8], BridgeError> {
        if self.length == 0 {
            return Ok(&[]);
        }
        if self.base.is_null() {
            return Err(BridgeError::NullPointer("buffer"));
        }
        Ok(unsafe { std::slice::from_raw_parts(self.base, self.length) })
    }
}

/// A heap byte buffer whose ownership moves to the receiver.
///
/// Release it with [`chatbridge_free_buffer`] exactly once.
#[repr(C)]
#[derive(Debug)]
#[allow(missing_copy_implementations)] // move-only: one value, one release
pub struct ChatOwnedBuffer {
    /// Start of the bytes, or null for the empty buffer.
    pub base: *mut u8,
    /// Number of bytes.
    pub length: usize,
}

unsafe impl Send for ChatOwnedBuffer {}

impl ChatOwnedBuffer {
    /// The empty buffer. Releasing it is a no-op.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            base: ptr::null_mut(),
            length: 0,
        }
    }

    /// Move `data` onto a boundary buffer. Empty data becomes [`Self::empty`].
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        if data.is_empty() {
            return Self::empty();
        }
        let boxed = data.into_boxed_slice();
        let length = boxed.len();
        let base = Box::into_raw(boxed).cast::<u8>();
        tracker::track(base);
        Self { base, length }
    }

    /// Whether this is the empty buffer.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.base.is_null() || self.length == 0
    }

    /// View the bytes without releasing them.
    ///
    /// # Safety
    ///
    /// The buffer must have been produced by this library and not yet released.
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.is_empty() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.base, self.length) }
    }

    /// Take the bytes back, consuming the buffer.
    ///
    /// # Safety
    ///
    /// The buffer must have been produced by [`Self::from_vec`] (directly or
    /// through the C ABI) and not released before.
    #[must_use]
    pub unsafe fn into_vec(self) -> Vec<u8> {
        if self.is_empty() {
            return Vec::new();
        }
        if !tracker::untrack(self.base) {
            tracing::error!(
                ptr = ?self.base,
                len = self.length,
                "Refusing to release a buffer that is not live (double release or foreign pointer)"
            );
            return Vec::new();
        }
        let slice = ptr::slice_from_raw_parts_mut(self.base, self.length);
        unsafe { Box::from_raw(slice) }.into_vec()
    }
}

impl Default for ChatOwnedBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

/// Whether `ptr` is a live buffer handed out by this library.
///
/// Only available in debug builds, where allocations are tracked.
#[cfg(debug_assertions)]
#[must_use]
pub fn is_live(ptr: *const u8) -> bool {
    tracker::contains(ptr)
}

/// Free an owned buffer previously returned by this library.
/// Passing the empty buffer (null base or zero length) is a no-op.
///
/// # Safety
///
/// `buf` must come from this library and must not have been released before.
/// Debug builds detect and ignore a repeated release; release builds do not.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn chatbridge_free_buffer(buf: ChatOwnedBuffer) {
    drop(unsafe { buf.into_vec() });
}

#[cfg(debug_assertions)]
mod tracker {
    use std::collections::HashSet;
    use std::sync::{Mutex, OnceLock};

    use crate::ffi::lock;

    static LIVE: OnceLock<Mutex<HashSet<usize>>> = OnceLock::new();

    fn live() -> &'static Mutex<HashSet<usize>> {
        LIVE.get_or_init(|| Mutex::new(HashSet::new()))
    }

    pub(super) fn track(ptr: *const u8) {
        lock(live()).insert(ptr as usize);
    }

    pub(super) fn untrack(ptr: *const u8) -> bool {
        lock(live()).remove(&(ptr as usize))
    }

    pub(super) fn contains(ptr: *const u8) -> bool {
        lock(live()).contains(&(ptr as usize))
    }
}

#[cfg(not(debug_assertions))]
mod tracker {
    #[inline]
    pub(super) const fn track(_ptr: *const u8) {}

    #[inline]
    pub(super) const fn untrack(_ptr: *const u8) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrowed_empty_and_null() {
        let empty = ChatBorrowedBuffer::EMPTY;
        assert!(empty.is_null());
        assert_eq!(unsafe { empty.as_slice() }.unwrap(), b"");

        let dangling = ChatBorrowedBuffer {
            base: ptr::null(),
            length: 4,
        };
        assert!(matches!(
            unsafe { dangling.as_slice() },
            Err(BridgeError::NullPointer("buffer"))
        ));
    }

    #[test]
    fn borrowed_view_reads_caller_memory() {
        let payload = br#"{"room_id":"!a"}"#.to_vec();
        let buf = ChatBorrowedBuffer::from_slice(&payload);
        assert!(!buf.is_null());
        assert_eq!(unsafe { buf.as_slice() }.unwrap(), payload.as_slice());
    }

    #[test]
    fn empty_vec_becomes_empty_buffer() {
        let buf = ChatOwnedBuffer::from_vec(Vec::new());
        assert!(buf.base.is_null());
        assert_eq!(buf.length, 0);
        unsafe { chatbridge_free_buffer(buf) };
        unsafe { chatbridge_free_buffer(ChatOwnedBuffer::default()) };
    }

    #[test]
    fn owned_buffer_round_trips_bytes() {
        let buf = ChatOwnedBuffer::from_vec(b"pong".to_vec());
        assert_eq!(buf.length, 4);
        assert_eq!(unsafe { buf.as_slice() }, b"pong");
        assert_eq!(unsafe { buf.into_vec() }, b"pong");
    }

    #[cfg(debug_assertions)]
    #[test]
    fn release_clears_tracking() {
        let buf = ChatOwnedBuffer::from_vec(vec![1, 2, 3]);
        let base = buf.base.cast_const();
        assert!(is_live(base));
        unsafe { chatbridge_free_buffer(buf) };
        assert!(!is_live(base));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn release_of_foreign_pointer_is_ignored() {
        let mut stack = [7u8; 16];
        let forged = ChatOwnedBuffer {
            base: stack.as_mut_ptr(),
            length: stack.len(),
        };
        assert!(unsafe { forged.into_vec() }.is_empty());
        assert_eq!(stack, [7u8; 16]);
    }
}
