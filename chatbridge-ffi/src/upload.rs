//! Media uploads with progress reporting.
//!
//! An upload is a command whose reply may take a while. The caller's progress
//! sink is wrapped in a [`Progress`] gate that lives on the calling thread's
//! stack for the duration of the call, so nothing can report progress once the
//! call has returned.

use std::ffi::c_void;
use std::sync::Mutex;

use crate::buffer::ChatBorrowedBuffer;
use crate::dispatch::{ChatResponse, Response};
use crate::engine::{UNSOLICITED, UploadRequest};
use crate::error::BridgeError;
use crate::ffi::{ChatHandle, lock};
use crate::registry::{Handle, Registry, global};

/// Progress sink without context. Receives a percentage in `[0, 100]`.
pub type ChatProgressCallback = Option<unsafe extern "C" fn(progress: f64)>;

/// Progress sink with an opaque caller context.
pub type ChatProgressContextCallback = Option<unsafe extern "C" fn(progress: f64, ctx: *mut c_void)>;

/// Gate between the engine and the caller's progress sink.
///
/// Values are clamped to `[0, 100]`; NaN and values below the last reported
/// one are dropped. The sink is called with the gate's lock held, so calls
/// never overlap even if the engine reports from several tasks.
pub struct Progress<'a> {
    last: Mutex<Option<f64>>,
    sink: Option<&'a (dyn Fn(f64) + Sync)>,
}

impl<'a> Progress<'a> {
    /// Wrap `sink`.
    pub fn new(sink: &'a (dyn Fn(f64) + Sync)) -> Self {
        Self {
            last: Mutex::new(None),
            sink: Some(sink),
        }
    }

    /// A gate that reports nowhere.
    #[must_use]
    pub const fn silent() -> Self {
        Self {
            last: Mutex::new(None),
            sink: None,
        }
    }

    /// Report `value` percent.
    pub fn report(&self, value: f64) {
        if value.is_nan() {
            return;
        }
        let value = value.clamp(0.0, 100.0);
        let mut last = lock(&self.last);
        if last.is_some_and(|prev| value < prev) {
            return;
        }
        *last = Some(value);
        if let Some(sink) = self.sink {
            sink(value);
        }
    }

    /// The last value passed through to the sink.
    #[must_use]
    pub fn last(&self) -> Option<f64> {
        *lock(&self.last)
    }
}

impl std::fmt::Debug for Progress<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("last", &self.last())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl Registry {
    /// Run an upload on `handle`, blocking until the engine replies.
    ///
    /// `media` of `None` means the parameters name a file path to read.
    pub fn upload_media(
        &self,
        handle: Handle,
        request_id: i64,
        params: &[u8],
        media: Option<&[u8]>,
        progress: &(dyn Fn(f64) + Sync),
    ) -> Response {
        let gate = Progress::new(progress);
        self.upload_with(handle, request_id, params, media, &gate)
    }

    fn upload_with(
        &self,
        handle: Handle,
        request_id: i64,
        params: &[u8],
        media: Option<&[u8]>,
        gate: &Progress<'_>,
    ) -> Response {
        let (instance, runtime) = match self.running(handle) {
            Ok(found) => found,
            Err(e) => return Response::failure(&e),
        };
        let request = UploadRequest {
            request_id,
            params,
            media,
        };
        tracing::debug!(
            %handle,
            request_id,
            mode = if media.is_some() { "bytes" } else { "path" },
            "Uploading media"
        );
        let reply = runtime.block_on(instance.engine().upload(request, gate));
        Response::from_reply(reply)
    }
}

// ---------------------------------------------------------------------------
// C ABI
// ---------------------------------------------------------------------------

/// Raw progress callback, shareable across runtime threads.
#[derive(Clone, Copy)]
enum CProgress {
    Plain(unsafe extern "C" fn(f64)),
    Context(unsafe extern "C" fn(f64, *mut c_void), usize),
}

impl CProgress {
    fn call(self, value: f64) {
        match self {
            Self::Plain(cb) => unsafe { cb(value) },
            Self::Context(cb, ctx) => unsafe { cb(value, ctx as *mut c_void) },
        }
    }
}

fn with_progress<R>(progress: Option<CProgress>, f: impl FnOnce(&(dyn Fn(f64) + Sync)) -> R) -> R {
    match progress {
        Some(p) => f(&move |v| p.call(v)),
        None => f(&|_| {}),
    }
}

unsafe fn upload_ffi(
    handle: ChatHandle,
    params: ChatBorrowedBuffer,
    media: Option<ChatBorrowedBuffer>,
    progress: Option<CProgress>,
) -> ChatResponse {
    let result = (|| -> Result<Response, BridgeError> {
        let params = unsafe { params.as_slice()? };
        let media = match media {
            Some(buf) => Some(unsafe { buf.as_slice()? }),
            None => None,
        };
        let handle = Handle::from_raw(handle).ok_or(BridgeError::UnknownHandle(handle))?;
        let registry = global();
        Ok(with_progress(progress, |sink| {
            registry.upload_media(handle, UNSOLICITED, params, media, sink)
        }))
    })();
    result
        .unwrap_or_else(|e| Response::failure(&e))
        .into_ffi()
}

fn plain(cb: ChatProgressCallback) -> Option<CProgress> {
    cb.map(CProgress::Plain)
}

/// Upload the file named by the `path` field of `params`.
///
/// # Safety
///
/// `params` must describe readable memory valid for the call. `progress`, if
/// non-null, must be safe to call from any thread until this function returns.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn chatbridge_upload_media_path(
    handle: ChatHandle,
    params: ChatBorrowedBuffer,
    progress: ChatProgressCallback,
) -> ChatResponse {
    unsafe { upload_ffi(handle, params, None, plain(progress)) }
}

/// Upload the bytes in `media`. A zero-length `media` uploads an empty file.
///
/// # Safety
///
/// `params` and `media` must describe readable memory valid for the call.
/// `progress`, if non-null, must be safe to call from any thread until this
/// function returns.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn chatbridge_upload_media_bytes(
    handle: ChatHandle,
    params: ChatBorrowedBuffer,
    media: ChatBorrowedBuffer,
    progress: ChatProgressCallback,
) -> ChatResponse {
    unsafe { upload_ffi(handle, params, Some(media), plain(progress)) }
}

/// Upload media, passing `ctx` to every progress call.
///
/// A `media` buffer with a null base selects path mode: the file named by the
/// `path` field of `params` is read. Otherwise the buffer's bytes are uploaded.
///
/// # Safety
///
/// `params` and `media` must describe readable memory valid for the call.
/// `progress`, if non-null, must be safe to call from any thread with `ctx`
/// until this function returns.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn chatbridge_upload_media(
    handle: ChatHandle,
    params: ChatBorrowedBuffer,
    media: ChatBorrowedBuffer,
    progress: ChatProgressContextCallback,
    ctx: *mut c_void,
) -> ChatResponse {
    let media = (!media.is_null()).then_some(media);
    let progress = progress.map(|cb| CProgress::Context(cb, ctx as usize));
    unsafe { upload_ffi(handle, params, media, progress) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded(values: &[f64]) -> Vec<f64> {
        let seen = Mutex::new(Vec::new());
        {
            let sink = |v: f64| seen.lock().unwrap().push(v);
            let gate = Progress::new(&sink);
            for v in values {
                gate.report(*v);
            }
        }
        seen.into_inner().unwrap()
    }

    #[test]
    fn gate_clamps_and_drops_regressions() {
        assert_eq!(
            recorded(&[10.0, 150.0, 20.0, f64::NAN, -5.0, 100.0]),
            vec![10.0, 100.0, 100.0]
        );
    }

    #[test]
    fn gate_clamps_negative_first_value() {
        assert_eq!(recorded(&[-5.0, 0.0, 50.0]), vec![0.0, 0.0, 50.0]);
    }

    #[test]
    fn silent_gate_tracks_last_value() {
        let gate = Progress::silent();
        assert_eq!(gate.last(), None);
        gate.report(42.0);
        gate.report(12.0);
        assert_eq!(gate.last(), Some(42.0));
    }

    static PLAIN_SEEN: Mutex<Vec<f64>> = Mutex::new(Vec::new());

    unsafe extern "C" fn record_plain(v: f64) {
        PLAIN_SEEN.lock().unwrap().push(v);
    }

    #[test]
    fn plain_callback_is_forwarded() {
        let p = plain(Some(record_plain)).unwrap();
        p.call(33.0);
        assert_eq!(*PLAIN_SEEN.lock().unwrap(), vec![33.0]);
        assert!(plain(None).is_none());
    }
}
