#![allow(unsafe_code)]
//! Chat instance client, the primary entry point.

use std::ffi::{CStr, c_void};
use std::sync::mpsc;

use chatbridge_ffi::{BridgeConfig, ChatBorrowedBuffer, ChatResponse, Registry};

use crate::error::{self, Error, Result};
use crate::ffi::{OwnedBuffer, static_name, to_c_string};
use crate::stream::{Event, EventSender, Subscription, event_trampoline};

/// Initialize the library's tracing logger. Only the first call has an effect.
///
/// `level` is a filter directive such as `"debug"`; `None` means `"info"`.
///
/// # Errors
///
/// Fails if `level` contains a NUL byte.
pub fn init_logger(level: Option<&str>) -> Result<()> {
    let c = level.map(to_c_string).transpose()?;
    error::check(unsafe {
        chatbridge_ffi::chatbridge_init_logger(c.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()))
    })
}

/// Library version string.
#[must_use]
pub fn version() -> &'static str {
    let ptr = chatbridge_ffi::chatbridge_version();
    unsafe { CStr::from_ptr(ptr) }.to_str().unwrap_or("unknown")
}

/// Use `config` for every instance in this process instead of the config file.
///
/// Must run before the first [`Client::new`].
///
/// # Errors
///
/// Fails if the library was already configured or used.
pub fn configure(config: BridgeConfig) -> Result<()> {
    chatbridge_ffi::set_global(Registry::loopback(config))
        .map_err(|_| Error::InvalidArgument("chatbridge is already configured".into()))
}

/// A reply to a command or upload.
#[derive(Debug)]
pub struct Response {
    command: &'static str,
    data: OwnedBuffer,
}

impl Response {
    fn from_raw(raw: ChatResponse) -> Self {
        Self {
            command: unsafe { static_name(raw.command) },
            data: OwnedBuffer::new(raw.buf),
        }
    }

    /// The request's name, or `"error"` on failure.
    #[must_use]
    pub const fn command(&self) -> &'static str {
        self.command
    }

    /// Response payload.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Whether the command failed.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.command == "error"
    }

    /// The payload on success.
    ///
    /// # Errors
    ///
    /// Returns the engine's message as [`Error::Command`] for an `"error"` reply.
    pub fn into_result(self) -> Result<OwnedBuffer> {
        if !self.is_error() {
            return Ok(self.data);
        }
        let message = serde_json::from_slice::<String>(self.data.as_bytes())
            .unwrap_or_else(|_| String::from_utf8_lossy(self.data.as_bytes()).into_owned());
        Err(Error::Command(message))
    }
}

unsafe extern "C" fn progress_trampoline<F: Fn(f64) + Sync>(progress: f64, ctx: *mut c_void) {
    let f = unsafe { &*ctx.cast::<F>() };
    f(progress);
}

/// One chat instance. Dropping it destroys the instance.
#[derive(Debug)]
pub struct Client {
    handle: usize,
    events: Option<Box<EventSender>>,
}

impl Client {
    /// Create an instance. It does nothing until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ffi`] if the engine could not be created.
    pub fn new() -> Result<Self> {
        let handle = chatbridge_ffi::chatbridge_init();
        if handle == 0 {
            return Err(error::last_ffi_error());
        }
        Ok(Self {
            handle,
            events: None,
        })
    }

    /// The raw instance handle.
    #[must_use]
    pub const fn handle(&self) -> usize {
        self.handle
    }

    /// Start the instance and subscribe to its events.
    ///
    /// A failed start can be retried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Start`] with the C return code, e.g. 2 when already started.
    pub fn start(&mut self) -> Result<Subscription<Event>> {
        let (tx, rx) = mpsc::channel();
        let tx = Box::new(tx);
        let ctx = std::ptr::from_ref::<EventSender>(&tx)
            .cast_mut()
            .cast::<c_void>();
        let code = unsafe {
            chatbridge_ffi::chatbridge_start_with_context(self.handle, Some(event_trampoline), ctx)
        };
        if code != 0 {
            return Err(Error::Start {
                code,
                message: error::last_ffi_error_message(),
            });
        }
        self.events = Some(tx);
        Ok(Subscription::new(rx))
    }

    /// Run `command` and wait for its reply. Follow-up events carry request id 0.
    ///
    /// Engine failures come back as an `"error"` [`Response`].
    ///
    /// # Errors
    ///
    /// Fails only if `command` contains a NUL byte.
    pub fn submit(&self, command: &str, payload: &[u8]) -> Result<Response> {
        let c = to_c_string(command)?;
        let raw = unsafe {
            chatbridge_ffi::chatbridge_submit_command(
                self.handle,
                c.as_ptr(),
                ChatBorrowedBuffer::from_slice(payload),
            )
        };
        Ok(Response::from_raw(raw))
    }

    /// Run `command`, tagging its follow-up events with `request_id`.
    ///
    /// # Errors
    ///
    /// Fails only if `command` contains a NUL byte.
    pub fn submit_with_id(&self, command: &str, request_id: i64, payload: &[u8]) -> Result<Response> {
        let c = to_c_string(command)?;
        let raw = unsafe {
            chatbridge_ffi::chatbridge_submit_command_with_id(
                self.handle,
                c.as_ptr(),
                request_id,
                ChatBorrowedBuffer::from_slice(payload),
            )
        };
        Ok(Response::from_raw(raw))
    }

    /// Upload the file named by the `path` field of `params`.
    #[must_use]
    pub fn upload_media_path<F: Fn(f64) + Sync>(&self, params: &[u8], progress: F) -> Response {
        self.upload(params, ChatBorrowedBuffer::EMPTY, &progress)
    }

    /// Upload `media`. An empty slice uploads an empty file.
    #[must_use]
    pub fn upload_media_bytes<F: Fn(f64) + Sync>(
        &self,
        params: &[u8],
        media: &[u8],
        progress: F,
    ) -> Response {
        // A slice's pointer is never null, so this always selects bytes mode.
        self.upload(params, ChatBorrowedBuffer::from_slice(media), &progress)
    }

    fn upload<F: Fn(f64) + Sync>(
        &self,
        params: &[u8],
        media: ChatBorrowedBuffer,
        progress: &F,
    ) -> Response {
        let ctx = std::ptr::from_ref(progress).cast_mut().cast::<c_void>();
        let raw = unsafe {
            chatbridge_ffi::chatbridge_upload_media(
                self.handle,
                ChatBorrowedBuffer::from_slice(params),
                media,
                Some(progress_trampoline::<F>),
                ctx,
            )
        };
        Response::from_raw(raw)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // No callback runs after this returns, so the sender can go.
        chatbridge_ffi::chatbridge_destroy(self.handle);
        self.events = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatbridge_ffi::ChatOwnedBuffer;

    fn response(command: &'static CStr, data: &[u8]) -> Response {
        Response::from_raw(ChatResponse {
            buf: ChatOwnedBuffer::from_vec(data.to_vec()),
            command: command.as_ptr(),
        })
    }

    #[test]
    fn error_response_decodes_message() {
        let resp = response(c"error", br#""unknown command \"x\"""#);
        assert!(resp.is_error());
        match resp.into_result() {
            Err(Error::Command(msg)) => assert_eq!(msg, r#"unknown command "x""#),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn success_response_yields_payload() {
        let resp = response(c"ping", b"{}");
        assert_eq!(resp.command(), "ping");
        assert_eq!(resp.into_result().unwrap().into_vec(), b"{}");
    }

    #[test]
    fn version_matches_package() {
        assert_eq!(version(), env!("CARGO_PKG_VERSION"));
    }
}
