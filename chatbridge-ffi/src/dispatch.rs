//! Synchronous command dispatch.

use std::ffi::{CStr, c_char};

use crate::buffer::{ChatBorrowedBuffer, ChatOwnedBuffer};
use crate::engine::{Command, Reply, UNSOLICITED};
use crate::error::BridgeError;
use crate::ffi::{ChatHandle, borrow_c_str, set_last_error};
use crate::names;
use crate::registry::{Handle, Registry, global};

/// A command reply as returned through the C ABI.
///
/// The caller owns `buf` and must release it with `chatbridge_free_buffer`.
/// `command` is static; never free it.
#[repr(C)]
#[derive(Debug)]
pub struct ChatResponse {
    /// Response payload.
    pub buf: ChatOwnedBuffer,
    /// Interned command name: the request's name, or `"error"` on failure.
    pub command: *const c_char,
}

/// A command reply on the Rust side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    command: &'static CStr,
    data: Vec<u8>,
}

impl Response {
    /// Intern the engine's reply.
    #[must_use]
    pub fn from_reply(reply: Reply) -> Self {
        Self {
            command: names::intern(&reply.command),
            data: reply.data,
        }
    }

    /// An `"error"` response for a boundary failure. Also records the thread's
    /// last error.
    #[must_use]
    pub fn failure(err: &BridgeError) -> Self {
        set_last_error(err.to_string());
        Self::from_reply(Reply::error(err))
    }

    /// Interned command name.
    #[must_use]
    pub const fn command(&self) -> &'static CStr {
        self.command
    }

    /// Command name as UTF-8.
    #[must_use]
    pub fn command_str(&self) -> &'static str {
        self.command.to_str().unwrap_or("error")
    }

    /// Response payload.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take the payload.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Whether the command failed.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.command == names::ERROR
    }

    /// Hand the response to a C caller.
    #[must_use]
    pub fn into_ffi(self) -> ChatResponse {
        ChatResponse {
            buf: ChatOwnedBuffer::from_vec(self.data),
            command: self.command.as_ptr(),
        }
    }
}

impl Registry {
    /// Run `command` on `handle`, blocking until the engine replies.
    ///
    /// Safe to call from many threads at once. Failures of any kind come back
    /// as an `"error"` response.
    pub fn submit(&self, handle: Handle, command: &str, request_id: i64, payload: &[u8]) -> Response {
        let (instance, runtime) = match self.running(handle) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(%handle, command, error = %e, "Command rejected");
                return Response::failure(&e);
            }
        };
        tracing::debug!(%handle, command, request_id, "Submitting command");
        let reply = runtime.block_on(instance.engine().submit(Command {
            name: command,
            request_id,
            data: payload,
        }));
        Response::from_reply(reply)
    }
}

unsafe fn submit_ffi(
    handle: ChatHandle,
    command: *const c_char,
    request_id: i64,
    payload: ChatBorrowedBuffer,
) -> ChatResponse {
    let result = (|| -> Result<Response, BridgeError> {
        let command = unsafe { borrow_c_str(command, "command")? };
        let payload = unsafe { payload.as_slice()? };
        let handle = Handle::from_raw(handle).ok_or(BridgeError::UnknownHandle(handle))?;
        Ok(global().submit(handle, command, request_id, payload))
    })();
    result
        .unwrap_or_else(|e| Response::failure(&e))
        .into_ffi()
}

/// Run a command and return its response. Follow-up events carry request id 0.
///
/// # Safety
///
/// `command` must be null or a NUL-terminated string, and `payload` must
/// describe readable memory; both only need to stay valid for the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn chatbridge_submit_command(
    handle: ChatHandle,
    command: *const c_char,
    payload: ChatBorrowedBuffer,
) -> ChatResponse {
    unsafe { submit_ffi(handle, command, UNSOLICITED, payload) }
}

/// Run a command whose follow-up events carry `request_id`.
///
/// # Safety
///
/// Same as [`chatbridge_submit_command`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn chatbridge_submit_command_with_id(
    handle: ChatHandle,
    command: *const c_char,
    request_id: i64,
    payload: ChatBorrowedBuffer,
) -> ChatResponse {
    unsafe { submit_ffi(handle, command, request_id, payload) }
}
