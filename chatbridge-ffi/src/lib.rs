//! `chatbridge-ffi`: C ABI boundary for driving a long-running chat engine.
//!
//! Design principles:
//! - Instances are opaque integer handles looked up in a [`registry::Registry`]; `0` means failure.
//! - Borrowed buffers are read for the duration of a call; owned buffers move to the receiver,
//!   which releases them exactly once with [`chatbridge_free_buffer`].
//! - Command names crossing the boundary are interned and live for the whole process.
//! - Commands and uploads block the calling thread on a runtime shared by all instances.
//! - Events are delivered on a dedicated thread per instance; nothing is delivered after
//!   [`chatbridge_destroy`] returns.
//! - Boundary errors are stored in a thread-local string, retrieved via
//!   [`chatbridge_last_error_message`].
#![allow(unsafe_code)]

mod ffi;

pub mod broadcast;
pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod names;
pub mod registry;
pub mod upload;

pub use broadcast::{ChatEventCallback, ChatEventContextCallback, Delivery, EventSink};
pub use buffer::{ChatBorrowedBuffer, ChatOwnedBuffer, chatbridge_free_buffer};
pub use config::BridgeConfig;
pub use dispatch::{
    ChatResponse, Response, chatbridge_submit_command, chatbridge_submit_command_with_id,
};
pub use engine::{Engine, EngineError};
pub use error::BridgeError;
pub use ffi::{
    ChatHandle, chatbridge_init_logger, chatbridge_last_error_length,
    chatbridge_last_error_message, chatbridge_version, init_logger,
};
pub use registry::{
    Handle, Registry, chatbridge_destroy, chatbridge_init, chatbridge_start,
    chatbridge_start_with_context, global, set_global,
};
pub use upload::{
    ChatProgressCallback, ChatProgressContextCallback, Progress, chatbridge_upload_media,
    chatbridge_upload_media_bytes, chatbridge_upload_media_path,
};
