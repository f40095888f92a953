#![doc = include_str!("../README.md")]
#![allow(unsafe_code)]

pub mod client;
pub mod error;
pub mod stream;

mod ffi;

// Re-export core public API at crate root.
pub use client::{Client, Response, configure, init_logger, version};
pub use error::{Error, Result};
pub use ffi::OwnedBuffer;
pub use stream::{Event, Subscription};

pub use chatbridge_ffi::BridgeConfig;
