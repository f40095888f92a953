//! Boundary error type and the C error codes it maps to.

use crate::engine::EngineError;

/// Everything that can go wrong at the boundary itself.
///
/// Logical command failures never show up here; they travel inside the
/// response payload under the `"error"` command name.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The handle was never issued, or its instance has already been destroyed.
    #[error("unknown instance handle {0}")]
    UnknownHandle(usize),

    /// `start` was called on an instance that is already running.
    #[error("instance already started")]
    AlreadyStarted,

    /// The instance was destroyed while the call was in progress.
    #[error("instance has been destroyed")]
    Destroyed,

    /// A command was submitted to an instance that has not been started.
    #[error("instance is not running")]
    NotRunning,

    /// The engine failed to initialize or to come online.
    #[error("engine: {0}")]
    Engine(#[from] EngineError),

    /// A required pointer argument was null.
    #[error("null {0} pointer")]
    NullPointer(&'static str),

    /// A string argument was not valid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// The event delivery thread could not be spawned.
    #[error("failed to spawn event delivery thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The shared runtime could not be created.
    #[error("failed to create runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// `destroy` was called from inside the instance's own event callback.
    #[error("destroy called from the event callback of instance {0}")]
    ReentrantDestroy(usize),

    /// No more handles can be issued.
    #[error("handle space exhausted")]
    HandleSpaceExhausted,
}

impl BridgeError {
    /// Numeric code returned through the C ABI. Never `0`.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::UnknownHandle(_) => 1,
            Self::AlreadyStarted => 2,
            Self::Destroyed => 3,
            Self::Engine(_) => 4,
            Self::NullPointer(_) => 5,
            Self::Spawn(_) => 6,
            Self::NotRunning => 7,
            Self::InvalidUtf8(_) => 8,
            Self::Runtime(_) => 9,
            Self::ReentrantDestroy(_) => 10,
            Self::HandleSpaceExhausted => 11,
        }
    }
}
