//! The engine seam.
//!
//! The chat engine itself (sync loop, room state, network I/O) lives behind
//! [`Engine`]. The boundary only ever asks it to start, to handle a command, to
//! upload media and to stop; payloads are opaque bytes in both directions.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::runtime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::ffi::lock;
use crate::upload::Progress;

/// Boxed, sendable future returned by [`Engine`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Request id carried by events nobody asked for.
pub const UNSOLICITED: i64 = 0;

/// An engine-side failure, described by a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(String);

impl EngineError {
    /// Create an error from any message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// One command as submitted by the caller. `data` is only valid for the call.
#[derive(Debug, Clone, Copy)]
pub struct Command<'a> {
    /// Command name, from the engine's open, string-keyed command set.
    pub name: &'a str,
    /// Correlation id for follow-up events, or [`UNSOLICITED`].
    pub request_id: i64,
    /// Opaque request payload.
    pub data: &'a [u8],
}

/// A media upload request. `params` and `media` are only valid for the call.
#[derive(Debug, Clone, Copy)]
pub struct UploadRequest<'a> {
    /// Correlation id for follow-up events, or [`UNSOLICITED`].
    pub request_id: i64,
    /// Opaque upload parameters.
    pub params: &'a [u8],
    /// Raw media bytes, or `None` when the parameters name a file path.
    pub media: Option<&'a [u8]>,
}

/// The engine's answer to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Command name to report back.
    pub command: Cow<'static, str>,
    /// Opaque response payload.
    pub data: Vec<u8>,
}

impl Reply {
    /// A successful reply reported under `command`.
    pub fn success(command: impl Into<Cow<'static, str>>, data: Vec<u8>) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }

    /// A successful reply whose payload is `value` encoded as JSON.
    pub fn json<T: serde::Serialize + ?Sized>(
        command: impl Into<Cow<'static, str>>,
        value: &T,
    ) -> Self {
        match serde_json::to_vec(value) {
            Ok(data) => Self::success(command, data),
            Err(e) => Self::error(format!("failed to encode response: {e}")),
        }
    }

    /// A failed reply: command `"error"`, payload a JSON string with `message`.
    pub fn error(message: impl fmt::Display) -> Self {
        let message = message.to_string();
        let data = serde_json::to_vec(&message).unwrap_or_else(|_| message.into_bytes());
        Self {
            command: Cow::Borrowed("error"),
            data,
        }
    }

    /// Whether this reply reports a failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.command == "error"
    }
}

/// An engine-originated event on its way to the caller's sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    /// Event name.
    pub command: Cow<'static, str>,
    /// Correlation id, or [`UNSOLICITED`].
    pub request_id: i64,
    /// Opaque payload.
    pub data: Vec<u8>,
}

impl EngineEvent {
    /// An event with an arbitrary correlation id.
    pub fn new(command: impl Into<Cow<'static, str>>, request_id: i64, data: Vec<u8>) -> Self {
        Self {
            command: command.into(),
            request_id,
            data,
        }
    }

    /// An unsolicited event.
    pub fn unsolicited(command: impl Into<Cow<'static, str>>, data: Vec<u8>) -> Self {
        Self::new(command, UNSOLICITED, data)
    }

    /// An event whose payload is `value` encoded as JSON.
    pub fn json<T: serde::Serialize + ?Sized>(
        command: impl Into<Cow<'static, str>>,
        request_id: i64,
        value: &T,
    ) -> Result<Self, EngineError> {
        let data = serde_json::to_vec(value).map_err(|e| EngineError::new(e.to_string()))?;
        Ok(Self::new(command, request_id, data))
    }
}

// ---------------------------------------------------------------------------
// Emitters
// ---------------------------------------------------------------------------

fn closed() -> EngineError {
    EngineError::new("event channel closed")
}

/// Sends the initial state snapshot. Dropping it (or calling [`Self::finish`])
/// marks the snapshot complete; incremental events are delivered only after that.
#[derive(Debug)]
pub struct SnapshotEmitter {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl SnapshotEmitter {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue one snapshot event.
    pub fn emit(&self, event: EngineEvent) -> Result<(), EngineError> {
        self.tx.send(event).map_err(|_| closed())
    }

    /// Mark the snapshot complete.
    pub fn finish(self) {}
}

/// Sends incremental events. Bounded: a slow sink slows the engine down.
///
/// Waiting for room never outlives the instance: once shutdown is signalled,
/// pending and future sends fail.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<EngineEvent>,
    shutdown: Shutdown,
    /// Last task still holding a deferred event, see [`Self::emit_detached`].
    deferred: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventEmitter {
    pub(crate) fn channel(
        capacity: usize,
        shutdown: Shutdown,
    ) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let emitter = Self {
            tx,
            shutdown,
            deferred: Arc::new(Mutex::new(None)),
        };
        (emitter, rx)
    }

    /// Queue one event, waiting for room if the buffer is full.
    ///
    /// # Errors
    ///
    /// Fails if the instance is shutting down or delivery has stopped.
    pub async fn emit(&self, event: EngineEvent) -> Result<(), EngineError> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            biased;
            () = shutdown.requested() => Err(EngineError::new("instance shutting down")),
            sent = self.tx.send(event) => sent.map_err(|_| closed()),
        }
    }

    /// Queue one event without ever waiting for the sink.
    ///
    /// When the buffer is full the event is handed to a runtime task that
    /// waits for room. Events queued this way keep their relative order and
    /// are dropped if the instance shuts down first. Use this from command
    /// handlers, which may be running on the delivery thread itself.
    ///
    /// # Errors
    ///
    /// Fails if delivery has stopped, or if the buffer is full and no tokio
    /// runtime is current.
    pub fn emit_detached(&self, event: EngineEvent) -> Result<(), EngineError> {
        let mut tail = lock(&self.deferred);
        let previous = tail.take().filter(|task| !task.is_finished());
        let event = if previous.is_none() {
            match self.tx.try_send(event) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => return Err(closed()),
                Err(TrySendError::Full(event)) => event,
            }
        } else {
            event
        };
        let rt = runtime::Handle::try_current().map_err(|e| EngineError::new(e.to_string()))?;
        let emitter = self.clone();
        *tail = Some(rt.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if let Err(e) = emitter.emit(event).await {
                tracing::debug!(error = %e, "Dropping deferred event");
            }
        }));
        Ok(())
    }

    /// Queue an event whose payload is `value` encoded as JSON.
    pub async fn emit_json<T: serde::Serialize + Sync + ?Sized>(
        &self,
        command: impl Into<Cow<'static, str>> + Send,
        request_id: i64,
        value: &T,
    ) -> Result<(), EngineError> {
        let event = EngineEvent::json(command, request_id, value)?;
        self.emit(event).await
    }

    /// Queue one event without waiting. Fails if the buffer is full.
    pub fn try_emit(&self, event: EngineEvent) -> Result<(), EngineError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::new("event buffer full"),
            mpsc::error::TrySendError::Closed(_) => closed(),
        })
    }

    /// Whether the delivery side has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Fires once when the instance is being destroyed.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub(crate) fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once shutdown has been requested.
    pub async fn requested(&mut self) {
        // An error means the sender is gone, which only happens on teardown.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// Everything an engine receives when it is started.
#[derive(Debug)]
pub struct EngineContext {
    /// Initial snapshot channel; drop it when the snapshot is complete.
    pub snapshot: SnapshotEmitter,
    /// Incremental event channel; clone freely into background tasks.
    pub events: EventEmitter,
    /// Shutdown signal for background tasks.
    pub shutdown: Shutdown,
}

// ---------------------------------------------------------------------------
// Engine trait
// ---------------------------------------------------------------------------

/// A chat engine driven through the boundary.
///
/// All methods may be called from several threads at once; implementations
/// take care of their own synchronization. Futures run on the registry's
/// tokio runtime.
pub trait Engine: Send + Sync + 'static {
    /// Bring the engine online.
    ///
    /// Returns once setup has succeeded or failed. Background work (the sync
    /// loop, initial snapshot streaming) is spawned onto the current runtime
    /// and must stop when `ctx.shutdown` fires. On error the instance stays
    /// startable, so anything spawned must be wound down again.
    fn start(&self, ctx: EngineContext) -> BoxFuture<'_, Result<(), EngineError>>;

    /// Handle one command. Failures are reported through [`Reply::error`].
    fn submit<'a>(&'a self, command: Command<'a>) -> BoxFuture<'a, Reply>;

    /// Upload media, reporting progress through `progress`.
    fn upload<'a>(
        &'a self,
        request: UploadRequest<'a>,
        progress: &'a Progress<'a>,
    ) -> BoxFuture<'a, Reply>;

    /// Stop background activity. Called once, after shutdown has been signalled.
    fn stop(&self) {}
}
