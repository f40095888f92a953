//! Event delivery.
//!
//! Each running instance owns one delivery thread. The thread pulls events off
//! the instance's channels and hands them to the registered [`EventSink`]. The
//! sink always runs outside the runtime, so it may call back into the library
//! (submit a command, upload media) without nesting runtimes.

use std::cell::Cell;
use std::ffi::{CStr, c_char, c_void};
use std::io;
use std::thread::{self, JoinHandle};

use tokio::runtime;
use tokio::sync::{mpsc, watch};

use crate::buffer::ChatOwnedBuffer;
use crate::engine::EngineEvent;
use crate::names;

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Event sink without context. The callee owns `data` and must release it with
/// `chatbridge_free_buffer`. `command` is static; never free it.
pub type ChatEventCallback =
    Option<unsafe extern "C" fn(command: *const c_char, request_id: i64, data: ChatOwnedBuffer)>;

/// Event sink with an opaque caller context.
pub type ChatEventContextCallback = Option<
    unsafe extern "C" fn(
        command: *const c_char,
        request_id: i64,
        data: ChatOwnedBuffer,
        ctx: *mut c_void,
    ),
>;

/// One event as handed to a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Interned event name.
    pub command: &'static CStr,
    /// Correlation id, `0` for unsolicited events.
    pub request_id: i64,
    /// Event payload.
    pub data: Vec<u8>,
}

impl Delivery {
    /// The event name as UTF-8.
    #[must_use]
    pub fn command_str(&self) -> &'static str {
        self.command.to_str().unwrap_or("error")
    }
}

/// Receives the events of one instance, one at a time, on its delivery thread.
pub trait EventSink: Send + 'static {
    /// Handle one event.
    fn deliver(&mut self, delivery: Delivery);
}

impl<F> EventSink for F
where
    F: FnMut(Delivery) + Send + 'static,
{
    fn deliver(&mut self, delivery: Delivery) {
        self(delivery);
    }
}

/// A C function pointer sink.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CEventSink {
    Plain(unsafe extern "C" fn(*const c_char, i64, ChatOwnedBuffer)),
    Context(
        unsafe extern "C" fn(*const c_char, i64, ChatOwnedBuffer, *mut c_void),
        usize,
    ),
}

impl EventSink for CEventSink {
    fn deliver(&mut self, delivery: Delivery) {
        let command = delivery.command.as_ptr();
        let data = ChatOwnedBuffer::from_vec(delivery.data);
        match *self {
            Self::Plain(cb) => unsafe { cb(command, delivery.request_id, data) },
            Self::Context(cb, ctx) => unsafe {
                cb(command, delivery.request_id, data, ctx as *mut c_void);
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery thread
// ---------------------------------------------------------------------------

thread_local! {
    static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

/// Raw handle of the instance whose delivery thread this is, if any.
pub(crate) fn delivering_for() -> Option<usize> {
    let raw = DELIVERING.with(Cell::get);
    (raw != 0).then_some(raw)
}

/// Channels feeding one delivery thread.
pub(crate) struct Feed {
    pub(crate) snapshot: mpsc::UnboundedReceiver<EngineEvent>,
    pub(crate) events: mpsc::Receiver<EngineEvent>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

/// Owns the delivery thread of one instance.
#[derive(Debug)]
pub(crate) struct Broadcaster {
    thread: Option<JoinHandle<()>>,
}

impl Broadcaster {
    /// Spawn the delivery thread for the instance with raw handle `handle`.
    pub(crate) fn spawn(
        handle: usize,
        runtime: runtime::Handle,
        feed: Feed,
        sink: Box<dyn EventSink>,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name("chatbridge-events".into())
            .spawn(move || {
                DELIVERING.with(|d| d.set(handle));
                run(&runtime, feed, sink);
                tracing::debug!(handle, "Event delivery stopped");
            })?;
        Ok(Self {
            thread: Some(thread),
        })
    }

    /// Wait for the delivery thread to exit. Shutdown must already be signalled.
    pub(crate) fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.join().is_err() {
            tracing::error!("Event sink panicked");
        }
    }
}

fn run(runtime: &runtime::Handle, feed: Feed, mut sink: Box<dyn EventSink>) {
    let Feed {
        snapshot,
        mut events,
        mut shutdown,
    } = feed;
    let mut snapshot = Some(snapshot);
    loop {
        let next = runtime.block_on(async {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => None,
                event = next_event(&mut snapshot, &mut events) => event,
            }
        });
        let Some(event) = next else {
            break;
        };
        if *shutdown.borrow() {
            break;
        }
        tracing::trace!(command = %event.command, request_id = event.request_id, "Delivering event");
        sink.deliver(Delivery {
            command: names::intern(&event.command),
            request_id: event.request_id,
            data: event.data,
        });
    }
}

/// The snapshot channel is drained until the engine closes it; only then are
/// incremental events taken.
async fn next_event(
    snapshot: &mut Option<mpsc::UnboundedReceiver<EngineEvent>>,
    events: &mut mpsc::Receiver<EngineEvent>,
) -> Option<EngineEvent> {
    if let Some(rx) = snapshot {
        match rx.recv().await {
            Some(event) => return Some(event),
            None => {
                tracing::debug!("Initial snapshot delivered");
                *snapshot = None;
            }
        }
    }
    events.recv().await
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;

    use super::*;
    use crate::engine::{EventEmitter, Shutdown, SnapshotEmitter};

    struct Rig {
        _rt: tokio::runtime::Runtime,
        snapshot: SnapshotEmitter,
        events: EventEmitter,
        stop: watch::Sender<bool>,
        broadcaster: Broadcaster,
        seen: std_mpsc::Receiver<Delivery>,
    }

    fn rig(capacity: usize) -> Rig {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (snapshot, snapshot_rx) = SnapshotEmitter::channel();
        let (stop, engine_shutdown) = Shutdown::channel();
        let shutdown = stop.subscribe();
        let (events, events_rx) = EventEmitter::channel(capacity, engine_shutdown);
        let (tx, seen) = std_mpsc::channel();
        let broadcaster = Broadcaster::spawn(
            42,
            rt.handle().clone(),
            Feed {
                snapshot: snapshot_rx,
                events: events_rx,
                shutdown,
            },
            Box::new(move |d: Delivery| {
                assert_eq!(delivering_for(), Some(42));
                tx.send(d).unwrap();
            }),
        )
        .unwrap();
        Rig {
            _rt: rt,
            snapshot,
            events,
            stop,
            broadcaster,
            seen,
        }
    }

    #[test]
    fn snapshot_is_delivered_before_incremental_events() {
        let mut r = rig(8);
        r.events
            .try_emit(EngineEvent::unsolicited("sync_status", b"live".to_vec()))
            .unwrap();
        r.snapshot
            .emit(EngineEvent::unsolicited("client_state", b"{}".to_vec()))
            .unwrap();
        r.snapshot
            .emit(EngineEvent::unsolicited("init_complete", Vec::new()))
            .unwrap();
        r.snapshot.finish();

        let names: Vec<_> = (0..3)
            .map(|_| r.seen.recv().unwrap().command_str())
            .collect();
        assert_eq!(names, ["client_state", "init_complete", "sync_status"]);

        r.stop.send(true).unwrap();
        r.broadcaster.join();
    }

    #[test]
    fn nothing_is_delivered_after_shutdown() {
        let mut r = rig(8);
        r.snapshot.emit(EngineEvent::unsolicited("client_state", Vec::new())).unwrap();
        assert_eq!(r.seen.recv().unwrap().command_str(), "client_state");

        r.stop.send(true).unwrap();
        r.broadcaster.join();
        // The receiver side is gone with the thread.
        assert!(r.events.try_emit(EngineEvent::unsolicited("late", Vec::new())).is_err());
        assert!(r.seen.try_recv().is_err());
        assert_eq!(delivering_for(), None);
    }

    #[test]
    fn correlated_events_keep_their_request_id() {
        let mut r = rig(4);
        r.snapshot.finish();
        r.events
            .try_emit(EngineEvent::new("send_complete", 7, b"{}".to_vec()))
            .unwrap();
        let d = r.seen.recv().unwrap();
        assert_eq!(d.command_str(), "send_complete");
        assert_eq!(d.request_id, 7);
        r.stop.send(true).unwrap();
        r.broadcaster.join();
    }
}
