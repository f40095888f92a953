#![allow(unsafe_code)]
//! Channel-based event delivery.
//!
//! [`Client::start`](crate::Client::start) returns a [`Subscription<Event>`]
//! fed from the library's delivery thread. It implements [`Iterator`] for
//! idiomatic consumption and ends when the client is dropped.

use std::ffi::{c_char, c_void};
use std::fmt;
use std::sync::mpsc;
use std::time::Duration;

use chatbridge_ffi::ChatOwnedBuffer;

use crate::ffi::{OwnedBuffer, static_name};

/// A stream of values backed by an internal channel.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub(crate) const fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx }
    }

    /// Block until the next value, or `None` once the sender is gone.
    #[must_use]
    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Non-blocking receive. Returns `None` if nothing is ready.
    #[must_use]
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next value.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl<T> Iterator for Subscription<T> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        self.rx.recv().ok()
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// One event delivered by an instance.
#[derive(Debug)]
pub struct Event {
    /// Event name, e.g. `"sync_status"` or `"send_complete"`.
    pub command: &'static str,
    /// Id of the request that caused the event, `0` if unsolicited.
    pub request_id: i64,
    /// Event payload, usually JSON.
    pub data: OwnedBuffer,
}

pub(crate) type EventSender = mpsc::Sender<Event>;

/// Context-mode event sink. `ctx` is a `*const EventSender` owned by the client.
pub(crate) unsafe extern "C" fn event_trampoline(
    command: *const c_char,
    request_id: i64,
    data: ChatOwnedBuffer,
    ctx: *mut c_void,
) {
    // Own the buffer first so it is released on every path.
    let data = OwnedBuffer::new(data);
    if ctx.is_null() {
        return;
    }
    let tx = unsafe { &*ctx.cast::<EventSender>() };
    let event = Event {
        command: unsafe { static_name(command) },
        request_id,
        data,
    };
    // A dropped subscription discards the event.
    let _ = tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trampoline_forwards_and_owns() {
        let (tx, rx) = mpsc::channel::<Event>();
        let ctx = std::ptr::from_ref(&tx).cast_mut().cast::<c_void>();
        unsafe {
            event_trampoline(
                c"sync_status".as_ptr(),
                7,
                ChatOwnedBuffer::from_vec(br#"{"type":"ok"}"#.to_vec()),
                ctx,
            );
        }
        let sub = Subscription::new(rx);
        let event = sub.try_recv().unwrap();
        assert_eq!(event.command, "sync_status");
        assert_eq!(event.request_id, 7);
        assert_eq!(event.data.as_bytes(), br#"{"type":"ok"}"#);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn closed_subscription_drops_payload() {
        let (tx, rx) = mpsc::channel::<Event>();
        drop(rx);
        let ctx = std::ptr::from_ref(&tx).cast_mut().cast::<c_void>();
        unsafe {
            event_trampoline(
                c"init_complete".as_ptr(),
                0,
                ChatOwnedBuffer::from_vec(vec![1, 2, 3]),
                ctx,
            );
        }
    }
}
