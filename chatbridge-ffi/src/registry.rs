//! Instance registry and lifecycle.
//!
//! Handles are opaque integers looked up in a table; they are never turned
//! back into addresses. The registry also owns the tokio runtime shared by all
//! of its instances: it is built by the first `init` and shut down when the
//! last instance is destroyed.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::mem::ManuallyDrop;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::runtime::{self, Runtime};
use tokio::sync::watch;

use crate::broadcast::{
    Broadcaster, CEventSink, ChatEventCallback, ChatEventContextCallback, EventSink, Feed,
    delivering_for,
};
use crate::config::BridgeConfig;
use crate::engine::{Engine, EngineContext, EngineError, EventEmitter, Shutdown, SnapshotEmitter};
use crate::error::BridgeError;
use crate::ffi::{ChatHandle, catch, lock, set_last_error};
use crate::loopback::LoopbackEngine;

/// A live instance handle. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroUsize);

impl Handle {
    /// Interpret a raw C handle. `0` is never a handle.
    #[must_use]
    pub const fn from_raw(raw: ChatHandle) -> Option<Self> {
        match NonZeroUsize::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// The raw C value.
    #[must_use]
    pub const fn as_raw(self) -> ChatHandle {
        self.0.get()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Builds one engine per `init`.
pub type EngineFactory =
    Box<dyn Fn(&BridgeConfig) -> Result<Arc<dyn Engine>, EngineError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Shared runtime
// ---------------------------------------------------------------------------

/// The registry's runtime. Dropped without waiting for blocking tasks.
#[derive(Debug)]
pub(crate) struct SharedRuntime(ManuallyDrop<Runtime>);

impl SharedRuntime {
    fn build(worker_threads: usize) -> Result<Self, BridgeError> {
        let rt = runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("chatbridge-worker")
            .enable_all()
            .build()
            .map_err(BridgeError::Runtime)?;
        Ok(Self(ManuallyDrop::new(rt)))
    }

    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.0.block_on(future)
    }

    pub(crate) fn handle(&self) -> &runtime::Handle {
        self.0.handle()
    }
}

impl Drop for SharedRuntime {
    fn drop(&mut self) {
        // SAFETY: the runtime is not touched again after this.
        let rt = unsafe { ManuallyDrop::take(&mut self.0) };
        rt.shutdown_background();
        tracing::debug!("Runtime shut down");
    }
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

const INITIALIZED: u8 = 0;
const RUNNING: u8 = 1;
const DESTROYED: u8 = 2;

/// Start/destroy state, guarded by the instance's lifecycle lock.
#[derive(Debug, Default)]
struct Lifecycle {
    shutdown: Option<watch::Sender<bool>>,
    broadcaster: Option<Broadcaster>,
}

/// One engine instance behind a handle.
pub(crate) struct Instance {
    handle: Handle,
    engine: Arc<dyn Engine>,
    phase: AtomicU8,
    lifecycle: Mutex<Lifecycle>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle)
            .field("phase", &self.phase.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub(crate) fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    fn check_running(&self) -> Result<(), BridgeError> {
        match self.phase.load(Ordering::Acquire) {
            RUNNING => Ok(()),
            INITIALIZED => Err(BridgeError::NotRunning),
            _ => Err(BridgeError::Destroyed),
        }
    }

    fn start(
        &self,
        runtime: &SharedRuntime,
        event_buffer: usize,
        sink: Box<dyn EventSink>,
    ) -> Result<(), BridgeError> {
        let mut life = lock(&self.lifecycle);
        match self.phase.load(Ordering::Acquire) {
            INITIALIZED => {}
            RUNNING => return Err(BridgeError::AlreadyStarted),
            _ => return Err(BridgeError::Destroyed),
        }

        let (snapshot, snapshot_rx) = SnapshotEmitter::channel();
        let (stop, shutdown) = Shutdown::channel();
        let (events, events_rx) = EventEmitter::channel(event_buffer, shutdown.clone());
        let feed = Feed {
            snapshot: snapshot_rx,
            events: events_rx,
            shutdown: stop.subscribe(),
        };
        let ctx = EngineContext {
            snapshot,
            events,
            shutdown,
        };

        if let Err(e) = runtime.block_on(self.engine.start(ctx)) {
            let _ = stop.send(true);
            tracing::warn!(handle = %self.handle, error = %e, "Engine setup failed");
            return Err(e.into());
        }

        // Running before the first delivery, so a sink may submit right away.
        self.phase.store(RUNNING, Ordering::Release);
        let broadcaster =
            match Broadcaster::spawn(self.handle.as_raw(), runtime.handle().clone(), feed, sink) {
                Ok(b) => b,
                Err(e) => {
                    self.phase.store(INITIALIZED, Ordering::Release);
                    let _ = stop.send(true);
                    self.engine.stop();
                    return Err(BridgeError::Spawn(e));
                }
            };

        life.shutdown = Some(stop);
        life.broadcaster = Some(broadcaster);
        tracing::info!(handle = %self.handle, "Instance running");
        Ok(())
    }

    fn shutdown(&self) {
        let mut life = lock(&self.lifecycle);
        let was = self.phase.swap(DESTROYED, Ordering::AcqRel);
        if let Some(stop) = life.shutdown.take() {
            let _ = stop.send(true);
        }
        if was == RUNNING {
            self.engine.stop();
        }
        if let Some(mut broadcaster) = life.broadcaster.take() {
            broadcaster.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Table {
    instances: HashMap<Handle, Arc<Instance>>,
    runtime: Option<Arc<SharedRuntime>>,
    next_id: usize,
}

/// Maps handles to engine instances.
pub struct Registry {
    config: Arc<BridgeConfig>,
    factory: EngineFactory,
    table: Mutex<Table>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = lock(&self.table).instances.len();
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("live", &live)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// A registry whose instances are built by `factory`.
    #[must_use]
    pub fn new(config: BridgeConfig, factory: EngineFactory) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            table: Mutex::new(Table {
                instances: HashMap::new(),
                runtime: None,
                next_id: 1,
            }),
        }
    }

    /// A registry backed by the built-in loopback engine.
    #[must_use]
    pub fn loopback(config: BridgeConfig) -> Self {
        Self::new(
            config,
            Box::new(|cfg: &BridgeConfig| Ok(Arc::new(LoopbackEngine::new(cfg)) as Arc<dyn Engine>)),
        )
    }

    /// The configuration passed to every engine.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Number of live instances.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.table).instances.len()
    }

    /// Whether no instance is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create an inert instance.
    ///
    /// # Errors
    ///
    /// Fails if the engine cannot be built, the runtime cannot be created or
    /// handles have run out.
    pub fn init(&self) -> Result<Handle, BridgeError> {
        tracing::info!("Starting chatbridge FFI");
        let engine = (self.factory)(&self.config)?;

        let mut table = lock(&self.table);
        let handle = Handle::from_raw(table.next_id).ok_or(BridgeError::HandleSpaceExhausted)?;
        if table.runtime.is_none() {
            let rt = SharedRuntime::build(self.config.worker_threads)?;
            table.runtime = Some(Arc::new(rt));
        }
        table.next_id = handle.as_raw().checked_add(1).unwrap_or(0);
        table.instances.insert(
            handle,
            Arc::new(Instance {
                handle,
                engine,
                phase: AtomicU8::new(INITIALIZED),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        );
        drop(table);

        tracing::info!(%handle, "Initialization complete");
        Ok(handle)
    }

    fn lookup(&self, handle: Handle) -> Result<(Arc<Instance>, Arc<SharedRuntime>), BridgeError> {
        let table = lock(&self.table);
        let instance = table
            .instances
            .get(&handle)
            .cloned()
            .ok_or(BridgeError::UnknownHandle(handle.as_raw()))?;
        let runtime = table
            .runtime
            .clone()
            .ok_or(BridgeError::UnknownHandle(handle.as_raw()))?;
        Ok((instance, runtime))
    }

    /// Look up a running instance for a command or upload.
    pub(crate) fn running(
        &self,
        handle: Handle,
    ) -> Result<(Arc<Instance>, Arc<SharedRuntime>), BridgeError> {
        let (instance, runtime) = self.lookup(handle)?;
        instance.check_running()?;
        Ok((instance, runtime))
    }

    /// Bring the instance online and start delivering its events to `sink`.
    ///
    /// On failure the instance stays startable.
    ///
    /// # Errors
    ///
    /// Fails for unknown handles, instances already started or destroyed,
    /// engine setup failures and delivery thread spawn failures.
    pub fn start(&self, handle: Handle, sink: Box<dyn EventSink>) -> Result<(), BridgeError> {
        let (instance, runtime) = self.lookup(handle)?;
        instance.start(&runtime, self.config.event_buffer, sink)
    }

    /// Shut the instance down and forget the handle.
    ///
    /// Blocks until any in-flight event delivery has finished; no event is
    /// delivered after this returns. Commands already in progress complete
    /// normally.
    ///
    /// # Errors
    ///
    /// Fails for unknown handles, and when called from the instance's own
    /// event sink.
    pub fn destroy(&self, handle: Handle) -> Result<(), BridgeError> {
        if delivering_for() == Some(handle.as_raw()) {
            return Err(BridgeError::ReentrantDestroy(handle.as_raw()));
        }
        let (instance, runtime) = {
            let mut table = lock(&self.table);
            let instance = table
                .instances
                .remove(&handle)
                .ok_or(BridgeError::UnknownHandle(handle.as_raw()))?;
            let runtime = if table.instances.is_empty() {
                table.runtime.take()
            } else {
                None
            };
            (instance, runtime)
        };

        tracing::info!(%handle, "Shutting down chatbridge FFI...");
        instance.shutdown();
        drop(instance);
        drop(runtime);
        tracing::info!(%handle, "Shutdown complete");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Process-wide registry
// ---------------------------------------------------------------------------

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// The registry behind the C ABI. Built on first use from
/// [`BridgeConfig::load`], backed by the loopback engine unless
/// [`set_global`] installed another one first.
pub fn global() -> &'static Registry {
    GLOBAL.get_or_init(|| {
        let config = BridgeConfig::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Bad config, using defaults");
            BridgeConfig::default()
        });
        Registry::loopback(config)
    })
}

/// Install the registry used by the C ABI.
///
/// # Errors
///
/// Returns the registry back if one is already installed.
pub fn set_global(registry: Registry) -> Result<(), Registry> {
    GLOBAL.set(registry)
}

// ---------------------------------------------------------------------------
// C ABI
// ---------------------------------------------------------------------------

fn c_handle(raw: ChatHandle) -> Result<Handle, BridgeError> {
    Handle::from_raw(raw).ok_or(BridgeError::UnknownHandle(raw))
}

/// Create an instance. Returns `0` on failure (see the last error).
#[unsafe(no_mangle)]
pub extern "C" fn chatbridge_init() -> ChatHandle {
    match global().init() {
        Ok(handle) => handle.as_raw(),
        Err(e) => {
            tracing::error!(error = %e, "Init failed");
            set_last_error(e.to_string());
            0
        }
    }
}

/// Start the instance, delivering events to `callback`. Returns 0 on success.
///
/// # Safety
///
/// `callback` must be safe to call from another thread until
/// [`chatbridge_destroy`] returns for this handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn chatbridge_start(handle: ChatHandle, callback: ChatEventCallback) -> i32 {
    catch(|| {
        let cb = callback.ok_or(BridgeError::NullPointer("callback"))?;
        global().start(c_handle(handle)?, Box::new(CEventSink::Plain(cb)))
    })
}

/// Start the instance, passing `ctx` to every `callback` call. Returns 0 on
/// success.
///
/// # Safety
///
/// `callback` must be safe to call from another thread with `ctx` until
/// [`chatbridge_destroy`] returns for this handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn chatbridge_start_with_context(
    handle: ChatHandle,
    callback: ChatEventContextCallback,
    ctx: *mut c_void,
) -> i32 {
    catch(|| {
        let cb = callback.ok_or(BridgeError::NullPointer("callback"))?;
        let ctx = ctx as usize; // usize is Send; raw pointers are not
        global().start(c_handle(handle)?, Box::new(CEventSink::Context(cb, ctx)))
    })
}

/// Destroy the instance. No event callback runs after this returns.
/// Unknown or already destroyed handles are ignored.
#[unsafe(no_mangle)]
pub extern "C" fn chatbridge_destroy(handle: ChatHandle) {
    if let Err(e) = c_handle(handle).and_then(|h| global().destroy(h)) {
        tracing::warn!(handle, error = %e, "Destroy ignored");
        set_last_error(e.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_never_a_handle() {
        assert!(Handle::from_raw(0).is_none());
        assert_eq!(Handle::from_raw(9).map(Handle::as_raw), Some(9));
    }

    #[test]
    fn handles_are_not_reused() {
        let registry = Registry::loopback(BridgeConfig::default());
        let a = registry.init().unwrap();
        registry.destroy(a).unwrap();
        let b = registry.init().unwrap();
        assert_ne!(a, b);
        assert!(b > a);
        registry.destroy(b).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn runtime_lives_while_instances_do() {
        let registry = Registry::loopback(BridgeConfig::default());
        let a = registry.init().unwrap();
        let b = registry.init().unwrap();
        registry.destroy(a).unwrap();
        assert!(lock(&registry.table).runtime.is_some());
        registry.destroy(b).unwrap();
        assert!(lock(&registry.table).runtime.is_none());
    }

    #[test]
    fn exhausted_handle_space_fails_init() {
        let registry = Registry::loopback(BridgeConfig::default());
        lock(&registry.table).next_id = 0;
        assert!(matches!(
            registry.init(),
            Err(BridgeError::HandleSpaceExhausted)
        ));
    }

    #[test]
    fn destroy_of_zero_handle_is_ignored() {
        chatbridge_destroy(0);
        assert!(crate::ffi::chatbridge_last_error_length() > 0);
    }
}
