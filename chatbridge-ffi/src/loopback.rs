//! Built-in engine that talks to nobody.
//!
//! It answers commands locally and fakes a sync loop, which makes it useful
//! for the demo harness, for integration tests and for host developers who want
//! to exercise the boundary without a homeserver.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;

use crate::config::BridgeConfig;
use crate::engine::{
    BoxFuture, Command, Engine, EngineContext, EngineError, EngineEvent, EventEmitter, Reply,
    Shutdown, UNSOLICITED, UploadRequest,
};
use crate::ffi::lock;
use crate::upload::Progress;

/// Progress is reported once per chunk of this size.
const UPLOAD_CHUNK: usize = 64 * 1024;

/// An [`Engine`] that never leaves the process.
#[derive(Debug, Clone)]
pub struct LoopbackEngine {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    device_name: String,
    data_dir: PathBuf,
    heartbeat: Option<Duration>,
    next_event: AtomicU64,
    next_upload: AtomicU64,
    events: Mutex<Option<EventEmitter>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Commands the loopback engine understands.
#[derive(Debug)]
enum Request<'a> {
    Ping(&'a [u8]),
    GetState,
    GetAccountInfo,
    SendMessage(SendMessage),
    UploadMedia(&'a [u8]),
}

#[derive(Debug, Deserialize)]
struct SendMessage {
    room_id: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct UploadParams {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    mimetype: Option<String>,
}

#[derive(Debug, Serialize)]
struct Uploaded {
    content_uri: String,
    filename: String,
    size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    mimetype: Option<String>,
}

impl<'a> Request<'a> {
    fn parse(name: &str, data: &'a [u8]) -> Result<Self, String> {
        Ok(match name {
            "ping" => Self::Ping(data),
            "get_state" => Self::GetState,
            "get_account_info" => Self::GetAccountInfo,
            "send_message" => Self::SendMessage(
                serde_json::from_slice(data)
                    .map_err(|e| format!("invalid send_message params: {e}"))?,
            ),
            "upload_media" => Self::UploadMedia(data),
            other => return Err(format!("unknown command {other:?}")),
        })
    }
}

fn parse_upload_params(params: &[u8]) -> Result<UploadParams, String> {
    if params.is_empty() {
        return Ok(UploadParams::default());
    }
    serde_json::from_slice(params).map_err(|e| format!("invalid upload_media params: {e}"))
}

impl LoopbackEngine {
    /// Build an engine from the bridge configuration.
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                device_name: config.device_name.clone(),
                data_dir: config.data_dir.clone(),
                heartbeat: (config.heartbeat_secs > 0)
                    .then(|| Duration::from_secs(config.heartbeat_secs)),
                next_event: AtomicU64::new(1),
                next_upload: AtomicU64::new(1),
                events: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    fn state(&self) -> serde_json::Value {
        json!({
            "is_logged_in": false,
            "is_verified": false,
            "device_name": self.inner.device_name,
            "data_dir": self.inner.data_dir,
        })
    }

    fn send_message(&self, request_id: i64, msg: SendMessage) -> Reply {
        let n = self.inner.next_event.fetch_add(1, Ordering::Relaxed);
        let sent = json!({
            "event_id": format!("$loopback-{n}"),
            "room_id": msg.room_id,
            "text": msg.text,
        });
        if request_id != UNSOLICITED {
            let events = lock(&self.inner.events).clone();
            if let Some(events) = events {
                // Never wait for the sink here: the caller may be the sink.
                let queued = EngineEvent::json("send_complete", request_id, &sent)
                    .and_then(|event| events.emit_detached(event));
                if let Err(e) = queued {
                    tracing::warn!(request_id, error = %e, "Dropping send_complete");
                }
            }
        }
        Reply::json("send_message", &sent)
    }

    async fn upload_media(&self, request: UploadRequest<'_>, progress: &Progress<'_>) -> Reply {
        let params = match parse_upload_params(request.params) {
            Ok(p) => p,
            Err(e) => return Reply::error(e),
        };
        let read;
        let media: &[u8] = match (request.media, params.path.as_deref()) {
            (Some(bytes), _) => bytes,
            (None, Some(path)) => match tokio::fs::read(path).await {
                Ok(bytes) => {
                    read = bytes;
                    &read
                }
                Err(e) => return Reply::error(format!("failed to read {path}: {e}")),
            },
            (None, None) => return Reply::error("upload_media needs a path or media bytes"),
        };

        if media.is_empty() {
            progress.report(100.0);
        } else {
            let total = media.len() as f64;
            let mut done = 0usize;
            for chunk in media.chunks(UPLOAD_CHUNK) {
                done += chunk.len();
                progress.report(done as f64 / total * 100.0);
                tokio::task::yield_now().await;
            }
        }

        let filename = params
            .filename
            .or_else(|| {
                params
                    .path
                    .as_deref()
                    .and_then(|p| Path::new(p).file_name())
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "upload".into());
        let n = self.inner.next_upload.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%filename, size = media.len(), "Loopback upload finished");
        Reply::json(
            "upload_media",
            &Uploaded {
                content_uri: format!("mxc://loopback/{n}"),
                filename,
                size: media.len(),
                mimetype: params.mimetype,
            },
        )
    }

    fn snapshot(&self, ctx: &EngineContext) -> Result<(), EngineError> {
        ctx.snapshot
            .emit(EngineEvent::json("client_state", UNSOLICITED, &self.state())?)?;
        ctx.snapshot.emit(EngineEvent::json(
            "sync_status",
            UNSOLICITED,
            &json!({"type": "waiting", "error_count": 0}),
        )?)?;
        ctx.snapshot.emit(EngineEvent::json(
            "sync_complete",
            UNSOLICITED,
            &json!({"rooms": {}, "since": null}),
        )?)?;
        ctx.snapshot
            .emit(EngineEvent::json("init_complete", UNSOLICITED, &json!({}))?)?;
        Ok(())
    }
}

async fn heartbeat(events: EventEmitter, mut shutdown: Shutdown, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = shutdown.requested() => break,
            _ = ticker.tick() => {
                let status = json!({"type": "ok", "error_count": 0});
                if events.emit_json("sync_status", UNSOLICITED, &status).await.is_err() {
                    break;
                }
            }
        }
    }
}

impl Engine for LoopbackEngine {
    fn start(&self, ctx: EngineContext) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            self.snapshot(&ctx)?;
            let EngineContext {
                snapshot,
                events,
                shutdown,
            } = ctx;
            snapshot.finish();

            if let Some(every) = self.inner.heartbeat {
                let task = tokio::spawn(heartbeat(events.clone(), shutdown, every));
                lock(&self.inner.tasks).push(task);
            }
            *lock(&self.inner.events) = Some(events);
            tracing::debug!(
                device = %self.inner.device_name,
                data_dir = %self.inner.data_dir.display(),
                "Loopback engine online"
            );
            Ok(())
        })
    }

    fn submit<'a>(&'a self, command: Command<'a>) -> BoxFuture<'a, Reply> {
        Box::pin(async move {
            match Request::parse(command.name, command.data) {
                Ok(Request::Ping(data)) => Reply::success("ping", data.to_vec()),
                Ok(Request::GetState) => Reply::json("get_state", &self.state()),
                Ok(Request::GetAccountInfo) => Reply::json(
                    "get_account_info",
                    &json!({
                        "user_id": null,
                        "device_id": "LOOPBACK",
                        "device_name": self.inner.device_name,
                    }),
                ),
                Ok(Request::SendMessage(msg)) => self.send_message(command.request_id, msg),
                Ok(Request::UploadMedia(params)) => {
                    let request = UploadRequest {
                        request_id: command.request_id,
                        params,
                        media: None,
                    };
                    self.upload_media(request, &Progress::silent()).await
                }
                Err(e) => Reply::error(e),
            }
        })
    }

    fn upload<'a>(
        &'a self,
        request: UploadRequest<'a>,
        progress: &'a Progress<'a>,
    ) -> BoxFuture<'a, Reply> {
        Box::pin(self.upload_media(request, progress))
    }

    fn stop(&self) {
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        lock(&self.inner.events).take();
        tracing::debug!("Loopback engine stopped");
    }
}
