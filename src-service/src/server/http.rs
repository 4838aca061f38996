//! HTTP surface: file upload decoding, browser socket streaming, status and
//! session control.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use asrbridge_common::protocol::{FramingError, HypothesisEvent};
use asrbridge_common::{ServiceStatus, SessionId, TransportKind};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{DecodingRequest, EngineError};
use crate::pool::PoolError;
use crate::session::{run_session, AudioSource, HypothesisSink, SessionError};
use crate::state::{ServiceContext, SharedContext};

/// Multipart field carrying the uploaded audio.
pub const UPLOAD_FIELD: &str = "wav_file";

/// Uploads larger than this are rejected.
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failed to spool upload: {0}")]
    Io(#[from] io::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Pool(PoolError::NoWorkerAvailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Pool(PoolError::Engine(e)) => match e {
                EngineError::Unresponsive { .. } => StatusCode::GATEWAY_TIMEOUT,
                EngineError::Terminated => StatusCode::BAD_GATEWAY,
                EngineError::DuplicateTag(_) => StatusCode::CONFLICT,
                EngineError::InvalidTag(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("[HttpServer] {}: {}", status, self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/upload", post(upload))
        .route("/websocket", get(websocket))
        .route("/status", get(status))
        .route("/sessions/:id", delete(close_session))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(ctx)
}

/// Serve the HTTP surface on `listener` until shutdown.
pub async fn serve(ctx: SharedContext, listener: TcpListener) -> io::Result<()> {
    info!("[HttpServer] Listening on {}", listener.local_addr()?);
    let shutdown = ctx.shutdown.clone();
    let app = router(ctx).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("[HttpServer] Stopped");
    Ok(())
}

/// `POST /upload`: decode one uploaded file and answer with the hypothesis.
async fn upload(
    State(ctx): State<SharedContext>,
    mut multipart: Multipart,
) -> Result<String, ApiError> {
    let audio = read_upload(&mut multipart).await?;
    decode_upload(&ctx, &audio).await
}

async fn read_upload(multipart: &mut Multipart) -> Result<Vec<u8>, ApiError> {
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {}", e)))?
            .ok_or_else(|| ApiError::BadRequest(format!("missing '{}' field", UPLOAD_FIELD)))?;
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {}", e)))?;
        if data.is_empty() {
            return Err(ApiError::BadRequest("uploaded file is empty".into()));
        }
        return Ok(data.to_vec());
    }
}

/// Spool `audio` to the upload directory, decode it on the least-loaded batch
/// worker, and remove the spooled file.
pub async fn decode_upload(ctx: &ServiceContext, audio: &[u8]) -> Result<String, ApiError> {
    let tag = Uuid::new_v4().to_string();
    let path = spool_path(&ctx.config.upload_dir, &tag);
    tokio::fs::create_dir_all(&ctx.config.upload_dir).await?;
    tokio::fs::write(&path, audio).await?;
    debug!("[HttpServer] Spooled {} bytes to {}", audio.len(), path.display());

    let request = DecodingRequest::new(tag, &path);
    let result = ctx.pool.dispatch_batch(&request).await;

    if let Err(e) = tokio::fs::remove_file(&path).await {
        warn!("[HttpServer] Failed to remove {}: {}", path.display(), e);
    }
    result.map_err(ApiError::from)
}

fn spool_path(dir: &std::path::Path, tag: &str) -> PathBuf {
    dir.join(format!("{}.wav", tag))
}

/// `GET /status`
async fn status(State(ctx): State<SharedContext>) -> Json<ServiceStatus> {
    Json(ctx.status())
}

/// `DELETE /sessions/:id`: stop a streaming session.
async fn close_session(
    State(ctx): State<SharedContext>,
    Path(id): Path<SessionId>,
) -> StatusCode {
    if ctx.sessions.close(id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// `GET /websocket`: binary messages carry PCM, text messages carry
/// `{"sentence"}` events back.
async fn websocket(
    State(ctx): State<SharedContext>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let _ = run_session(
            &ctx.pool,
            &ctx.sessions,
            ctx.session_options(),
            TransportKind::WebSocket,
            peer.to_string(),
            SocketAudio { stream },
            SocketEvents { sink },
        )
        .await;
    })
}

struct SocketAudio {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl AudioSource for SocketAudio {
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Binary(pcm)) => return Ok(Some(pcm)),
                Ok(Message::Close(_)) => return Ok(None),
                Ok(_) => continue,
                Err(e) => {
                    debug!("[HttpServer] Socket read failed: {}", e);
                    return Err(SessionError::TransportClosed);
                }
            }
        }
        Ok(None)
    }
}

struct SocketEvents {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl HypothesisSink for SocketEvents {
    async fn send(&mut self, hypothesis: &str) -> Result<(), SessionError> {
        let event = HypothesisEvent::sentence(hypothesis);
        let text = serde_json::to_string(&event).map_err(FramingError::from)?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|_| SessionError::TransportClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::pool::WorkerPool;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn context(upload_dir: &std::path::Path, pool: WorkerPool) -> SharedContext {
        let config = ServiceConfig {
            upload_dir: upload_dir.to_path_buf(),
            ..ServiceConfig::default()
        };
        ServiceContext::new(config, pool, CancellationToken::new())
    }

    #[test]
    fn engine_failures_map_to_gateway_statuses() {
        let timeout = ApiError::Pool(PoolError::Engine(EngineError::Unresponsive {
            tag: "t".into(),
            timeout: Duration::from_secs(1),
        }));
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ApiError::Pool(PoolError::Engine(EngineError::Terminated)).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::Pool(PoolError::Engine(EngineError::DuplicateTag("t".into()))).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Pool(PoolError::NoWorkerAvailable(asrbridge_common::EngineMode::Batch))
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn upload_without_workers_is_unavailable_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), WorkerPool::new(None, false, Duration::from_secs(1)));

        let result = decode_upload(&ctx, b"RIFF....").await;
        assert!(matches!(
            result,
            Err(ApiError::Pool(PoolError::NoWorkerAvailable(_)))
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn upload_is_spooled_and_decoded() {
        use crate::config::{CommandSpec, EngineConfig};
        use crate::engine::EngineAdapter;

        // Answers with the size of the spooled file, proving it existed
        let script = r#"while read -r tag path; do echo "$tag $(wc -c < "$path" | tr -d ' ')"; done"#;
        let engine = EngineAdapter::spawn(
            "upload",
            asrbridge_common::EngineMode::Batch,
            EngineConfig::single(CommandSpec::new("/bin/sh", &["-c", script])),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let pool = WorkerPool::new(None, false, Duration::from_secs(5));
        pool.register_worker(engine);

        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), pool.clone());
        let hypothesis = decode_upload(&ctx, &[0u8; 44]).await.unwrap();
        assert_eq!(hypothesis, "44");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        pool.shutdown().await;
    }
}
