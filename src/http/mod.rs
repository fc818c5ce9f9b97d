//! HTTP surface of the gateway.
//!
//! Routes:
//! - `POST /note` - list, load or save notes
//! - `POST /upload` - store a file through the resource worker
//! - `GET /ask` - chat answer as server-sent events
//! - anything else - static files from the upload directory

mod handlers;
mod response;

use std::path::PathBuf;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::router::Router as CommandRouter;

pub use handlers::{note_command, AskQuery, NoteQuery, HTTP_NOTE_TAG};
pub use response::{ApiError, ApiResponse};

/// Default request body limit (uploads included).
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: CommandRouter,
    /// Directory served for paths no route matches.
    pub static_dir: PathBuf,
    pub max_body_size: usize,
}

impl AppState {
    pub fn new(router: CommandRouter, static_dir: impl Into<PathBuf>) -> Self {
        Self {
            router,
            static_dir: static_dir.into(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// Build the axum application.
pub fn app(state: AppState) -> axum::Router {
    let static_files = ServeDir::new(&state.static_dir);
    let body_limit = DefaultBodyLimit::max(state.max_body_size);

    axum::Router::new()
        .route("/note", post(handlers::note))
        .route("/upload", post(handlers::upload))
        .route("/ask", get(handlers::ask))
        .fallback_service(static_files)
        .layer(body_limit)
        .layer(middleware::from_fn(log_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or_default().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        %method,
        %path,
        %query,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "HTTP request"
    );
    response
}

/// Serve `app` on `listener` until `shutdown` fires.
pub async fn serve(listener: TcpListener, app: axum::Router, shutdown: CancellationToken) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Gateway listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    use crate::codec::CodecKind;
    use crate::transport::Endpoint;

    async fn offline_app(static_dir: &std::path::Path) -> axum::Router {
        // Nothing listens on port 1.
        let router = CommandRouter::builder()
            .service("note", CodecKind::Unary, Endpoint::tcp("127.0.0.1:1"))
            .service("ai", CodecKind::Streaming, Endpoint::tcp("127.0.0.1:1"))
            .start()
            .await
            .unwrap();
        app(AppState::new(router, static_dir))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_note_with_worker_down_is_503() {
        let dir = tempfile::tempdir().unwrap();
        let app = offline_app(dir.path()).await;

        let response = app
            .oneshot(HttpRequest::post("/note").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], 503);
    }

    #[tokio::test]
    async fn test_ask_without_prompt_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = offline_app(dir.path()).await;

        let response = app
            .oneshot(HttpRequest::get("/ask").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_to_unknown_service_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = offline_app(dir.path()).await;

        let body = "--XX\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\nContent-Type: text/plain\r\n\r\nhello\r\n--XX--\r\n";
        let response = app
            .oneshot(
                HttpRequest::post("/upload")
                    .header("content-type", "multipart/form-data; boundary=XX")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        // Only note and ai are configured here.
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fallback_serves_static_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.text"), b"hi").unwrap();
        let app = offline_app(dir.path()).await;

        let response = app
            .oneshot(HttpRequest::get("/hello.text").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hi");
    }
}
