//! HTTP API - a thin administrative face over a [`ContentNode`]

mod files;
mod nodes;

pub use nodes::{NodeRecord, NodeRegistry, RegisteredNode};

use crate::crypto::CidError;
use crate::storage::StorageError;
use crate::{ContentNode, ObscureError};

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Largest accepted upload body
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<ContentNode>,
    pub registry: Arc<NodeRegistry>,
    pub upload_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl AppState {
    pub fn new(node: Arc<ContentNode>, upload_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            node,
            registry: Arc::new(NodeRegistry::new()),
            upload_dir: upload_dir.into(),
            temp_dir: temp_dir.into(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/files/upload",
            post(files::upload_file).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/files", get(files::list_files))
        .route("/files/", get(files::list_files))
        .route("/files/:cid", get(files::get_file))
        .route("/nodes", get(nodes::list_nodes))
        .route("/nodes/register", post(nodes::register_node))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves
pub async fn serve<F>(addr: SocketAddr, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP API listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

/// Error response: `{"error": ..., "code": ...}` with a matching status
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST",
            message: message.into(),
        }
    }
}

impl From<ObscureError> for ApiError {
    fn from(err: ObscureError) -> Self {
        if err.is_not_found() {
            return Self {
                status: StatusCode::NOT_FOUND,
                code: "NOT_FOUND",
                message: "File not found".into(),
            };
        }

        match err {
            ObscureError::Crypto(e) => e.into(),
            ObscureError::Storage(StorageError::Config(msg)) | ObscureError::Config(msg) => Self::bad_request(msg),
            other => {
                tracing::error!(error = %other, "Request failed");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "INTERNAL",
                    message: other.to_string(),
                }
            }
        }
    }
}

impl From<CidError> for ApiError {
    fn from(err: CidError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_CID",
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ObscureError::Io(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}
