//! File endpoints: upload shares, download retrieves, listing fans out

use super::{ApiError, AppState};
use crate::content_node::NetworkListing;
use crate::crypto::ContentId;
use crate::ObscureError;

use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path as FsPath, PathBuf};
use tokio_util::io::ReaderStream;

/// POST /files/upload - multipart form with a `file` field
pub(super) async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field
            .file_name()
            .and_then(|name| std::path::Path::new(name).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ApiError::bad_request("Upload is missing a file name"))?;

        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {}", e)))?;

        let cid = ContentId::of(&bytes);
        let dir = state.upload_dir.join(cid.as_str());
        let path = {
            let bytes = bytes.clone();
            tokio::task::spawn_blocking(move || save_upload(&dir, &file_name, &bytes))
                .await
                .map_err(|e| ObscureError::Task(e.to_string()))??
        };

        let receipt = state.node.share_file(&path).await?;
        tracing::info!(cid = %receipt.cid, path = %path.display(), bytes = bytes.len(), "File uploaded");

        return Ok(Json(json!({
            "message": "File uploaded successfully",
            "cid": receipt.cid,
        })));
    }

    Err(ApiError::bad_request("Missing 'file' field"))
}

/// Write an upload to `<dir>/<name>`, renaming it into place once complete
fn save_upload(dir: &FsPath, file_name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(bytes)?;

    let path = dir.join(file_name);
    staged.persist(&path).map_err(|e| e.error)?;
    Ok(path)
}

/// GET /files/:cid - stream the file, fetching it from peers if needed
pub(super) async fn get_file(
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> Result<Response, ApiError> {
    let cid = ContentId::parse(&cid)?;

    // Each request retrieves into its own scratch directory
    tokio::fs::create_dir_all(&state.temp_dir).await?;
    let scratch = tempfile::Builder::new()
        .prefix(&format!("{}-", state.node.local_peer_id()))
        .tempdir_in(&state.temp_dir)?;
    let output = scratch.path().join(cid.as_str());

    let source = state.node.retrieve_file(&cid, &output).await?;
    tracing::debug!(cid = %cid, ?source, "Serving retrieved file");

    let file = tokio::fs::File::open(&output).await?;
    let stream = ReaderStream::new(file).map(move |chunk| {
        // Removed when the body is dropped
        let _scratch = &scratch;
        chunk
    });
    let body = Body::from_stream(stream);

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", cid),
            ),
        ],
        body,
    )
        .into_response())
}

/// GET /files - local registrations plus every reachable peer's listing
pub(super) async fn list_files(State(state): State<AppState>) -> Json<NetworkListing> {
    Json(state.node.list_network_files().await)
}
