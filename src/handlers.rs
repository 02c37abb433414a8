use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{multipart::Field, Multipart, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json,
};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::ReaderStream;

use crate::config::FileNamingStrategy;
use crate::error::AppError;
use crate::models::{Envelope, PathQuery, UploadReceipt};
use crate::paths::ResolvedPath;
use crate::storage::{PendingUpload, Storage};

use crate::AppState;

type AppResult<T> = Result<T, AppError>;

/// Multipart field carrying file content
const FILE_FIELD: &str = "file";
/// Optional multipart field naming the destination directory, relative to the work dir
const DESTINATION_FIELD: &str = "path";

// ─── Routes ──────────────────────────────────────────────────────

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route(
        "/api/files",
        get(download)
            .post(upload)
            .delete(delete)
            .fallback(method_not_allowed),
    )
}

pub async fn method_not_allowed() -> AppError {
    AppError::MethodNotAllowed
}

pub async fn route_not_found() -> AppError {
    AppError::RouteNotFound
}

// ─── Upload ──────────────────────────────────────────────────────

async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let mut destination = String::new();
    let mut uploaded = Vec::new();
    // Parts stay removable until the whole form has been read.
    let mut pending = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        tracing::debug!(error = %e, "malformed multipart body");
        AppError::BadRequest("malformed multipart body".to_string())
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            DESTINATION_FIELD => {
                destination = field.text().await.map_err(|e| {
                    tracing::debug!(error = %e, "unreadable destination field");
                    AppError::BadRequest("unreadable destination field".to_string())
                })?;
            }
            FILE_FIELD => {
                let (receipt, file) = store_field(&state, &destination, field).await?;
                uploaded.push(receipt);
                pending.push(file);
            }
            other => tracing::debug!(field = other, "ignoring multipart field"),
        }
    }

    if uploaded.is_empty() {
        return Err(AppError::BadRequest(format!(
            "missing multipart field '{}'",
            FILE_FIELD
        )));
    }

    pending.into_iter().for_each(PendingUpload::commit);
    let message = format!("uploaded {} file(s)", uploaded.len());
    Ok((StatusCode::OK, Json(Envelope::success(message, Some(uploaded)))))
}

async fn store_field(
    state: &AppState,
    destination: &str,
    mut field: Field<'_>,
) -> AppResult<(UploadReceipt, PendingUpload)> {
    let client_name = field.file_name().unwrap_or_default().to_string();
    let file_name = stored_name(&client_name, state.config.file_naming_strategy)?;

    let dir = state.storage.resolve(destination)?;
    let (file, pending) = state.storage.create_upload_target(&dir, &file_name).await?;

    let (size, sha256) = write_body(
        &mut field,
        file,
        state.config.max_upload_size,
        state.config.read_timeout,
    )
    .await?;

    let path = pending.target().relative.clone();
    tracing::info!(path = %path, size, "stored upload");
    Ok((UploadReceipt { path, size, sha256 }, pending))
}

/// Stream one field into `file`, hashing as it goes. Stops as soon as the running total
/// passes `limit`.
async fn write_body(
    field: &mut Field<'_>,
    file: tokio::fs::File,
    limit: u64,
    read_timeout: Duration,
) -> AppResult<(u64, String)> {
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;

    loop {
        let next = tokio::time::timeout(read_timeout, field.chunk())
            .await
            .map_err(|_| AppError::RequestTimeout(read_timeout))?;
        let chunk = next.map_err(|e| {
            tracing::debug!(error = %e, "upload stream interrupted");
            AppError::BadRequest("upload stream interrupted".to_string())
        })?;
        let Some(chunk) = chunk else { break };

        written += chunk.len() as u64;
        if written > limit {
            return Err(AppError::PayloadTooLarge { limit });
        }
        hasher.update(&chunk);
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| AppError::internal("failed to write file", e))?;
    }

    writer
        .flush()
        .await
        .map_err(|e| AppError::internal("failed to write file", e))?;
    Ok((written, hex::encode(hasher.finalize())))
}

/// On-disk name for an uploaded part. Only the final component of the client name is used.
fn stored_name(client_name: &str, strategy: FileNamingStrategy) -> AppResult<String> {
    let unified = client_name.replace('\\', "/");
    let base = Path::new(&unified)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());

    match strategy {
        FileNamingStrategy::Original => {
            base.ok_or_else(|| AppError::BadRequest("file part has no usable file name".to_string()))
        }
        FileNamingStrategy::Uuid => {
            let id = uuid::Uuid::new_v4();
            let ext = base
                .as_deref()
                .and_then(|b| Path::new(b).extension())
                .map(|e| e.to_string_lossy().into_owned());
            Ok(match ext {
                Some(ext) => format!("{}.{}", id, ext),
                None => id.to_string(),
            })
        }
    }
}

// ─── Download ────────────────────────────────────────────────────

async fn download(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> AppResult<Response> {
    let target = state.storage.resolve(&query.path)?;
    file_response(&state.storage, &target).await
}

/// Stream a file as an attachment.
pub async fn file_response(storage: &Storage, target: &ResolvedPath) -> AppResult<Response> {
    let (file, meta) = storage.open_file(target).await?;

    let name = target
        .absolute
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let content_type = mime_guess::from_path(&target.absolute).first_or_octet_stream();

    let body = Body::from_stream(ReaderStream::new(file));
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(content_type.as_ref()) {
        headers.insert(header::CONTENT_TYPE, v);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.len()));
    if let Ok(v) = HeaderValue::from_str(&content_disposition(&name)) {
        headers.insert(header::CONTENT_DISPOSITION, v);
    }

    tracing::debug!(path = %target.relative, size = meta.len(), "streaming file");
    Ok(response)
}

/// `attachment` with an ASCII fallback name plus the RFC 5987 UTF-8 form.
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .map(|c| if c == '"' || c == '\\' { '_' } else { c })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(name)
    )
}

// ─── Delete ──────────────────────────────────────────────────────

async fn delete(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> AppResult<impl IntoResponse> {
    let target = state.storage.resolve(&query.path)?;
    state.storage.delete(&target).await?;
    let message = format!("deleted '{}'", target.relative);
    Ok((StatusCode::OK, Json(Envelope::<()>::success(message, None))))
}
