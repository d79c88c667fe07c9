//! Serving stored objects over HTTP.
//! Bodies are streamed from disk, never buffered in memory.

use crate::{errors::AppError, models::object::Object, state::AppState};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::Utc;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Query of a pre-signed object URL.
#[derive(Debug, Deserialize)]
pub struct PresignedQuery {
    pub expires: i64,
    pub signature: String,
}

/// GET `/objects/{bucket}/{*key}` - serve an object through a pre-signed URL.
pub async fn get_presigned_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<PresignedQuery>,
) -> Result<Response, AppError> {
    if !state
        .signer
        .verify(&bucket, &key, q.expires, &q.signature, Utc::now())
    {
        debug!(bucket = %bucket, key = %key, "rejected pre-signed url");
        return Err(AppError::new(
            StatusCode::FORBIDDEN,
            "signature invalid or expired",
        ));
    }

    stream_object(&state, &bucket, &key, None).await
}

/// Stream `key` with object headers. With `attachment` set the response
/// carries a `Content-Disposition` naming that file.
pub async fn stream_object(
    state: &AppState,
    bucket: &str,
    key: &str,
    attachment: Option<&str>,
) -> Result<Response, AppError> {
    let (meta, file) = state.storage.get_object_reader(bucket, key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    if let Some(file_name) = attachment {
        let disposition = format!("attachment; filename=\"{}\"", file_name.replace('"', ""));
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            response
                .headers_mut()
                .insert(header::CONTENT_DISPOSITION, value);
        }
    }

    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Object) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes.max(0) as u64));

    if let Some(etag) = meta.etag.as_ref() {
        let quoted = format!("\"{}\"", etag);
        if let Ok(value) = HeaderValue::from_str(&quoted) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
