//! Data-plane handlers behind presigned URLs.
//! Streams blob bodies to avoid buffering in memory; every request must carry
//! a valid, unexpired signature for its method, bucket and name.

use crate::{
    blob::{
        LocalBlobStore,
        local::{METHOD_GET, METHOD_PUT, SignedQuery},
    },
    errors::AppError,
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use std::{io, sync::Arc};
use tokio_util::io::ReaderStream;

/// Upload a blob to `/blobs/{bucket}/{*name}` through a PUT grant.
pub async fn put_blob(
    State(store): State<Arc<LocalBlobStore>>,
    Path((bucket, name)): Path<(String, String)>,
    Query(q): Query<SignedQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    store.verify(METHOD_PUT, &bucket, &name, &q)?;

    if let Some(signed) = q.content_type.as_deref() {
        let sent = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !sent.eq_ignore_ascii_case(signed) {
            return Err(AppError::forbidden(format!(
                "content type '{}' does not match the grant",
                sent
            )));
        }
    }

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let stored = store.write_stream(&bucket, &name, q.size, stream).await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", stored.etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// Download `/blobs/{bucket}/{*name}` through a GET grant as a streaming
/// response.
pub async fn get_blob(
    State(store): State<Arc<LocalBlobStore>>,
    Path((bucket, name)): Path<(String, String)>,
    Query(q): Query<SignedQuery>,
) -> Result<Response, AppError> {
    store.verify(METHOD_GET, &bucket, &name, &q)?;

    let (file, len) = store.open(&bucket, &name).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    Ok(response)
}

