//! JSON handlers for the object lifecycle under `/api/v1/objects/{bucket}`.
//! Object bytes never pass through here; callers receive presigned grants.

use crate::{
    errors::AppError,
    models::object::{Object, PresignedDownload},
    services::object_service::{CreatePresignedUpload, ObjectService, SearchObjects},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

/// Query params accepted by the download-grant endpoint.
#[derive(Debug, Deserialize)]
pub struct PresignedDownloadQuery {
    /// Grant lifetime in seconds.
    pub expires_in: Option<i64>,
}

/// `POST /objects/{bucket}/presigned-upload`
pub async fn create_presigned_upload(
    State(service): State<ObjectService>,
    Path(bucket): Path<String>,
    Json(req): Json<CreatePresignedUpload>,
) -> Result<impl IntoResponse, AppError> {
    let grant = service.create_presigned_upload(&bucket, req).await?;
    Ok((StatusCode::CREATED, Json(grant)))
}

/// `POST /objects/{bucket}/{id}/complete`
pub async fn complete_presigned_upload(
    State(service): State<ObjectService>,
    Path((bucket, id)): Path<(String, Uuid)>,
) -> Result<Json<Object>, AppError> {
    Ok(Json(service.complete_presigned_upload(&bucket, id).await?))
}

/// `POST /objects/{bucket}/{id}/presigned-download?expires_in=`
pub async fn create_presigned_download(
    State(service): State<ObjectService>,
    Path((bucket, id)): Path<(String, Uuid)>,
    Query(q): Query<PresignedDownloadQuery>,
) -> Result<Json<PresignedDownload>, AppError> {
    Ok(Json(
        service
            .create_presigned_download(&bucket, id, q.expires_in)
            .await?,
    ))
}

pub async fn get_object(
    State(service): State<ObjectService>,
    Path((bucket, id)): Path<(String, Uuid)>,
) -> Result<Json<Object>, AppError> {
    Ok(Json(service.get_object_by_id(&bucket, id).await?))
}

pub async fn delete_object(
    State(service): State<ObjectService>,
    Path((bucket, id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    service.delete_object(&bucket, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /objects/{bucket}?path=&level=&limit=&offset=`
pub async fn search_objects(
    State(service): State<ObjectService>,
    Path(bucket): Path<String>,
    Query(q): Query<SearchObjects>,
) -> Result<Json<Vec<Object>>, AppError> {
    Ok(Json(service.search_objects_by_path(&bucket, q).await?))
}
