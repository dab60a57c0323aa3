//! JSON handlers for the bucket registry under `/api/v1/buckets`.

use crate::{
    errors::AppError,
    models::bucket::{Bucket, BucketSize},
    services::bucket_service::{BucketService, CreateBucket, UpdateBucket},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

/// Query params accepted by `GET /buckets`.
#[derive(Debug, Deserialize)]
pub struct ListBucketsQuery {
    /// Case-insensitive name fragment; lists every bucket when absent.
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LockBucketReq {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ContentTypesReq {
    pub content_types: Vec<String>,
}

/// `POST /buckets`
pub async fn create_bucket(
    State(service): State<BucketService>,
    Json(req): Json<CreateBucket>,
) -> Result<impl IntoResponse, AppError> {
    let bucket = service.create(req).await?;
    Ok((StatusCode::CREATED, Json(bucket)))
}

/// `GET /buckets?search=&limit=&offset=`
pub async fn list_buckets(
    State(service): State<BucketService>,
    Query(q): Query<ListBucketsQuery>,
) -> Result<Json<Vec<Bucket>>, AppError> {
    let buckets = match q.search.as_deref() {
        Some(fragment) => service.search_buckets(fragment, q.limit, q.offset).await?,
        None => service.list_buckets(q.limit, q.offset).await?,
    };
    Ok(Json(buckets))
}

pub async fn get_bucket(
    State(service): State<BucketService>,
    Path(id): Path<Uuid>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(service.get_by_id(id).await?))
}

pub async fn get_bucket_by_name(
    State(service): State<BucketService>,
    Path(name): Path<String>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(service.get_by_name(&name).await?))
}

pub async fn get_bucket_size(
    State(service): State<BucketService>,
    Path(id): Path<Uuid>,
) -> Result<Json<BucketSize>, AppError> {
    Ok(Json(service.get_bucket_size(id).await?))
}

/// `PATCH /buckets/{id}`: max object size and visibility.
pub async fn update_bucket(
    State(service): State<BucketService>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateBucket>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(service.update(id, req).await?))
}

pub async fn delete_bucket(
    State(service): State<BucketService>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    service.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn enable_bucket(
    State(service): State<BucketService>,
    Path(id): Path<Uuid>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(service.enable(id).await?))
}

pub async fn disable_bucket(
    State(service): State<BucketService>,
    Path(id): Path<Uuid>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(service.disable(id).await?))
}

pub async fn lock_bucket(
    State(service): State<BucketService>,
    Path(id): Path<Uuid>,
    Json(req): Json<LockBucketReq>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(service.lock(id, &req.reason).await?))
}

pub async fn unlock_bucket(
    State(service): State<BucketService>,
    Path(id): Path<Uuid>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(service.unlock(id).await?))
}

pub async fn add_allowed_content_types(
    State(service): State<BucketService>,
    Path(id): Path<Uuid>,
    Json(req): Json<ContentTypesReq>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(service.add_allowed_content_types(id, req.content_types).await?))
}

pub async fn remove_allowed_content_types(
    State(service): State<BucketService>,
    Path(id): Path<Uuid>,
    Json(req): Json<ContentTypesReq>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(service.remove_allowed_content_types(id, req.content_types).await?))
}
