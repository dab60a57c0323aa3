//! Defines routes for the control plane, the blob data plane and health.
//!
//! ## Structure
//! - **Bucket registry** (`/api/v1/buckets`)
//!   - `POST   /buckets`: create bucket
//!   - `GET    /buckets`: list buckets (supports search, limit, offset)
//!   - `GET    /buckets/name/{name}`: fetch by name
//!   - `GET    /buckets/{id}` / `PATCH` / `DELETE`
//!   - `GET    /buckets/{id}/size`: completed bytes and object count
//!   - `POST   /buckets/{id}/enable`, `/disable`, `/lock`, `/unlock`
//!   - `POST   /buckets/{id}/allowed-content-types/add`, `/remove`
//!
//! - **Object lifecycle** (`/api/v1/objects/{bucket}`)
//!   - `GET    /objects/{bucket}`: search by path prefix
//!   - `POST   /objects/{bucket}/presigned-upload`: issue upload grant
//!   - `GET    /objects/{bucket}/{id}` / `DELETE`
//!   - `POST   /objects/{bucket}/{id}/complete`: confirm upload
//!   - `POST   /objects/{bucket}/{id}/presigned-download`: issue download grant
//!
//! - **Blob data plane**
//!   - `PUT    /blobs/{bucket}/{*name}`: upload through a grant
//!   - `GET    /blobs/{bucket}/{*name}`: download through a grant
//!
//! The wildcard `*name` allows nested names like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        blob_handlers::{get_blob, put_blob},
        bucket_handlers::{
            add_allowed_content_types, create_bucket, delete_bucket, disable_bucket,
            enable_bucket, get_bucket, get_bucket_by_name, get_bucket_size, list_buckets,
            lock_bucket, remove_allowed_content_types, unlock_bucket, update_bucket,
        },
        health_handlers::{healthz, readyz},
        object_handlers::{
            complete_presigned_upload, create_presigned_download, create_presigned_upload,
            delete_object, get_object, search_objects,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};

fn bucket_routes() -> Router<AppState> {
    Router::new()
        .route("/buckets", post(create_bucket).get(list_buckets))
        .route("/buckets/name/{name}", get(get_bucket_by_name))
        .route(
            "/buckets/{id}",
            get(get_bucket).patch(update_bucket).delete(delete_bucket),
        )
        .route("/buckets/{id}/size", get(get_bucket_size))
        .route("/buckets/{id}/enable", post(enable_bucket))
        .route("/buckets/{id}/disable", post(disable_bucket))
        .route("/buckets/{id}/lock", post(lock_bucket))
        .route("/buckets/{id}/unlock", post(unlock_bucket))
        .route(
            "/buckets/{id}/allowed-content-types/add",
            post(add_allowed_content_types),
        )
        .route(
            "/buckets/{id}/allowed-content-types/remove",
            post(remove_allowed_content_types),
        )
}

fn object_routes() -> Router<AppState> {
    Router::new()
        .route("/objects/{bucket}", get(search_objects))
        .route(
            "/objects/{bucket}/presigned-upload",
            post(create_presigned_upload),
        )
        .route(
            "/objects/{bucket}/{id}",
            get(get_object).delete(delete_object),
        )
        .route(
            "/objects/{bucket}/{id}/complete",
            post(complete_presigned_upload),
        )
        .route(
            "/objects/{bucket}/{id}/presigned-download",
            post(create_presigned_download),
        )
}

/// Build and return the router for every route.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/api/v1", bucket_routes().merge(object_routes()))
        // Data plane
        .route("/blobs/{bucket}/{*name}", put(put_blob).get(get_blob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blob::LocalBlobStore,
        config::ServiceConfig,
        db::testing::memory_pool,
        services::{bucket_service::BucketService, object_service::ObjectService},
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app(root: &std::path::Path) -> Router {
        let db = Arc::new(memory_pool().await);
        let store = Arc::new(LocalBlobStore::new(root, "http://localhost", b"test-secret".to_vec()));
        let state = AppState {
            db: db.clone(),
            buckets: BucketService::new(db.clone()),
            objects: ObjectService::new(db.clone(), store.clone(), ServiceConfig::default()),
            blob_store: store,
        };
        routes().with_state(state)
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    /// Strip the public base so the grant URL can be replayed in-process.
    fn local_path(url: &str) -> String {
        url.trim_start_matches("http://localhost").to_string()
    }

    #[tokio::test]
    async fn upload_complete_download_round_trip_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let (status, _) = call(&app, json_request("POST", "/api/v1/buckets", json!({"name": "b1b"}))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, grant) = call(
            &app,
            json_request(
                "POST",
                "/api/v1/objects/b1b/presigned-upload",
                json!({"name": "a/b.txt", "size": 5, "content_type": "text/plain"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = grant["id"].as_str().unwrap().to_string();

        let (status, _) = call(&app, empty_request("POST", &format!("/api/v1/objects/b1b/{id}/complete"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let put = Request::builder()
            .method("PUT")
            .uri(local_path(grant["url"].as_str().unwrap()))
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("hello"))
            .unwrap();
        let response = app.clone().oneshot(put).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::ETAG));

        let (status, object) = call(&app, empty_request("POST", &format!("/api/v1/objects/b1b/{id}/complete"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(object["upload_status"], "completed");

        let (status, download) = call(
            &app,
            empty_request("POST", &format!("/api/v1/objects/b1b/{id}/presigned-download?expires_in=60")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let response = app
            .clone()
            .oneshot(empty_request("GET", &local_path(download["url"].as_str().unwrap())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn tampered_grant_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;
        call(&app, json_request("POST", "/api/v1/buckets", json!({"name": "b1b"}))).await;
        let (_, grant) = call(
            &app,
            json_request("POST", "/api/v1/objects/b1b/presigned-upload", json!({"name": "a.bin", "size": 3})),
        )
        .await;

        let url = local_path(grant["url"].as_str().unwrap()).replace("size=3", "size=4");
        let put = Request::builder()
            .method("PUT")
            .uri(url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from("abcd"))
            .unwrap();
        let (status, _) = call(&app, put).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn error_kinds_map_to_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let (status, bucket) = call(&app, json_request("POST", "/api/v1/buckets", json!({"name": "b1b"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = bucket["id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, json_request("POST", "/api/v1/buckets", json!({"name": "b1b"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], 409);

        let (status, _) = call(&app, empty_request("POST", &format!("/api/v1/buckets/{id}/enable"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, empty_request("POST", &format!("/api/v1/buckets/{id}/disable"))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, empty_request("GET", "/api/v1/objects/b1b?path=a/")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&app, empty_request("GET", &format!("/api/v1/buckets/{}", uuid::Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, size) = call(&app, empty_request("GET", &format!("/api/v1/buckets/{id}/size"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(size["object_count"], 0);
    }

    #[tokio::test]
    async fn health_endpoints_report_ok() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;
        let (status, body) = call(&app, empty_request("GET", "/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&app, empty_request("GET", "/readyz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["checks"]["blob_store"]["ok"], true);
    }
}
