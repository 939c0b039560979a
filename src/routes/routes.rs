//! Defines routes for the image slot store.
//!
//! ## Structure
//! - `GET    /`              — list every stored image (JSON)
//! - `GET    /images/{key}`  — serve the current image for a key
//! - `POST   /upload/{key}`  — multipart upload (`image` field), replaces the key's image
//! - `DELETE /images`        — delete every image (`Authorization: Bearer <secret>`)
//! - `GET    /healthz`, `GET /readyz` — health checks
//!
//! Every route answers CORS requests from any origin.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{delete_all_images, get_image, list_images, upload_image},
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build and return the router with all image routes.
///
/// The router carries shared state (`StorageService`) to all handlers. Axum's
/// default body limit is disabled because the store enforces its own cap while
/// streaming the upload.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // image routes
        .route("/", get(list_images))
        .route("/images", delete(delete_all_images))
        .route("/images/{key}", get(get_image))
        .route("/upload/{key}", post(upload_image))
        .layer(DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
