//! HTTP handlers for image operations.
//! Uploads are streamed straight into `StorageService`, which enforces the
//! size cap as bytes arrive; handlers only translate between HTTP and the
//! store's typed results.

use crate::{
    errors::AppError,
    models::object::{ObjectContent, StoredObject},
    services::storage_service::StorageService,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State, multipart::MultipartError},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Serialize;
use std::io;
use tracing::warn;

/// Name of the multipart field carrying the image.
pub const IMAGE_FIELD: &str = "image";

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub count: usize,
    pub objects: Vec<StoredObject>,
}

#[derive(Debug, Serialize)]
pub struct DeleteAllResponse {
    pub removed: usize,
}

/// `GET /` — every stored image, one entry per file on disk.
pub async fn list_images(
    State(service): State<StorageService>,
) -> Result<Json<ListResponse>, AppError> {
    let objects = service.list().await?;
    Ok(Json(ListResponse {
        count: objects.len(),
        objects,
    }))
}

/// `GET /images/{key}` — serve the current image for a key.
pub async fn get_image(
    State(service): State<StorageService>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let Some(content) = service.fetch(&key).await? else {
        return Err(AppError::not_found(format!(
            "no image uploaded yet for key `{}`",
            key
        )));
    };

    let mut response = Response::new(Body::empty());
    set_image_headers(response.headers_mut(), &content);
    *response.body_mut() = Body::from(content.bytes);
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

/// `POST /upload/{key}` — multipart upload; the file travels in the `image`
/// field and replaces whatever the key held.
pub async fn upload_image(
    State(service): State<StorageService>,
    Path(key): Path<String>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let file_name = field.file_name().unwrap_or_default().to_string();
        let stream =
            field.map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err)));

        let object = service
            .store_stream(&key, &content_type, &file_name, stream)
            .await?;
        return Ok((StatusCode::OK, Json(object)));
    }

    warn!("upload for key {} had no `{}` field", key, IMAGE_FIELD);
    Err(AppError::bad_request(format!(
        "multipart body must contain an `{}` file field",
        IMAGE_FIELD
    )))
}

/// `DELETE /images` — remove every image. Needs `Authorization: Bearer <secret>`.
pub async fn delete_all_images(
    State(service): State<StorageService>,
    headers: HeaderMap,
) -> Result<Json<DeleteAllResponse>, AppError> {
    let removed = service.delete_all(bearer_token(&headers)).await?;
    Ok(Json(DeleteAllResponse { removed }))
}

/// Token from an `Authorization: Bearer <token>` header; the scheme name is
/// case-insensitive. Empty when absent or another scheme is used.
fn bearer_token(headers: &HeaderMap) -> &str {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim_start().split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim())
        .unwrap_or_default()
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

fn set_image_headers(headers: &mut HeaderMap, content: &ObjectContent) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content.content_type),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(content.bytes.len()),
    );

    let quoted = format!("\"{}\"", content.etag);
    if let Ok(value) = HeaderValue::from_str(&quoted) {
        headers.insert(header::ETAG, value);
    }

    let last_modified = content
        .object
        .uploaded_at
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
