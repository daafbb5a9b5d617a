//! Block upload HTTP handlers
//!
//! | Method | Path | Effect |
//! |--------|------|--------|
//! | POST | `/api/v1/upload/block/{id}` | begin: stage meta.json.temp |
//! | POST | `/api/v1/upload/block/{id}?uploadComplete=true` | commit |
//! | POST | `/api/v1/upload/block/{id}/files?path=P` | store `P` under the block |

use crate::api::ApiState;
use crate::block::{BlockId, BlockMeta};
use crate::upload::UploadError;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::error;

/// Request header carrying the tenant ID.
pub const TENANT_HEADER: &str = "X-Scope-OrgID";

#[derive(Debug, serde::Deserialize)]
pub struct BlockUploadQuery {
    #[serde(rename = "uploadComplete", default)]
    upload_complete: bool,
}

#[derive(Debug, serde::Deserialize)]
pub struct FileUploadQuery {
    #[serde(default)]
    path: String,
}

/// Handle requests for starting or completing block uploads.
pub async fn handle_block_upload(
    State(state): State<ApiState>,
    Path(block): Path<String>,
    Query(query): Query<BlockUploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let block_id = match parse_block_id(&block) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let tenant_id = match tenant_from(&headers) {
        Ok(tenant) => tenant,
        Err(resp) => return resp,
    };

    let result = if query.upload_complete {
        state.uploads.commit(&tenant_id, block_id).await
    } else {
        let meta: BlockMeta = match serde_json::from_slice(&body) {
            Ok(meta) => meta,
            Err(_) => {
                return (StatusCode::BAD_REQUEST, "malformed request body").into_response();
            }
        };
        state.uploads.begin(&tenant_id, block_id, meta).await
    };

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(&tenant_id, block_id, err),
    }
}

/// Handle requests for uploading block files.
pub async fn handle_block_file_upload(
    State(state): State<ApiState>,
    Path(block): Path<String>,
    Query(query): Query<FileUploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let block_id = match parse_block_id(&block) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let tenant_id = match tenant_from(&headers) {
        Ok(tenant) => tenant,
        Err(resp) => return resp,
    };

    match state
        .uploads
        .upload_file(&tenant_id, block_id, &query.path, body)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(&tenant_id, block_id, err),
    }
}

fn parse_block_id(raw: &str) -> Result<BlockId, Response> {
    if raw.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "missing block ID").into_response());
    }
    BlockId::parse(raw)
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid block ID").into_response())
}

fn tenant_from(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|tenant| !tenant.is_empty())
        .map(String::from)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "invalid tenant ID").into_response())
}

fn error_response(tenant_id: &str, block_id: BlockId, err: UploadError) -> Response {
    match err {
        UploadError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
        UploadError::Conflict => (
            StatusCode::CONFLICT,
            "block already exists in object storage",
        )
            .into_response(),
        UploadError::Internal(source) => {
            error!(tenant = tenant_id, block = %block_id, %source, "block upload failed on an internal bucket operation");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        }
        UploadError::BadGateway(source) => {
            error!(tenant = tenant_id, block = %block_id, %source, "block file upload failed upstream");
            (
                StatusCode::BAD_GATEWAY,
                "failed uploading block file to bucket",
            )
                .into_response()
        }
    }
}
