//! 统一的错误类型：上传引擎错误、配置错误与 HTTP 请求错误。

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::http::{TUS_PROTOCOL_VERSION, TUS_VERSION, insert_tus_resumable};

/// 引擎与存储操作失败的类型化结果。
///
/// 任一错误都不会改变上传状态，由协议适配层决定客户端看到的响应。
#[derive(Debug, Error)]
pub enum TusError {
    #[error("invalid upload length: {0}")]
    InvalidLength(i64),

    #[error("declared length {length} exceeds the maximum of {max}")]
    MaxSizeExceeded { length: u64, max: u64 },

    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("offset conflict: stored offset is {expected}, client claimed {actual}")]
    OffsetConflict { expected: u64, actual: u64 },

    #[error("chunk of {chunk} bytes at offset {offset} exceeds declared length {length}")]
    LengthExceeded { offset: u64, chunk: u64, length: u64 },

    #[error("checksum mismatch for {algorithm} digest")]
    ChecksumMismatch { algorithm: &'static str },

    #[error("unsupported checksum: {0}")]
    UnsupportedChecksum(String),

    #[error("upload is locked by another request")]
    Busy,

    #[error("storage unavailable: {0}")]
    StoreUnavailable(String),

    #[error("upload incomplete: {offset} of {length} bytes")]
    IncompleteUpload { offset: u64, length: u64 },

    #[error("path traversal rejected: {0}")]
    PathTraversalRejected(String),

    #[error("missing value for placeholder {{{0}}}")]
    MissingBinding(String),

    #[error("target file already exists: {0}")]
    FileExists(String),

    #[error("invalid upload metadata: {0}")]
    InvalidMetadata(String),
}

impl TusError {
    /// 客户端是否可以稍后原样重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TusError::Busy | TusError::ChecksumMismatch { .. } | TusError::StoreUnavailable(_)
        )
    }
}

impl From<std::io::Error> for TusError {
    fn from(err: std::io::Error) -> Self {
        TusError::StoreUnavailable(err.to_string())
    }
}

/// 启动阶段的配置错误，出现时服务拒绝启动。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid template {template:?}: {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("placeholder {{{name}}} of the storage template is not captured by {url:?}")]
    UnboundPlaceholder { name: String, url: String },

    #[error("placeholder name {0:?} is reserved")]
    ReservedPlaceholder(String),

    #[error("endpoint {0:?} overlaps the routes of another endpoint")]
    DuplicateEndpoint(String),

    #[error("failed to read endpoints file: {0}")]
    EndpointsFile(String),
}

/// 解析 HTTP 请求时产生的错误。
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    UnsupportedVersion,
    UnsupportedMediaType,
    PayloadTooLarge(u64),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        insert_tus_resumable(&mut headers);
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, headers, msg).into_response(),
            ApiError::UnsupportedVersion => {
                headers.insert(TUS_VERSION, HeaderValue::from_static(TUS_PROTOCOL_VERSION));
                (
                    StatusCode::PRECONDITION_FAILED,
                    headers,
                    "unsupported tus version",
                )
                    .into_response()
            }
            ApiError::UnsupportedMediaType => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                headers,
                "content type must be application/offset+octet-stream",
            )
                .into_response(),
            ApiError::PayloadTooLarge(limit) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                headers,
                format!("request body exceeds {limit} bytes"),
            )
                .into_response(),
        }
    }
}
