//! 协议适配层：将 tus 请求转换为引擎调用，并将结果映射为状态码与响应头。

use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use httpdate::fmt_http_date;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::checksum::{Checksum, SUPPORTED_ALGORITHMS};
use crate::config::BUSY_RETRY_AFTER_SECS;
use crate::engine::{AppendOutcome, UploadEngine};
use crate::error::TusError;
use crate::http::{
    TUS_CHECKSUM_ALGORITHM, TUS_EXTENSION, TUS_EXTENSIONS, TUS_MAX_SIZE, TUS_PROTOCOL_VERSION,
    TUS_VERSION, UPLOAD_EXPIRES, UPLOAD_LENGTH, UPLOAD_METADATA, UPLOAD_OFFSET,
    insert_tus_resumable,
};
use crate::resolver::{Bindings, UploadEndpoint};
use crate::storage::Metadata;

/// tus 约定的校验失败状态码。
const CHECKSUM_MISMATCH_STATUS: u16 = 460;

/// 已解析请求头的 tus 请求。
#[derive(Debug)]
pub enum TusRequest {
    Options,
    Create {
        length: i64,
        metadata: Metadata,
        /// creation-with-upload 携带的首个分片。
        initial_chunk: Option<Vec<u8>>,
        checksum: Option<Checksum>,
    },
    Status {
        id: String,
    },
    Append {
        id: String,
        offset: u64,
        bytes: Vec<u8>,
        checksum: Option<Checksum>,
    },
    Delete {
        id: String,
    },
}

#[derive(Debug)]
pub struct TusResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl TusResponse {
    fn new(status: StatusCode) -> Self {
        let mut headers = HeaderMap::new();
        insert_tus_resumable(&mut headers);
        Self {
            status,
            headers,
            body: String::new(),
        }
    }

    fn header(mut self, name: HeaderName, value: impl ToString) -> Self {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            self.headers.insert(name, value);
        }
        self
    }

    fn expires(self, expires_at: Option<DateTime<Utc>>) -> Self {
        match expires_at {
            Some(at) => self.header(UPLOAD_EXPIRES, fmt_http_date(SystemTime::from(at))),
            None => self,
        }
    }

    #[cfg(test)]
    pub fn header_value(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

pub struct ProtocolAdapter {
    engine: Arc<UploadEngine>,
}

impl ProtocolAdapter {
    pub fn new(engine: Arc<UploadEngine>) -> Self {
        Self { engine }
    }

    pub async fn handle(
        &self,
        endpoint: &UploadEndpoint,
        bindings: &Bindings,
        request: TusRequest,
    ) -> TusResponse {
        let result = match request {
            TusRequest::Options => Ok(options_response(endpoint)),
            TusRequest::Create {
                length,
                metadata,
                initial_chunk,
                checksum,
            } => {
                self.create(endpoint, bindings, length, metadata, initial_chunk, checksum)
                    .await
            }
            TusRequest::Status { id } => self.status(endpoint, bindings, &id).await,
            TusRequest::Append {
                id,
                offset,
                bytes,
                checksum,
            } => {
                self.append(endpoint, bindings, &id, offset, &bytes, checksum.as_ref())
                    .await
            }
            TusRequest::Delete { id } => self.delete(endpoint, bindings, &id).await,
        };
        result.unwrap_or_else(|err| error_response(&err))
    }

    async fn create(
        &self,
        endpoint: &UploadEndpoint,
        bindings: &Bindings,
        length: i64,
        metadata: Metadata,
        initial_chunk: Option<Vec<u8>>,
        checksum: Option<Checksum>,
    ) -> Result<TusResponse, TusError> {
        let created = self
            .engine
            .create_upload(endpoint, bindings, length, metadata)
            .await?;
        info!(
            upload_id = created.id,
            length,
            state = ?created.state,
            location = created.address,
            "upload created"
        );
        if let Some(path) = &created.final_path {
            info!(upload_id = created.id, path = %path.display(), "empty upload published");
        }
        let mut expires_at = created.expires_at;
        let mut response =
            TusResponse::new(StatusCode::CREATED).header(header::LOCATION, &created.address);

        if let Some(bytes) = initial_chunk {
            match self
                .engine
                .append_chunk(endpoint, bindings, &created.id, 0, &bytes, checksum.as_ref())
                .await
            {
                Ok(outcome) => {
                    log_append(&created.id, &outcome);
                    expires_at = outcome.expires_at;
                    response = response.header(UPLOAD_OFFSET, outcome.offset);
                }
                Err(err) => {
                    // 上传已创建，客户端从偏移量 0 续传。
                    warn!(upload_id = created.id, error = %err, "initial chunk rejected");
                    response = response.header(UPLOAD_OFFSET, 0);
                }
            }
        }
        Ok(response.expires(expires_at))
    }

    async fn status(
        &self,
        endpoint: &UploadEndpoint,
        bindings: &Bindings,
        id: &str,
    ) -> Result<TusResponse, TusError> {
        let status = self.engine.get_status(endpoint, bindings, id).await?;
        debug!(upload_id = id, state = ?status.state, offset = status.offset, "upload status");
        let mut response = TusResponse::new(StatusCode::OK)
            .header(UPLOAD_OFFSET, status.offset)
            .header(UPLOAD_LENGTH, status.length)
            .header(header::CACHE_CONTROL, "no-store")
            .expires(status.expires_at);
        if !status.metadata.is_empty() {
            response = response.header(UPLOAD_METADATA, encode_metadata(&status.metadata));
        }
        Ok(response)
    }

    async fn append(
        &self,
        endpoint: &UploadEndpoint,
        bindings: &Bindings,
        id: &str,
        offset: u64,
        bytes: &[u8],
        checksum: Option<&Checksum>,
    ) -> Result<TusResponse, TusError> {
        let outcome = self
            .engine
            .append_chunk(endpoint, bindings, id, offset, bytes, checksum)
            .await?;
        log_append(id, &outcome);
        Ok(TusResponse::new(StatusCode::NO_CONTENT)
            .header(UPLOAD_OFFSET, outcome.offset)
            .expires(outcome.expires_at))
    }

    async fn delete(
        &self,
        endpoint: &UploadEndpoint,
        bindings: &Bindings,
        id: &str,
    ) -> Result<TusResponse, TusError> {
        self.engine.delete_upload(endpoint, bindings, id).await?;
        info!(upload_id = id, "upload terminated");
        Ok(TusResponse::new(StatusCode::NO_CONTENT))
    }
}

fn log_append(id: &str, outcome: &AppendOutcome) {
    match &outcome.final_path {
        Some(path) => info!(
            upload_id = id,
            offset = outcome.offset,
            path = %path.display(),
            "upload complete"
        ),
        None => debug!(
            upload_id = id,
            offset = outcome.offset,
            complete = outcome.complete,
            "chunk committed"
        ),
    }
}

fn options_response(endpoint: &UploadEndpoint) -> TusResponse {
    let response = TusResponse::new(StatusCode::NO_CONTENT)
        .header(TUS_VERSION, TUS_PROTOCOL_VERSION)
        .header(TUS_EXTENSION, TUS_EXTENSIONS)
        .header(TUS_CHECKSUM_ALGORITHM, SUPPORTED_ALGORITHMS);
    if endpoint.max_size > 0 {
        response.header(TUS_MAX_SIZE, endpoint.max_size)
    } else {
        response
    }
}

/// 将引擎错误映射为客户端响应。
pub fn error_response(err: &TusError) -> TusResponse {
    let status = match err {
        TusError::InvalidLength(_)
        | TusError::InvalidMetadata(_)
        | TusError::MissingBinding(_)
        | TusError::PathTraversalRejected(_)
        | TusError::UnsupportedChecksum(_) => StatusCode::BAD_REQUEST,
        TusError::NotFound(_) => StatusCode::NOT_FOUND,
        TusError::OffsetConflict { .. } | TusError::FileExists(_) => StatusCode::CONFLICT,
        TusError::LengthExceeded { .. } | TusError::MaxSizeExceeded { .. } => {
            StatusCode::PAYLOAD_TOO_LARGE
        }
        TusError::Busy => StatusCode::LOCKED,
        TusError::ChecksumMismatch { .. } => {
            StatusCode::from_u16(CHECKSUM_MISMATCH_STATUS).unwrap_or(StatusCode::BAD_REQUEST)
        }
        TusError::StoreUnavailable(_) | TusError::IncompleteUpload { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        warn!(error = %err, retryable = err.is_retryable(), "upload operation failed");
    } else {
        debug!(error = %err, status = status.as_u16(), "upload request rejected");
    }

    let mut response = TusResponse::new(status);
    response.body = err.to_string();
    match err {
        TusError::OffsetConflict { expected, .. } => response.header(UPLOAD_OFFSET, expected),
        TusError::Busy => response.header(header::RETRY_AFTER, BUSY_RETRY_AFTER_SECS),
        _ => response,
    }
}

/// 解析 `Upload-Metadata`：逗号分隔的 `key base64value`，值可省略。
pub fn parse_metadata(value: &str) -> Result<Metadata, TusError> {
    let mut metadata = Metadata::new();
    for pair in value.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let mut parts = pair.split(' ').filter(|part| !part.is_empty());
        let key = parts
            .next()
            .ok_or_else(|| TusError::InvalidMetadata(pair.to_string()))?;
        let decoded = match parts.next() {
            Some(encoded) => {
                let bytes = STANDARD
                    .decode(encoded)
                    .map_err(|_| TusError::InvalidMetadata(format!("{key}: value is not base64")))?;
                String::from_utf8(bytes)
                    .map_err(|_| TusError::InvalidMetadata(format!("{key}: value is not utf-8")))?
            }
            None => String::new(),
        };
        if parts.next().is_some() {
            return Err(TusError::InvalidMetadata(pair.to_string()));
        }
        if metadata.insert(key.to_string(), decoded).is_some() {
            return Err(TusError::InvalidMetadata(format!("{key}: duplicated key")));
        }
    }
    Ok(metadata)
}

pub fn encode_metadata(metadata: &Metadata) -> String {
    metadata
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{key} {}", STANDARD.encode(value))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
