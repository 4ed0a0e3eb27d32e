//! HTTP 辅助工具：tus 头部、版本协商、CORS 与安全头。

use axum::body::Body as AxumBody;
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, Method, Request};
use axum::{middleware, response::Response};
use std::net::IpAddr;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::error::ApiError;

/// 服务端支持的唯一协议版本。
pub const TUS_PROTOCOL_VERSION: &str = "1.0.0";
pub const TUS_EXTENSIONS: &str = "creation,creation-with-upload,termination,checksum,expiration";
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
pub const TUS_VERSION: HeaderName = HeaderName::from_static("tus-version");
pub const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
pub const TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
pub const TUS_CHECKSUM_ALGORITHM: HeaderName = HeaderName::from_static("tus-checksum-algorithm");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
pub const UPLOAD_CHECKSUM: HeaderName = HeaderName::from_static("upload-checksum");
pub const UPLOAD_EXPIRES: HeaderName = HeaderName::from_static("upload-expires");

pub fn insert_tus_resumable(headers: &mut HeaderMap) {
    headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_PROTOCOL_VERSION));
}

/// 校验 `Tus-Resumable` 并为所有响应补充该头（`OPTIONS` 除外）。
pub async fn tus_version_guard(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if request.method() != Method::OPTIONS {
        let version = request
            .headers()
            .get(&TUS_RESUMABLE)
            .and_then(|value| value.to_str().ok());
        if version != Some(TUS_PROTOCOL_VERSION) {
            return Err(ApiError::UnsupportedVersion);
        }
    }
    let mut response = next.run(request).await;
    insert_tus_resumable(response.headers_mut());
    Ok(response)
}

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers([
                header::LOCATION,
                TUS_RESUMABLE,
                TUS_VERSION,
                TUS_EXTENSION,
                TUS_MAX_SIZE,
                TUS_CHECKSUM_ALGORITHM,
                UPLOAD_OFFSET,
                UPLOAD_LENGTH,
                UPLOAD_METADATA,
                UPLOAD_EXPIRES,
            ]),
    )
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

pub async fn add_security_headers(request: Request<AxumBody>, next: middleware::Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_ip_takes_first_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.0.0.1, 192.168.1.1"),
        );
        assert_eq!(
            extract_forwarded_ip(&headers),
            Some("10.0.0.1".parse().expect("ip"))
        );
    }

    #[test]
    fn cors_layer_requires_valid_origins() {
        assert!(build_cors_layer(None).is_none());
        assert!(build_cors_layer(Some(" , ")).is_none());
        assert!(build_cors_layer(Some("https://app.example.com")).is_some());
    }
}
