//! tus 上传处理器：解析请求头与请求体并交给协议适配层。

use axum::Error as AxumError;
use axum::Router;
use axum::body::Body as AxumBody;
use axum::extract::{DefaultBodyLimit, Extension, Path};
use axum::http::{HeaderMap, header};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{head, post};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use std::sync::Arc;

use crate::checksum::Checksum;
use crate::config::TusConfig;
use crate::error::ApiError;
use crate::http::{
    OFFSET_OCTET_STREAM, UPLOAD_CHECKSUM, UPLOAD_LENGTH, UPLOAD_METADATA, UPLOAD_OFFSET,
    tus_version_guard,
};
use crate::protocol::{ProtocolAdapter, TusRequest, TusResponse, parse_metadata};
use crate::resolver::{Bindings, UPLOAD_ID_CAPTURE, UploadEndpoint};
use crate::storage::Metadata;

/// 单个请求体的大小上限。
#[derive(Clone, Copy, Debug)]
pub struct ChunkLimit(pub u64);

impl IntoResponse for TusResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

/// 为每个上传端点挂载创建与资源路由。
pub fn tus_router(config: &TusConfig, adapter: Arc<ProtocolAdapter>) -> Router {
    let mut router = Router::new();
    for endpoint in &config.endpoints {
        let routes = Router::new()
            .route(
                endpoint.url_template(),
                post(create_upload).options(upload_options),
            )
            .route(
                &endpoint.resource_pattern(),
                head(upload_status)
                    .patch(append_chunk)
                    .delete(delete_upload)
                    .options(upload_options),
            )
            .layer(Extension(endpoint.clone()));
        router = router.merge(routes);
    }
    router
        .layer(middleware::from_fn(tus_version_guard))
        .layer(DefaultBodyLimit::disable())
        .layer(Extension(ChunkLimit(config.max_chunk_size)))
        .layer(Extension(adapter))
}

/// `OPTIONS`：返回服务端能力。
pub async fn upload_options(
    Extension(adapter): Extension<Arc<ProtocolAdapter>>,
    Extension(endpoint): Extension<Arc<UploadEndpoint>>,
) -> TusResponse {
    adapter
        .handle(&endpoint, &Bindings::new(), TusRequest::Options)
        .await
}

/// `POST`：创建上传，可携带首个分片。
pub async fn create_upload(
    Extension(adapter): Extension<Arc<ProtocolAdapter>>,
    Extension(endpoint): Extension<Arc<UploadEndpoint>>,
    Extension(ChunkLimit(limit)): Extension<ChunkLimit>,
    Path(bindings): Path<Bindings>,
    headers: HeaderMap,
    body: AxumBody,
) -> Result<TusResponse, ApiError> {
    let length = header_str(&headers, &UPLOAD_LENGTH)
        .ok_or_else(|| ApiError::BadRequest("Upload-Length is required".into()))?
        .parse::<i64>()
        .map_err(|_| ApiError::BadRequest("Upload-Length is invalid".into()))?;
    let metadata = match header_str(&headers, &UPLOAD_METADATA) {
        Some(value) => parse_metadata(value).map_err(|err| ApiError::BadRequest(err.to_string()))?,
        None => Metadata::new(),
    };

    let initial_chunk = if is_offset_stream(&headers) {
        Some(read_body(body, &headers, limit).await?)
    } else {
        None
    };
    let checksum = parse_checksum(&headers)?;

    let request = TusRequest::Create {
        length,
        metadata,
        initial_chunk,
        checksum,
    };
    Ok(adapter.handle(&endpoint, &bindings, request).await)
}

/// `HEAD`：返回续传偏移量。
pub async fn upload_status(
    Extension(adapter): Extension<Arc<ProtocolAdapter>>,
    Extension(endpoint): Extension<Arc<UploadEndpoint>>,
    Path(bindings): Path<Bindings>,
) -> Result<TusResponse, ApiError> {
    let (bindings, id) = split_upload_id(bindings)?;
    Ok(adapter
        .handle(&endpoint, &bindings, TusRequest::Status { id })
        .await)
}

/// `PATCH`：在声明的偏移量处追加分片。
pub async fn append_chunk(
    Extension(adapter): Extension<Arc<ProtocolAdapter>>,
    Extension(endpoint): Extension<Arc<UploadEndpoint>>,
    Extension(ChunkLimit(limit)): Extension<ChunkLimit>,
    Path(bindings): Path<Bindings>,
    headers: HeaderMap,
    body: AxumBody,
) -> Result<TusResponse, ApiError> {
    let (bindings, id) = split_upload_id(bindings)?;
    if !is_offset_stream(&headers) {
        return Err(ApiError::UnsupportedMediaType);
    }
    let offset = header_str(&headers, &UPLOAD_OFFSET)
        .ok_or_else(|| ApiError::BadRequest("Upload-Offset is required".into()))?
        .parse::<u64>()
        .map_err(|_| ApiError::BadRequest("Upload-Offset is invalid".into()))?;
    let checksum = parse_checksum(&headers)?;
    let bytes = read_body(body, &headers, limit).await?;

    let request = TusRequest::Append {
        id,
        offset,
        bytes,
        checksum,
    };
    Ok(adapter.handle(&endpoint, &bindings, request).await)
}

/// `DELETE`：终止上传。
pub async fn delete_upload(
    Extension(adapter): Extension<Arc<ProtocolAdapter>>,
    Extension(endpoint): Extension<Arc<UploadEndpoint>>,
    Path(bindings): Path<Bindings>,
) -> Result<TusResponse, ApiError> {
    let (bindings, id) = split_upload_id(bindings)?;
    Ok(adapter
        .handle(&endpoint, &bindings, TusRequest::Delete { id })
        .await)
}

fn split_upload_id(mut bindings: Bindings) -> Result<(Bindings, String), ApiError> {
    let id = bindings
        .remove(UPLOAD_ID_CAPTURE)
        .ok_or_else(|| ApiError::BadRequest("upload id is required".into()))?;
    Ok((bindings, id))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &header::HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

fn is_offset_stream(headers: &HeaderMap) -> bool {
    header_str(headers, &header::CONTENT_TYPE)
        .and_then(|value| value.split(';').next())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case(OFFSET_OCTET_STREAM))
}

fn parse_checksum(headers: &HeaderMap) -> Result<Option<Checksum>, ApiError> {
    header_str(headers, &UPLOAD_CHECKSUM)
        .map(Checksum::parse)
        .transpose()
        .map_err(|err| ApiError::BadRequest(err.to_string()))
}

/// 读取请求体，超过 `limit` 字节时拒绝。
async fn read_body(body: AxumBody, headers: &HeaderMap, limit: u64) -> Result<Vec<u8>, ApiError> {
    let declared = header_str(headers, &header::CONTENT_LENGTH)
        .and_then(|value| value.parse::<u64>().ok());
    if declared.is_some_and(|length| length > limit) {
        return Err(ApiError::PayloadTooLarge(limit));
    }

    let mut bytes = Vec::with_capacity(declared.unwrap_or(0) as usize);
    let mut data_stream = BodyExt::into_data_stream(body);
    while let Some(chunk) = data_stream.next().await {
        // 连接中断时尚未提交任何数据。
        let chunk = chunk.map_err(|err: AxumError| ApiError::BadRequest(err.to_string()))?;
        if bytes.len() as u64 + chunk.len() as u64 > limit {
            return Err(ApiError::PayloadTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::UploadEngine;
    use crate::http::{TUS_RESUMABLE, TUS_VERSION};
    use axum::http::{Request, StatusCode};
    use std::path::PathBuf;
    use tempfile::tempdir;
    use tower::ServiceExt;

    const HELLO: &[u8] = b"Hello, tus!\nThis file is uploaded in two chunks.\n";

    fn make_router(endpoints: Vec<UploadEndpoint>, max_chunk_size: u64) -> Router {
        let mut config = TusConfig::new(endpoints).expect("config");
        config.max_chunk_size = max_chunk_size;
        let config = Arc::new(config);
        let adapter = Arc::new(ProtocolAdapter::new(Arc::new(UploadEngine::new(
            config.clone(),
        ))));
        tus_router(&config, adapter)
    }

    fn tus_request(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("Tus-Resumable", "1.0.0")
    }

    async fn create(router: &Router, url: &str, length: usize, filename: &str) -> String {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(filename);
        let response = router
            .clone()
            .oneshot(
                tus_request("POST", url)
                    .header("Upload-Length", length.to_string())
                    .header("Upload-Metadata", format!("filename {encoded}"))
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(&TUS_RESUMABLE).expect("tus-resumable"),
            "1.0.0"
        );
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .expect("location")
            .to_string()
    }

    async fn patch(router: &Router, location: &str, offset: usize, chunk: &[u8]) -> Response {
        router
            .clone()
            .oneshot(
                tus_request("PATCH", location)
                    .header("Upload-Offset", offset.to_string())
                    .header(header::CONTENT_TYPE, OFFSET_OCTET_STREAM)
                    .body(AxumBody::from(chunk.to_vec()))
                    .expect("request"),
            )
            .await
            .expect("response")
    }

    fn upload_offset(response: &Response) -> &str {
        response
            .headers()
            .get(&UPLOAD_OFFSET)
            .and_then(|value| value.to_str().ok())
            .expect("upload-offset")
    }

    #[tokio::test]
    async fn upload_to_plain_endpoint() {
        let temp = tempdir().expect("tempdir");
        let endpoint =
            UploadEndpoint::new("/uploads", temp.path().to_path_buf(), None).expect("endpoint");
        let router = make_router(vec![endpoint], 1024);

        let location = create(&router, "/uploads", 11, "hello.txt").await;
        assert!(location.starts_with("/uploads/"));
        let response = patch(&router, &location, 0, b"hello world").await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(upload_offset(&response), "11");
        assert_eq!(
            std::fs::read(temp.path().join("hello.txt")).expect("read"),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn per_user_endpoints_resolve_storage_paths() {
        let temp = tempdir().expect("tempdir");
        let shared_root = temp.path().join("shared");
        let user_root = temp.path().join("users");
        let endpoints = vec![
            UploadEndpoint::new("/user/{username}/uploads", shared_root.clone(), None)
                .expect("endpoint"),
            UploadEndpoint::new(
                "/user/{username}/files",
                user_root.clone(),
                Some("{username}"),
            )
            .expect("endpoint"),
        ];
        let router = make_router(endpoints, 1024);

        let cases: [(&str, PathBuf); 2] = [
            ("/user/playpauseanddtop/uploads", shared_root.join("hello.txt")),
            (
                "/user/playpauseandstop/files",
                user_root.join("playpauseandstop").join("hello.txt"),
            ),
        ];
        for (url, expected) in cases {
            let location = create(&router, url, HELLO.len(), "hello.txt").await;
            assert!(location.starts_with(url));
            let (first, second) = HELLO.split_at(20);

            let response = patch(&router, &location, 0, first).await;
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
            let status = router
                .clone()
                .oneshot(
                    tus_request("HEAD", &location)
                        .body(AxumBody::empty())
                        .expect("request"),
                )
                .await
                .expect("response");
            assert_eq!(status.status(), StatusCode::OK);
            assert_eq!(upload_offset(&status), "20");

            let response = patch(&router, &location, first.len(), second).await;
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
            assert_eq!(std::fs::read(&expected).expect("read"), HELLO);
        }
    }

    #[tokio::test]
    async fn requests_without_tus_version_are_refused() {
        let temp = tempdir().expect("tempdir");
        let endpoint =
            UploadEndpoint::new("/uploads", temp.path().to_path_buf(), None).expect("endpoint");
        let router = make_router(vec![endpoint], 1024);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/uploads")
                    .header("Upload-Length", "3")
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        assert!(response.headers().get(&TUS_VERSION).is_some());

        let options = router
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/uploads")
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(options.status(), StatusCode::NO_CONTENT);
        assert_eq!(options.headers().get(&TUS_VERSION).expect("tus-version"), "1.0.0");
    }

    #[tokio::test]
    async fn patch_validates_headers_and_body_size() {
        let temp = tempdir().expect("tempdir");
        let endpoint =
            UploadEndpoint::new("/uploads", temp.path().to_path_buf(), None).expect("endpoint");
        let router = make_router(vec![endpoint], 4);
        let location = create(&router, "/uploads", 8, "data.bin").await;

        let wrong_type = router
            .clone()
            .oneshot(
                tus_request("PATCH", &location)
                    .header("Upload-Offset", "0")
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(AxumBody::from("abcd"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(wrong_type.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let too_big = patch(&router, &location, 0, b"abcdef").await;
        assert_eq!(too_big.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let stale = patch(&router, &location, 2, b"ab").await;
        assert_eq!(stale.status(), StatusCode::CONFLICT);
        assert_eq!(upload_offset(&stale), "0");
    }

    #[tokio::test]
    async fn traversal_in_binding_is_a_client_error() {
        let temp = tempdir().expect("tempdir");
        let endpoint = UploadEndpoint::new(
            "/user/{username}/files",
            temp.path().join("users"),
            Some("{username}"),
        )
        .expect("endpoint");
        let router = make_router(vec![endpoint], 1024);

        let response = router
            .oneshot(
                tus_request("POST", "/user/..%2F..%2Fetc/files")
                    .header("Upload-Length", "3")
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!temp.path().join("etc").exists());
    }

    #[tokio::test]
    async fn delete_is_idempotent_over_http() {
        let temp = tempdir().expect("tempdir");
        let endpoint =
            UploadEndpoint::new("/uploads", temp.path().to_path_buf(), None).expect("endpoint");
        let router = make_router(vec![endpoint], 1024);
        let location = create(&router, "/uploads", 3, "x.txt").await;

        for _ in 0..2 {
            let response = router
                .clone()
                .oneshot(
                    tus_request("DELETE", &location)
                        .body(AxumBody::empty())
                        .expect("request"),
                )
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }
        let status = router
            .oneshot(
                tus_request("HEAD", &location)
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(status.status(), StatusCode::NOT_FOUND);
    }
}
