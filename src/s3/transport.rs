//! Signed HTTP transport for S3 requests
//!
//! Optimized with:
//! - HTTP/1.1 only with a tuned idle connection pool
//! - TCP_NODELAY for low latency
//! - native-tls (OpenSSL) for TLS
//! - Streamed request and response bodies with bounded-frequency progress callbacks
//! - Cooperative cancellation checked at every buffer iteration

use bytes::{Bytes, BytesMut};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransferError};
use crate::s3::client::parse_error_body;
use crate::s3::signer::S3SignerV4;

/// Request body type accepted by the pooled client
pub type RequestBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Progress callback receiving cumulative bytes transferred for one request
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Size of each streamed body frame
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Default minimum number of bytes between two progress callbacks
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 256 * 1024;

/// A request to sign and send. `url` must carry an already URI-encoded path.
#[derive(Debug, Clone)]
pub struct S3Request {
    pub method: Method,
    pub url: String,
    /// Extra headers, lowercase names
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl S3Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }
}

/// A fully collected response
#[derive(Debug, Clone)]
pub struct S3Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl S3Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// ETag header without surrounding quotes
    pub fn etag(&self) -> Option<String> {
        self.header("etag").map(|s| s.trim_matches('"').to_string())
    }

    /// Turn a non-2xx response into the matching error kind
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(status_error(self.status, &self.body))
        }
    }
}

/// Map a failed HTTP status to the error taxonomy.
///
/// 408, 429 and 5xx are transient and become `Transport`; everything else is
/// a `Protocol` error carrying the S3 error code when the body has one.
pub fn status_error(status: StatusCode, body: &[u8]) -> TransferError {
    let parsed = parse_error_body(body).unwrap_or_default();
    let code = if parsed.code.is_empty() {
        status.canonical_reason().unwrap_or("Unknown").to_string()
    } else {
        parsed.code
    };
    let message = if parsed.message.is_empty() {
        String::from_utf8_lossy(body).trim().to_string()
    } else {
        parsed.message
    };

    let transient = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;

    if transient {
        TransferError::Transport {
            status: Some(status.as_u16()),
            message: format!("{}: {}", code, message),
        }
    } else {
        TransferError::Protocol {
            status: Some(status.as_u16()),
            code,
            message,
        }
    }
}

/// Signed HTTP transport bound to a single endpoint
///
/// Clone is cheap - the underlying HTTP client uses Arc internally.
#[derive(Clone)]
pub struct HttpTransport {
    client: HyperClient<HttpsConnector<HttpConnector>, RequestBody>,
    signer: Arc<S3SignerV4>,
    endpoint: String,
    timeout: Duration,
    progress_interval: u64,
}

impl HttpTransport {
    /// Create a transport for `endpoint` (e.g. `https://s3.example.com`)
    pub fn new(endpoint: &str, signer: S3SignerV4, insecure_tls: bool) -> Result<Self> {
        let endpoint = endpoint.trim_end_matches('/');
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(TransferError::validation(format!(
                "endpoint must start with http:// or https://: {}",
                endpoint
            )));
        }

        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if insecure_tls {
            tracing::warn!("INSECURE TLS MODE ENABLED: Certificate verification is disabled!");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
        } else {
            TlsConnector::new()
        }
        .map_err(|e| TransferError::transport(format!("failed to build TLS connector: {}", e)))?;

        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(64)
            .set_host(true)
            .build(https);

        Ok(Self {
            client,
            signer: Arc::new(signer),
            endpoint: endpoint.to_string(),
            timeout: Duration::from_secs(300),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        })
    }

    /// Set per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the minimum number of bytes between progress callbacks
    pub fn with_progress_interval(mut self, bytes: u64) -> Self {
        self.progress_interval = bytes.max(1);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn signer(&self) -> &S3SignerV4 {
        &self.signer
    }

    /// Path-style object URL: `endpoint/bucket/key` with the key URI-encoded
    pub fn object_url(&self, bucket: &str, key: &str) -> String {
        let encoded_key = S3SignerV4::uri_encode(key, false);
        let mut url =
            String::with_capacity(self.endpoint.len() + bucket.len() + encoded_key.len() + 2);
        url.push_str(&self.endpoint);
        url.push('/');
        url.push_str(bucket);
        url.push('/');
        url.push_str(&encoded_key);
        url
    }

    /// Sign and send a request with an in-memory body, collecting the response.
    ///
    /// Non-2xx statuses are returned as responses; see [`S3Response::error_for_status`].
    pub async fn execute(&self, request: S3Request) -> Result<S3Response> {
        let signed = self.signer.sign(
            request.method.as_str(),
            &request.url,
            request.headers,
            &request.body,
        );
        let body: RequestBody = Full::new(request.body)
            .map_err(|never| match never {})
            .boxed_unsync();
        let req = Self::build_request(request.method, &request.url, &signed, body)?;

        self.with_timeout_limit(async {
            let response = self.send(req).await?;
            collect_response(response).await
        })
        .await
    }

    /// Stream `size` bytes from `reader` as the request body.
    ///
    /// The payload is signed as UNSIGNED-PAYLOAD; integrity is carried by any
    /// digest header the caller supplies (e.g. `content-md5`).
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_body<R>(
        &self,
        method: Method,
        url: &str,
        mut headers: BTreeMap<String, String>,
        reader: R,
        size: u64,
        on_bytes: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<S3Response>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        headers.insert("content-length".to_string(), size.to_string());
        let signed = self
            .signer
            .sign_unsigned_payload(method.as_str(), url, headers);

        let body = streaming_body(BodySource {
            reader,
            remaining: size,
            sent: 0,
            reported: 0,
            interval: self.progress_interval,
            on_bytes,
            cancel: cancel.clone(),
        });
        let req = Self::build_request(method, url, &signed, body)?;

        let result = self
            .with_timeout_limit(async {
                let response = self.send(req).await?;
                collect_response(response).await
            })
            .await;

        match result {
            Err(_) if cancel.is_cancelled() => Err(TransferError::Cancelled),
            other => other,
        }
    }

    /// Ranged GET of the inclusive byte span `[start, end]`.
    ///
    /// Returns the received bytes. A body longer than the span is rejected as it
    /// streams; callers verify a short body against the span.
    pub async fn download_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
        on_bytes: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if end < start {
            return Err(TransferError::validation(format!(
                "invalid byte range {}-{}",
                start, end
            )));
        }

        let mut headers = BTreeMap::new();
        headers.insert("range".to_string(), format!("bytes={}-{}", start, end));
        let signed = self.signer.sign("GET", url, headers, b"");
        let body: RequestBody = Full::new(Bytes::new())
            .map_err(|never| match never {})
            .boxed_unsync();
        let req = Self::build_request(Method::GET, url, &signed, body)?;

        let expected = end - start + 1;
        let interval = self.progress_interval;

        self.with_timeout_limit(async {
            let response = self.send(req).await?;
            let status = response.status();

            if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
                let error_body = response
                    .collect()
                    .await
                    .map(|c| c.to_bytes())
                    .unwrap_or_default();
                return Err(status_error(status, &error_body));
            }
            // A 200 means the server ignored Range and is sending from offset 0
            if status == StatusCode::OK && start != 0 {
                return Err(TransferError::Integrity(format!(
                    "server ignored range {}-{} and returned the whole object",
                    start, end
                )));
            }

            let mut body = response.into_body();
            let mut buf = BytesMut::with_capacity(expected as usize);
            let mut reported = 0u64;

            while let Some(frame) = body.frame().await {
                if cancel.is_cancelled() {
                    return Err(TransferError::Cancelled);
                }
                let frame = frame
                    .map_err(|e| TransferError::transport(format!("body error: {}", e)))?;
                if let Some(chunk) = frame.data_ref() {
                    if buf.len() as u64 + chunk.len() as u64 > expected {
                        return Err(TransferError::Integrity(format!(
                            "range {}-{} returned more than {} bytes",
                            start, end, expected
                        )));
                    }
                    buf.extend_from_slice(chunk);
                    let received = buf.len() as u64;
                    if received - reported >= interval {
                        on_bytes(received);
                        reported = received;
                    }
                }
            }

            let received = buf.len() as u64;
            if received != reported {
                on_bytes(received);
            }
            Ok(buf.freeze())
        })
        .await
    }

    fn build_request(
        method: Method,
        url: &str,
        signed_headers: &BTreeMap<String, String>,
        body: RequestBody,
    ) -> Result<Request<RequestBody>> {
        let mut req = Request::builder().method(method).uri(url);
        for (key, value) in signed_headers.iter() {
            req = req.header(key, value);
        }
        req.body(body)
            .map_err(|e| TransferError::validation(format!("request build error: {}", e)))
    }

    async fn send(&self, req: Request<RequestBody>) -> Result<Response<Incoming>> {
        self.client
            .request(req)
            .await
            .map_err(|e| TransferError::transport(format!("request failed: {}", e)))
    }

    async fn with_timeout_limit<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::transport(format!(
                "request timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

async fn collect_response(response: Response<Incoming>) -> Result<S3Response> {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .collect()
        .await
        .map_err(|e| TransferError::transport(format!("body error: {}", e)))?
        .to_bytes();
    Ok(S3Response { status, headers, body })
}

struct BodySource<R> {
    reader: R,
    remaining: u64,
    sent: u64,
    reported: u64,
    interval: u64,
    on_bytes: ProgressFn,
    cancel: CancellationToken,
}

/// Wrap a reader as a framed request body that reports progress and stops on cancellation
fn streaming_body<R>(source: BodySource<R>) -> RequestBody
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let stream = futures::stream::unfold(Some(source), |state| async move {
        let mut src = state?;
        if src.remaining == 0 {
            return None;
        }
        if src.cancel.is_cancelled() {
            let err = std::io::Error::new(std::io::ErrorKind::Interrupted, "transfer cancelled");
            return Some((Err(err), None));
        }

        let want = src.remaining.min(STREAM_BUFFER_SIZE as u64) as usize;
        let mut buf = BytesMut::zeroed(want);
        match src.reader.read(&mut buf).await {
            Ok(0) => {
                let err = std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "body source ended before declared length",
                );
                Some((Err(err), None))
            }
            Ok(n) => {
                buf.truncate(n);
                src.remaining -= n as u64;
                src.sent += n as u64;
                if src.sent - src.reported >= src.interval || src.remaining == 0 {
                    (src.on_bytes)(src.sent);
                    src.reported = src.sent;
                }
                Some((Ok(Frame::data(buf.freeze())), Some(src)))
            }
            Err(e) => Some((Err(e), None)),
        }
    });
    StreamBody::new(stream).boxed_unsync()
}
