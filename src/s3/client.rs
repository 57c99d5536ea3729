//! S3 client implementation for the multipart / ranged transfer subset
//!
//! Covers HEAD object, CreateMultipartUpload, UploadPart,
//! CompleteMultipartUpload, AbortMultipartUpload, ranged GET and presigned
//! URL generation. Response bodies are parsed straight from the wire XML into
//! typed records with byte-slice tag matching.

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use hyper::Method;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransferError};
use crate::s3::signer::{Credentials, S3SignerV4};
use crate::s3::transport::{status_error, HttpTransport, ProgressFn, S3Request, S3Response};
use crate::s3::types::{
    CompleteMultipartUploadResponse, CompletedPart, CreateMultipartUploadResponse,
    ObjectMetadata, PresignMethod, PresignedUrl, S3ErrorBody, UploadPartResponse,
};
use crate::transfer::check_identifiers;
use crate::transfer::remote::{ObjectStore, UploadPartRequest};

/// S3 client bound to one endpoint
///
/// Clone is cheap - the underlying HTTP client uses Arc internally.
#[derive(Clone)]
pub struct S3Client {
    transport: HttpTransport,
}

impl S3Client {
    /// Create a client for `endpoint` using SigV4 credentials
    pub fn new(
        endpoint: &str,
        credentials: Credentials,
        region: Option<String>,
        insecure_tls: bool,
    ) -> Result<Self> {
        let signer = S3SignerV4::new(credentials, region);
        let transport = HttpTransport::new(endpoint, signer, insecure_tls)?;
        Ok(Self { transport })
    }

    pub fn from_transport(transport: HttpTransport) -> Self {
        Self { transport }
    }

    /// Set per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.transport = self.transport.with_timeout(timeout);
        self
    }

    /// Set the minimum number of bytes between progress callbacks
    pub fn with_progress_interval(mut self, bytes: u64) -> Self {
        self.transport = self.transport.with_progress_interval(bytes);
        self
    }

    pub fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    /// Append `?name=value&...` (RFC 3986 encoded values) to an object URL
    fn url_with_query(&self, bucket: &str, key: &str, query: &[(&str, &str)]) -> String {
        let mut url = self.transport.object_url(bucket, key);
        for (i, (name, value)) in query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(name);
            url.push('=');
            url.push_str(&S3SignerV4::uri_encode(value, true));
        }
        url
    }

    /// Probe object size and fingerprint (HeadObject)
    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        check_identifiers(bucket, key)?;
        let url = self.transport.object_url(bucket, key);
        let response = self
            .transport
            .execute(S3Request::new(Method::HEAD, url))
            .await?
            .error_for_status()?;

        let content_length = response
            .header("content-length")
            .ok_or_else(|| TransferError::protocol("HEAD response missing Content-Length"))?
            .parse::<u64>()
            .map_err(|e| TransferError::protocol(format!("invalid Content-Length: {}", e)))?;

        Ok(ObjectMetadata {
            content_length,
            etag: response.etag(),
            last_modified: response.header("last-modified").map(str::to_string),
            version_id: response.header("x-amz-version-id").map(str::to_string),
        })
    }

    /// Initiate a multipart upload (CreateMultipartUpload)
    pub async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<CreateMultipartUploadResponse> {
        check_identifiers(bucket, key)?;
        let url = format!("{}?uploads", self.transport.object_url(bucket, key));

        let request = S3Request::new(Method::POST, url)
            .header("content-type", "application/octet-stream");
        let response = self.transport.execute(request).await?.error_for_status()?;

        parse_create_multipart_response(&response.body)
    }

    /// Upload one part of a multipart upload (UploadPart)
    ///
    /// Part numbers are 1-indexed. The body is streamed with a `Content-MD5`
    /// header so the store verifies the part before acknowledging it.
    pub async fn upload_part(
        &self,
        request: UploadPartRequest<'_>,
        on_bytes: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<UploadPartResponse> {
        check_identifiers(request.bucket, request.key)?;
        let part_number = request.part_number.to_string();
        let url = self.url_with_query(
            request.bucket,
            request.key,
            &[("partNumber", &part_number), ("uploadId", request.upload_id)],
        );

        let mut headers = BTreeMap::new();
        headers.insert("content-md5".to_string(), request.content_md5.to_string());

        let size = request.data.len() as u64;
        let response = self
            .transport
            .upload_body(
                Method::PUT,
                &url,
                headers,
                std::io::Cursor::new(request.data),
                size,
                on_bytes,
                cancel,
            )
            .await?
            .error_for_status()?;

        let etag = response
            .etag()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| TransferError::protocol("UploadPart response missing ETag"))?;

        Ok(UploadPartResponse::new(request.part_number, etag))
    }

    /// Complete a multipart upload (CompleteMultipartUpload)
    ///
    /// Parts must be sorted by part number.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompleteMultipartUploadResponse> {
        check_identifiers(bucket, key)?;
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(TransferError::validation(
                "parts must be in strictly ascending part-number order",
            ));
        }

        let url = self.url_with_query(bucket, key, &[("uploadId", upload_id)]);
        let xml = build_complete_multipart_body(parts);

        let request = S3Request::new(Method::POST, url)
            .header("content-type", "application/xml")
            .header("content-length", xml.len().to_string())
            .body(Bytes::from(xml));
        let response = self.transport.execute(request).await?.error_for_status()?;

        // CompleteMultipartUpload can fail after a 200 with an <Error> document
        if let Some(err) = parse_error_body(&response.body) {
            return Err(embedded_error(&response, err));
        }

        let mut parsed = parse_complete_multipart_response(&response.body)?;
        if parsed.version_id.is_none() {
            parsed.version_id = response.header("x-amz-version-id").map(str::to_string);
        }
        Ok(parsed)
    }

    /// Abort a multipart upload (AbortMultipartUpload)
    ///
    /// Cancels the upload and deletes all uploaded parts.
    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<()> {
        check_identifiers(bucket, key)?;
        let url = self.url_with_query(bucket, key, &[("uploadId", upload_id)]);
        self.transport
            .execute(S3Request::new(Method::DELETE, url))
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Ranged GET of the inclusive span `[start, end]`
    pub async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
        on_bytes: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        check_identifiers(bucket, key)?;
        let url = self.transport.object_url(bucket, key);
        self.transport
            .download_range(&url, start, end, on_bytes, cancel)
            .await
    }

    /// Generate a presigned GET or PUT URL
    pub fn presign(
        &self,
        bucket: &str,
        key: &str,
        method: PresignMethod,
        expires_in: Duration,
    ) -> Result<PresignedUrl> {
        check_identifiers(bucket, key)?;
        let url = self.transport.object_url(bucket, key);
        let url = self
            .transport
            .signer()
            .presign(method.as_str(), &url, expires_in)?;
        Ok(PresignedUrl {
            url,
            method,
            expires_in,
        })
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        S3Client::head_object(self, bucket, key).await
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<CreateMultipartUploadResponse> {
        S3Client::create_multipart_upload(self, bucket, key).await
    }

    async fn upload_part(
        &self,
        request: UploadPartRequest<'_>,
        on_bytes: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<UploadPartResponse> {
        S3Client::upload_part(self, request, on_bytes, cancel).await
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompleteMultipartUploadResponse> {
        S3Client::complete_multipart_upload(self, bucket, key, upload_id, parts).await
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        S3Client::abort_multipart_upload(self, bucket, key, upload_id).await
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
        on_bytes: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        S3Client::get_range(self, bucket, key, start, end, on_bytes, cancel).await
    }
}

/// Base64 MD5 digest for the `Content-MD5` header
pub fn content_md5(data: &[u8]) -> String {
    let digest = md5::compute(data);
    base64::engine::general_purpose::STANDARD.encode(digest.0)
}

/// Hex MD5 digest, the form a plain part ETag takes
pub fn hex_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn embedded_error(response: &S3Response, err: S3ErrorBody) -> TransferError {
    match err.code.as_str() {
        "InternalError" | "SlowDown" | "ServiceUnavailable" => TransferError::Transport {
            status: Some(response.status.as_u16()),
            message: format!("{}: {}", err.code, err.message),
        },
        _ => TransferError::Protocol {
            status: Some(response.status.as_u16()),
            code: err.code,
            message: err.message,
        },
    }
}

/// Build the CompleteMultipartUpload request body
fn build_complete_multipart_body(parts: &[CompletedPart]) -> String {
    let mut xml = String::with_capacity(parts.len() * 100 + 100);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    xml.push_str("<CompleteMultipartUpload>");
    for part in parts {
        xml.push_str("<Part><PartNumber>");
        let _ = write!(xml, "{}", part.part_number);
        xml.push_str("</PartNumber><ETag>\"");
        xml_escape_into(&mut xml, part.etag.trim_matches('"'));
        xml.push_str("\"</ETag></Part>");
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

/// Escape XML special characters into an existing buffer
fn xml_escape_into(buf: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            '"' => buf.push_str("&quot;"),
            '\'' => buf.push_str("&apos;"),
            _ => buf.push(ch),
        }
    }
}

fn xml_reader(xml_data: &[u8]) -> Reader<&[u8]> {
    let mut reader = Reader::from_reader(xml_data);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;
    reader
}

/// Parse an S3 `<Error>` document. Returns `None` when the root element is not `Error`.
pub(crate) fn parse_error_body(xml_data: &[u8]) -> Option<S3ErrorBody> {
    let mut reader = xml_reader(xml_data);
    let mut body = S3ErrorBody::default();
    let mut current_text = String::new();
    let mut depth = 0usize;
    let mut is_error = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if depth == 0 {
                    if e.local_name().as_ref() != b"Error" {
                        return None;
                    }
                    is_error = true;
                }
                depth += 1;
            }
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape().ok()?);
            }
            Ok(Event::End(e)) => {
                depth = depth.saturating_sub(1);
                match e.local_name().as_ref() {
                    b"Code" => body.code = std::mem::take(&mut current_text),
                    b"Message" => body.message = std::mem::take(&mut current_text),
                    b"RequestId" => body.request_id = Some(std::mem::take(&mut current_text)),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }

    is_error.then_some(body)
}

/// Parse CreateMultipartUpload XML response
fn parse_create_multipart_response(xml_data: &[u8]) -> Result<CreateMultipartUploadResponse> {
    let mut reader = xml_reader(xml_data);

    let mut bucket = String::new();
    let mut key = String::new();
    let mut upload_id = String::new();
    let mut current_text = String::with_capacity(256);

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Bucket" => bucket = std::mem::take(&mut current_text),
                    b"Key" => key = std::mem::take(&mut current_text),
                    b"UploadId" => upload_id = std::mem::take(&mut current_text),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(TransferError::protocol(format!("XML parse error: {}", e))),
            _ => {}
        }
    }

    if upload_id.is_empty() {
        return Err(TransferError::protocol("missing UploadId in response"));
    }

    Ok(CreateMultipartUploadResponse::new(bucket, key, upload_id))
}

/// Parse CompleteMultipartUpload XML response
fn parse_complete_multipart_response(xml_data: &[u8]) -> Result<CompleteMultipartUploadResponse> {
    let mut reader = xml_reader(xml_data);

    let mut response = CompleteMultipartUploadResponse::default();
    let mut current_text = String::with_capacity(256);

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Location" => response.location = Some(std::mem::take(&mut current_text)),
                    b"Bucket" => response.bucket = std::mem::take(&mut current_text),
                    b"Key" => response.key = std::mem::take(&mut current_text),
                    b"ETag" => {
                        response.etag = current_text.trim_matches('"').to_string();
                    }
                    b"VersionId" => response.version_id = Some(std::mem::take(&mut current_text)),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(TransferError::protocol(format!("XML parse error: {}", e))),
            _ => {}
        }
    }

    if response.etag.is_empty() {
        return Err(TransferError::protocol(
            "missing ETag in CompleteMultipartUpload response",
        ));
    }

    Ok(response)
}
