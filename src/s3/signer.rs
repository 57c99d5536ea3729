//! AWS Signature Version 4 signer for S3 requests
//!
//! Two schemes are supported:
//! - Header signing: an `Authorization` header plus `x-amz-date` and
//!   `x-amz-content-sha256`
//! - Query signing (presigned URLs): the credential scope, timestamp, expiry and
//!   signature travel as `X-Amz-*` query parameters
//!
//! The signer is pure given its inputs except for the current timestamp, which
//! the `*_at` variants take explicitly. The derived signing key only changes
//! daily and is cached per date stamp.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Result, TransferError};

type HmacSha256 = Hmac<Sha256>;

/// Hex lookup table for zero-allocation percent encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Pre-computed SHA256 hash of empty payload
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Payload hash sentinel for streamed bodies, whose content is never buffered twice
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Shortest accepted presigned URL lifetime
pub const MIN_PRESIGN_EXPIRY: Duration = Duration::from_secs(1);

/// Longest accepted presigned URL lifetime (7 days)
pub const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Access key pair used to derive signatures
#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// AWS Signature Version 4 signer
pub struct S3SignerV4 {
    access_key: String,
    region: String,
    service: String,
    /// Pre-computed "AWS4" + secret_key as bytes
    aws4_key: Vec<u8>,
    /// Cached signing key per day: (date_stamp, derived_key)
    cached_signing_key: Mutex<Option<(String, [u8; 32])>>,
}

impl Clone for S3SignerV4 {
    fn clone(&self) -> Self {
        Self {
            access_key: self.access_key.clone(),
            region: self.region.clone(),
            service: self.service.clone(),
            aws4_key: self.aws4_key.clone(),
            // Each clone gets its own cache (populated on first use)
            cached_signing_key: Mutex::new(None),
        }
    }
}

impl S3SignerV4 {
    /// Create a new S3 signer
    pub fn new(credentials: Credentials, region: Option<String>) -> Self {
        let region = region.unwrap_or_else(|| "us-east-1".to_string());
        let aws4_key = format!("AWS4{}", credentials.secret_key).into_bytes();
        Self {
            access_key: credentials.access_key,
            region,
            service: "s3".to_string(),
            aws4_key,
            cached_signing_key: Mutex::new(None),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Sign a request whose payload is fully in memory.
    ///
    /// Empty payloads (GET, DELETE, HEAD) use the pre-computed empty hash.
    pub fn sign(
        &self,
        method: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        payload: &[u8],
    ) -> BTreeMap<String, String> {
        if payload.is_empty() {
            self.sign_at(method, url, headers, EMPTY_SHA256, Utc::now())
        } else {
            let hash = hex::encode(Sha256::digest(payload));
            self.sign_at(method, url, headers, &hash, Utc::now())
        }
    }

    /// Sign with UNSIGNED-PAYLOAD (streamed part bodies)
    pub fn sign_unsigned_payload(
        &self,
        method: &str,
        url: &str,
        headers: BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        self.sign_at(method, url, headers, UNSIGNED_PAYLOAD, Utc::now())
    }

    /// Header-scheme signing at an explicit instant.
    ///
    /// Header names in `headers` must already be lowercase. Returns the input
    /// headers plus `host`, `x-amz-date`, `x-amz-content-sha256` and
    /// `authorization`.
    pub fn sign_at(
        &self,
        method: &str,
        url: &str,
        mut headers: BTreeMap<String, String>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, String> {
        let (host, path, query) = Self::parse_url_fast(url);

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        headers.insert("host".to_string(), host.to_string());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        headers.insert(
            "x-amz-content-sha256".to_string(),
            payload_hash.to_string(),
        );

        let canonical_query = Self::create_canonical_query_string(query);
        let canonical_headers = Self::create_canonical_headers(&headers);
        let signed_headers = Self::create_signed_headers(&headers);

        // Path is used as-is: callers hand in an already URI-encoded path
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = self.credential_scope(&date_stamp);
        let string_to_sign = Self::string_to_sign(&amz_date, &credential_scope, &canonical_request);
        tracing::trace!(%canonical_request, %string_to_sign, "sigv4_header");

        let signature = self.calculate_signature(&date_stamp, &string_to_sign);

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.access_key, credential_scope, signed_headers, signature
        );
        headers.insert("authorization".to_string(), authorization);

        headers
    }

    /// Build a presigned URL valid for `expiry` from now
    pub fn presign(&self, method: &str, url: &str, expiry: Duration) -> Result<String> {
        self.presign_at(method, url, expiry, Utc::now())
    }

    /// Query-scheme signing at an explicit instant.
    ///
    /// Only `host` is signed; the payload hash is UNSIGNED-PAYLOAD. Rejects
    /// expiries shorter than one second or longer than seven days.
    pub fn presign_at(
        &self,
        method: &str,
        url: &str,
        expiry: Duration,
        now: DateTime<Utc>,
    ) -> Result<String> {
        if expiry < MIN_PRESIGN_EXPIRY || expiry > MAX_PRESIGN_EXPIRY {
            return Err(TransferError::validation(format!(
                "presign expiry must be between {}s and {}s, got {}s",
                MIN_PRESIGN_EXPIRY.as_secs(),
                MAX_PRESIGN_EXPIRY.as_secs(),
                expiry.as_secs()
            )));
        }

        let (host, path, query) = Self::parse_url_fast(url);
        let base = match url.find('?') {
            Some(pos) => &url[..pos],
            None => url,
        };

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let credential_scope = self.credential_scope(&date_stamp);

        let mut params = Self::decode_query_pairs(query);
        params.push(("X-Amz-Algorithm".to_string(), ALGORITHM.to_string()));
        params.push((
            "X-Amz-Credential".to_string(),
            format!("{}/{}", self.access_key, credential_scope),
        ));
        params.push(("X-Amz-Date".to_string(), amz_date.clone()));
        params.push(("X-Amz-Expires".to_string(), expiry.as_secs().to_string()));
        params.push(("X-Amz-SignedHeaders".to_string(), "host".to_string()));

        let canonical_query = Self::encode_sorted_pairs(params);
        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\n\nhost\n{}",
            method, path, canonical_query, host, UNSIGNED_PAYLOAD
        );

        let string_to_sign = Self::string_to_sign(&amz_date, &credential_scope, &canonical_request);
        tracing::trace!(%canonical_request, %string_to_sign, "sigv4_presign");

        let signature = self.calculate_signature(&date_stamp, &string_to_sign);

        Ok(format!(
            "{}?{}&X-Amz-Signature={}",
            base, canonical_query, signature
        ))
    }

    fn credential_scope(&self, date_stamp: &str) -> String {
        format!("{}/{}/{}/aws4_request", date_stamp, self.region, self.service)
    }

    fn string_to_sign(amz_date: &str, credential_scope: &str, canonical_request: &str) -> String {
        let canonical_request_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM, amz_date, credential_scope, canonical_request_hash
        )
    }

    /// Fast URL component extraction without heap allocation.
    ///
    /// Returns (host_with_port, path, query) as `&str` slices into the original URL.
    /// Strips default ports (:443 for https, :80 for http) from the host.
    fn parse_url_fast(url: &str) -> (&str, &str, &str) {
        let after_scheme = if let Some(rest) = url.strip_prefix("https://") {
            rest
        } else if let Some(rest) = url.strip_prefix("http://") {
            rest
        } else {
            url
        };

        let (authority, path_and_query) = match after_scheme.find('/') {
            Some(pos) => (&after_scheme[..pos], &after_scheme[pos..]),
            None => (after_scheme, "/"),
        };

        let (path, query) = match path_and_query.find('?') {
            Some(pos) => (&path_and_query[..pos], &path_and_query[pos + 1..]),
            None => (path_and_query, ""),
        };

        let host = if url.starts_with("https") {
            authority.strip_suffix(":443").unwrap_or(authority)
        } else {
            authority.strip_suffix(":80").unwrap_or(authority)
        };

        (host, path, query)
    }

    /// Create canonical query string (sorted by parameter name)
    ///
    /// Fast path: if all characters are already in canonical form, parameters
    /// are sorted, and all params have `=`, returns as-is. Valueless params
    /// like `?uploads` are normalized to `uploads=`.
    fn create_canonical_query_string(query: &str) -> String {
        if query.is_empty() {
            return String::new();
        }

        let all_canonical = query.bytes().all(|b| matches!(b,
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9'
            | b'-' | b'_' | b'.' | b'~'
            | b'=' | b'&' | b'%'
        ));

        if all_canonical {
            let mut sorted = true;
            let mut all_have_equals = true;
            let mut last_key: &str = "";
            for pair in query.split('&') {
                let key = match pair.find('=') {
                    Some(pos) => &pair[..pos],
                    None => {
                        all_have_equals = false;
                        pair
                    }
                };
                if key < last_key {
                    sorted = false;
                    break;
                }
                last_key = key;
            }
            if sorted && all_have_equals {
                return query.to_string();
            }
        }

        Self::encode_sorted_pairs(Self::decode_query_pairs(query))
    }

    fn decode_query_pairs(query: &str) -> Vec<(String, String)> {
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = match pair.find('=') {
                    Some(pos) => (&pair[..pos], &pair[pos + 1..]),
                    None => (pair, ""),
                };
                let key = urlencoding::decode(key).unwrap_or_else(|_| key.into());
                let value = urlencoding::decode(value).unwrap_or_else(|_| value.into());
                (key.into_owned(), value.into_owned())
            })
            .collect()
    }

    fn encode_sorted_pairs(pairs: Vec<(String, String)>) -> String {
        let mut encoded: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(k, v)| (Self::uri_encode(&k, true), Self::uri_encode(&v, true)))
            .collect();
        encoded.sort_unstable();

        let mut result = String::with_capacity(encoded.len() * 32);
        for (i, (k, v)) in encoded.iter().enumerate() {
            if i > 0 {
                result.push('&');
            }
            result.push_str(k);
            result.push('=');
            result.push_str(v);
        }
        result
    }

    /// Create canonical headers - keys are already lowercase and sorted by BTreeMap
    fn create_canonical_headers(headers: &BTreeMap<String, String>) -> String {
        let mut result = String::with_capacity(headers.len() * 64);
        for (k, v) in headers {
            result.push_str(k);
            result.push(':');
            result.push_str(v.trim());
            result.push('\n');
        }
        result
    }

    /// Create signed headers list - keys are already lowercase and sorted by BTreeMap
    fn create_signed_headers(headers: &BTreeMap<String, String>) -> String {
        let mut result = String::with_capacity(headers.len() * 20);
        for (i, k) in headers.keys().enumerate() {
            if i > 0 {
                result.push(';');
            }
            result.push_str(k);
        }
        result
    }

    /// Calculate the signature with daily signing key cache
    fn calculate_signature(&self, date_stamp: &str, string_to_sign: &str) -> String {
        let signing_key = {
            let mut cache = self
                .cached_signing_key
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match cache.as_ref() {
                Some((cached_date, cached_key)) if cached_date == date_stamp => *cached_key,
                _ => {
                    let key = self.derive_signing_key(date_stamp);
                    *cache = Some((date_stamp.to_string(), key));
                    key
                }
            }
        };

        hex::encode(Self::hmac_sha256(&signing_key, string_to_sign.as_bytes()))
    }

    /// Derive signing key: secret -> date -> region -> service -> "aws4_request"
    fn derive_signing_key(&self, date_stamp: &str) -> [u8; 32] {
        let k_date = Self::hmac_sha256(&self.aws4_key, date_stamp.as_bytes());
        let k_region = Self::hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = Self::hmac_sha256(&k_region, self.service.as_bytes());
        Self::hmac_sha256(&k_service, b"aws4_request")
    }

    /// HMAC-SHA256 returning fixed-size array (no heap allocation)
    fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(msg);
        let result = mac.finalize().into_bytes();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        output
    }

    /// URI encode a string (RFC 3986) using hex lookup table
    pub fn uri_encode(s: &str, encode_slash: bool) -> String {
        let mut result = String::with_capacity(s.len() + 16);
        for byte in s.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    result.push(byte as char);
                }
                b'/' if !encode_slash => {
                    result.push('/');
                }
                _ => {
                    result.push('%');
                    result.push(HEX_UPPER[(byte >> 4) as usize] as char);
                    result.push(HEX_UPPER[(byte & 0xf) as usize] as char);
                }
            }
        }
        result
    }
}
