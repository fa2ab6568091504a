//! AWS Signature Version 4 request signing
//!
//! Hand-rolled signer for S3-compatible object stores. Pure: no clock reads
//! beyond what the caller puts in the context, no I/O. The output must match
//! what the server reconstructs byte-for-byte, so canonicalization lives in
//! one place (`CanonicalHeaders`, `canonical_query`) instead of at call sites.
//!
//! Reference: <https://docs.aws.amazon.com/AmazonS3/latest/API/sig-v4-header-based-auth.html>

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::SigningError;

/// Algorithm identifier placed in the string to sign and the Authorization header.
pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// `x-amz-date` format (`YYYYMMDDTHHMMSSZ`).
pub const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

const DATE_STAMP_FORMAT: &str = "%Y%m%d";
const SCOPE_TERMINATOR: &str = "aws4_request";

pub const HEADER_HOST: &str = "host";
pub const HEADER_AMZ_DATE: &str = "x-amz-date";
pub const HEADER_CONTENT_SHA256: &str = "x-amz-content-sha256";
pub const HEADER_AUTHORIZATION: &str = "authorization";

/// Long-term access key pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Signed header set, canonical at construction.
///
/// Names are lower-cased and kept sorted; values are trimmed with inner
/// whitespace runs collapsed to one space. Line breaks are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalHeaders {
    entries: BTreeMap<String, String>,
}

impl CanonicalHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header.
    pub fn insert(&mut self, name: &str, value: &str) -> Result<&mut Self, SigningError> {
        let name = canonical_header_name(name)?;
        if value.contains(['\r', '\n']) {
            return Err(SigningError::InvalidHeader {
                name,
                reason: "value contains a line break",
            });
        }
        let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
        self.entries.insert(name, value);
        Ok(self)
    }

    /// Builder-style [`CanonicalHeaders::insert`].
    pub fn with(mut self, name: &str, value: &str) -> Result<Self, SigningError> {
        self.insert(name, value)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(name, value)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Semicolon-joined header names (`SignedHeaders=` value).
    pub fn signed_names(&self) -> String {
        self.entries
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(";")
    }

    /// `name:value\n` for every header, in order.
    pub fn canonical_block(&self) -> String {
        self.entries
            .iter()
            .map(|(name, value)| format!("{}:{}\n", name, value))
            .collect()
    }
}

fn canonical_header_name(name: &str) -> Result<String, SigningError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(SigningError::InvalidHeader {
            name: name.to_string(),
            reason: "empty header name",
        });
    }
    if !trimmed
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(SigningError::InvalidHeader {
            name: name.to_string(),
            reason: "header name contains invalid characters",
        });
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// Everything needed to sign one request.
///
/// `canonical_path` must already be URI-encoded (see [`encode_key_path`]);
/// `query_string` is an already-encoded `k=v&k=v` string or empty.
/// `headers` holds any extra headers to sign; `host`, `x-amz-date` and
/// `x-amz-content-sha256` are always added by [`sign`].
#[derive(Debug, Clone)]
pub struct SigningContext<'a> {
    pub credentials: &'a Credentials,
    pub region: &'a str,
    pub service: &'a str,
    pub host: &'a str,
    pub method: &'a str,
    pub canonical_path: &'a str,
    pub query_string: &'a str,
    pub headers: CanonicalHeaders,
    pub payload: &'a [u8],
    pub timestamp: DateTime<Utc>,
}

/// Headers produced by [`sign`]. Valid only for the request they were computed for.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    authorization: String,
    signature: String,
    amz_date: String,
    content_sha256: String,
    credential_scope: String,
    signed: CanonicalHeaders,
}

impl SignedHeaders {
    pub fn authorization(&self) -> &str {
        &self.authorization
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn amz_date(&self) -> &str {
        &self.amz_date
    }

    pub fn content_sha256(&self) -> &str {
        &self.content_sha256
    }

    pub fn credential_scope(&self) -> &str {
        &self.credential_scope
    }

    /// All signed headers, including `host`.
    pub fn signed_headers(&self) -> &CanonicalHeaders {
        &self.signed
    }

    /// Headers to attach to the outgoing request.
    ///
    /// Skips `host`, which the HTTP client derives from the URL.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .signed
            .iter()
            .filter(|(name, _)| *name != HEADER_HOST)
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        out.push((
            HEADER_AUTHORIZATION.to_string(),
            self.authorization.clone(),
        ));
        out
    }
}

/// Compute the SigV4 Authorization header for a request.
///
/// Deterministic for identical contexts (the timestamp is part of the context).
pub fn sign(ctx: &SigningContext<'_>) -> Result<SignedHeaders, SigningError> {
    validate(ctx)?;

    let payload_hash = hex_sha256(ctx.payload);
    let amz_date = ctx.timestamp.format(AMZ_DATE_FORMAT).to_string();
    let date_stamp = ctx.timestamp.format(DATE_STAMP_FORMAT).to_string();

    let mut signed = ctx.headers.clone();
    signed.insert(HEADER_HOST, ctx.host)?;
    signed.insert(HEADER_CONTENT_SHA256, &payload_hash)?;
    signed.insert(HEADER_AMZ_DATE, &amz_date)?;

    let signed_names = signed.signed_names();
    let canonical = canonical_request(
        ctx.method,
        ctx.canonical_path,
        ctx.query_string,
        &signed,
        &payload_hash,
    );

    let credential_scope = format!(
        "{}/{}/{}/{}",
        date_stamp, ctx.region, ctx.service, SCOPE_TERMINATOR
    );
    let to_sign = string_to_sign(&amz_date, &credential_scope, &hex_sha256(canonical.as_bytes()));

    let key = derive_signing_key(
        ctx.credentials.secret_access_key(),
        &date_stamp,
        ctx.region,
        ctx.service,
    );
    let signature = hex::encode(hmac_sha256(&key, to_sign.as_bytes()));

    let authorization = format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM,
        ctx.credentials.access_key_id(),
        credential_scope,
        signed_names,
        signature
    );

    Ok(SignedHeaders {
        authorization,
        signature,
        amz_date,
        content_sha256: payload_hash,
        credential_scope,
        signed,
    })
}

fn validate(ctx: &SigningContext<'_>) -> Result<(), SigningError> {
    if ctx.credentials.access_key_id().trim().is_empty() {
        return Err(SigningError::EmptyField("access_key_id"));
    }
    if ctx.credentials.secret_access_key().is_empty() {
        return Err(SigningError::EmptyField("secret_access_key"));
    }
    if ctx.region.trim().is_empty() {
        return Err(SigningError::EmptyField("region"));
    }
    if ctx.service.trim().is_empty() {
        return Err(SigningError::EmptyField("service"));
    }
    if ctx.host.trim().is_empty() {
        return Err(SigningError::EmptyField("host"));
    }
    if ctx.method.is_empty() || !ctx.method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(SigningError::InvalidMethod(ctx.method.to_string()));
    }
    if !ctx.canonical_path.starts_with('/') {
        return Err(SigningError::InvalidPath(ctx.canonical_path.to_string()));
    }
    Ok(())
}

/// Newline-joined canonical request.
pub fn canonical_request(
    method: &str,
    canonical_path: &str,
    query_string: &str,
    headers: &CanonicalHeaders,
    payload_hash: &str,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        canonical_path,
        canonical_query(query_string),
        headers.canonical_block(),
        headers.signed_names(),
        payload_hash
    )
}

/// Sort already-encoded query pairs by name, then value. No re-encoding.
pub fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(&str, &str)> = query
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn string_to_sign(amz_date: &str, credential_scope: &str, canonical_hash: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM, amz_date, credential_scope, canonical_hash
    )
}

/// Four-step HMAC chain seeded with `"AWS4" + secret`.
pub fn derive_signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, SCOPE_TERMINATOR.as_bytes())
}

/// URI-encode an object key one segment at a time, keeping `/` separators.
///
/// Only the RFC 3986 unreserved set passes through unescaped, which is what
/// S3 expects in the canonical path.
pub fn encode_key_path(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
