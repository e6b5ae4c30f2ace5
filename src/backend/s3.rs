use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};

use super::{
    stream_copy, BackendError, ByteRange, ByteReader, ObjectKey, StorageBackend, WriteHints,
};
use crate::storage::models::StorageKind;

/// Objects above this size are written as a multipart upload.
const MULTIPART_THRESHOLD: usize = 8 * 1024 * 1024;
const PART_SIZE: usize = 8 * 1024 * 1024;

/// SHA-256 of an empty payload, used for bodyless requests.
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Debug, Clone)]
pub struct S3Config {
    /// Base endpoint, e.g. `https://s3.us-east-1.amazonaws.com` or a
    /// MinIO-style custom endpoint. Requests use path-style addressing.
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Optional key prefix, e.g. `attachments/`.
    pub key_prefix: Option<String>,
}

/// S3-compatible object store backend. Talks the REST API directly with
/// SigV4 request signing; no vendor SDK.
pub struct ObjectStoreBackend {
    config: S3Config,
    client: Client,
    /// Host (and port, when non-default) signed into every request.
    authority: String,
}

impl ObjectStoreBackend {
    pub fn new(config: S3Config) -> Result<Self, anyhow::Error> {
        let url = reqwest::Url::parse(&config.endpoint)?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("S3 endpoint has no host: {}", config.endpoint))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let client = Client::builder().build()?;

        Ok(Self {
            config,
            client,
            authority,
        })
    }

    /// Object key for a version: `{prefix}{record_id}/{version}`.
    fn object_key(&self, key: &ObjectKey<'_>) -> String {
        match &self.config.key_prefix {
            Some(prefix) => format!("{prefix}{}/{}", key.record_id, key.version),
            None => format!("{}/{}", key.record_id, key.version),
        }
    }

    fn object_url(&self, token: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.bucket,
            uri_encode(token, false)
        )
    }

    fn canonical_path(&self, token: &str) -> String {
        format!("/{}/{}", self.config.bucket, uri_encode(token, false))
    }

    /// Build the SigV4 headers (x-amz-date, x-amz-content-sha256,
    /// authorization) for a request. `amz_headers` carries any extra
    /// x-amz-* headers, which must all be signed.
    fn sign(
        &self,
        method: &Method,
        token: &str,
        query: &[(&str, &str)],
        amz_headers: &BTreeMap<String, String>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut headers: BTreeMap<String, String> = amz_headers.clone();
        headers.insert("host".to_string(), self.authority.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());
        headers.insert("x-amz-date".to_string(), amz_date.clone());

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{k}:{}\n", v.trim()))
            .collect();
        let signed_headers: String = headers
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(";");

        let mut query_pairs: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
            .collect();
        query_pairs.sort();
        let canonical_query: String = query_pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            self.canonical_path(token),
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!("{date}/{}/s3/aws4_request", self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex(sha256(canonical_request.as_bytes()))
        );

        // Derive the signing key: HMAC chain over date, region, service.
        let secret = format!("AWS4{}", self.config.secret_access_key);
        let k_date = hmac_sha256(secret.as_bytes(), date.as_bytes());
        let k_region = hmac_sha256(&k_date, self.config.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hex(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.config.access_key_id
        );

        let mut out: Vec<(String, String)> = amz_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.push(("x-amz-date".to_string(), amz_date));
        out.push(("x-amz-content-sha256".to_string(), payload_hash.to_string()));
        out.push(("authorization".to_string(), authorization));
        out
    }

    /// Send one signed request.
    async fn request(
        &self,
        method: Method,
        token: &str,
        query: &[(&str, &str)],
        amz_headers: BTreeMap<String, String>,
        unsigned_headers: Vec<(&'static str, String)>,
        body: Bytes,
    ) -> Result<reqwest::Response, BackendError> {
        let payload_hash = if body.is_empty() {
            EMPTY_PAYLOAD_SHA256.to_string()
        } else {
            hex(sha256(&body))
        };

        let signed = self.sign(
            &method,
            token,
            query,
            &amz_headers,
            &payload_hash,
            Utc::now(),
        );

        let mut url = self.object_url(token);
        if !query.is_empty() {
            let qs: Vec<String> = query
                .iter()
                .map(|(k, v)| {
                    if v.is_empty() {
                        format!("{}=", uri_encode(k, true))
                    } else {
                        format!("{}={}", uri_encode(k, true), uri_encode(v, true))
                    }
                })
                .collect();
            url = format!("{url}?{}", qs.join("&"));
        }

        let mut req = self.client.request(method, url).body(body);
        for (name, value) in signed {
            req = req.header(name, value);
        }
        for (name, value) in unsigned_headers {
            req = req.header(name, value);
        }

        req.send()
            .await
            .map_err(|e| BackendError::Backend(e.to_string()))
    }

    async fn error_from(resp: reqwest::Response, what: &str) -> BackendError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        BackendError::Backend(format!("{what} failed ({status}): {body}"))
    }

    async fn put_object(
        &self,
        token: &str,
        data: Bytes,
        hints: &WriteHints<'_>,
    ) -> Result<(), BackendError> {
        let resp = self
            .request(
                Method::PUT,
                token,
                &[],
                BTreeMap::new(),
                vec![
                    ("content-type", hints.content_type.to_string()),
                    ("content-disposition", content_disposition(hints.display_name)),
                ],
                data,
            )
            .await?;

        if !resp.status().is_success() {
            return Err(Self::error_from(resp, "object store upload").await);
        }
        Ok(())
    }

    async fn multipart_upload(
        &self,
        token: &str,
        data: Bytes,
        hints: &WriteHints<'_>,
    ) -> Result<(), BackendError> {
        // Initiate
        let resp = self
            .request(
                Method::POST,
                token,
                &[("uploads", "")],
                BTreeMap::new(),
                vec![
                    ("content-type", hints.content_type.to_string()),
                    ("content-disposition", content_disposition(hints.display_name)),
                ],
                Bytes::new(),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp, "multipart initiate").await);
        }
        let body = resp
            .text()
            .await
            .map_err(|e| BackendError::Backend(e.to_string()))?;
        let upload_id = xml_tag(&body, "UploadId")
            .ok_or_else(|| BackendError::Backend("multipart initiate: no UploadId".to_string()))?;

        match self.upload_parts(token, &data, &upload_id).await {
            Ok(etags) => self.complete_multipart(token, &upload_id, &etags).await,
            Err(e) => {
                // Best-effort abort so the store does not accumulate
                // half-finished uploads.
                let _ = self
                    .request(
                        Method::DELETE,
                        token,
                        &[("uploadId", upload_id.as_str())],
                        BTreeMap::new(),
                        Vec::new(),
                        Bytes::new(),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        token: &str,
        data: &Bytes,
        upload_id: &str,
    ) -> Result<Vec<String>, BackendError> {
        let mut etags = Vec::new();
        for (index, part) in data.chunks(PART_SIZE).enumerate() {
            let part_number = (index + 1).to_string();
            let resp = self
                .request(
                    Method::PUT,
                    token,
                    &[("partNumber", part_number.as_str()), ("uploadId", upload_id)],
                    BTreeMap::new(),
                    Vec::new(),
                    Bytes::copy_from_slice(part),
                )
                .await?;
            if !resp.status().is_success() {
                return Err(Self::error_from(resp, "multipart part upload").await);
            }
            let etag = resp
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| BackendError::Backend("part upload: no ETag".to_string()))?
                .to_string();
            etags.push(etag);
        }
        Ok(etags)
    }

    async fn complete_multipart(
        &self,
        token: &str,
        upload_id: &str,
        etags: &[String],
    ) -> Result<(), BackendError> {
        let mut xml = String::from("<CompleteMultipartUpload>");
        for (index, etag) in etags.iter().enumerate() {
            xml.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{etag}</ETag></Part>",
                index + 1
            ));
        }
        xml.push_str("</CompleteMultipartUpload>");

        let resp = self
            .request(
                Method::POST,
                token,
                &[("uploadId", upload_id)],
                BTreeMap::new(),
                Vec::new(),
                Bytes::from(xml),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp, "multipart complete").await);
        }
        // S3 can answer 200 and still carry an error document.
        let body = resp
            .text()
            .await
            .map_err(|e| BackendError::Backend(e.to_string()))?;
        if body.contains("<Error>") {
            return Err(BackendError::Backend(format!(
                "multipart complete failed: {body}"
            )));
        }
        Ok(())
    }

    async fn head_content_type(&self, token: &str) -> Result<String, BackendError> {
        let resp = self
            .request(
                Method::HEAD,
                token,
                &[],
                BTreeMap::new(),
                Vec::new(),
                Bytes::new(),
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(token.to_string()));
        }
        if !resp.status().is_success() {
            return Err(Self::error_from(resp, "object store head").await);
        }
        Ok(resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string())
    }

    /// Server-side copy. `source_token` must be in the same bucket.
    async fn copy_object(
        &self,
        source_token: &str,
        dest_token: &str,
        content_type: &str,
        display_name: &str,
    ) -> Result<(), BackendError> {
        let mut amz = BTreeMap::new();
        amz.insert(
            "x-amz-copy-source".to_string(),
            format!("/{}/{}", self.config.bucket, uri_encode(source_token, false)),
        );
        amz.insert("x-amz-metadata-directive".to_string(), "REPLACE".to_string());

        let resp = self
            .request(
                Method::PUT,
                dest_token,
                &[],
                amz,
                vec![
                    ("content-type", content_type.to_string()),
                    ("content-disposition", content_disposition(display_name)),
                ],
                Bytes::new(),
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(source_token.to_string()));
        }
        if !resp.status().is_success() {
            return Err(Self::error_from(resp, "object store copy").await);
        }
        // Copy reports some failures inside a 200 response.
        let body = resp
            .text()
            .await
            .map_err(|e| BackendError::Backend(e.to_string()))?;
        if body.contains("<Error>") {
            return Err(BackendError::Backend(format!("copy failed: {body}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::ObjectStore
    }

    async fn write(
        &self,
        key: &ObjectKey<'_>,
        data: Bytes,
        hints: &WriteHints<'_>,
    ) -> Result<String, BackendError> {
        let token = self.object_key(key);
        if data.len() > MULTIPART_THRESHOLD {
            self.multipart_upload(&token, data, hints).await?;
        } else {
            self.put_object(&token, data, hints).await?;
        }
        Ok(token)
    }

    async fn open_range(
        &self,
        token: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteReader, BackendError> {
        let range_header = range.map(|r| match r.length {
            Some(len) if len > 0 => format!("bytes={}-{}", r.offset, r.offset + len - 1),
            _ => format!("bytes={}-", r.offset),
        });

        let unsigned = match range_header {
            Some(h) => vec![("range", h)],
            None => Vec::new(),
        };

        let resp = self
            .request(
                Method::GET,
                token,
                &[],
                BTreeMap::new(),
                unsigned,
                Bytes::new(),
            )
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => return Err(BackendError::NotFound(token.to_string())),
            StatusCode::RANGE_NOT_SATISFIABLE => {
                return Err(BackendError::InvalidRange(token.to_string()));
            }
            s if !s.is_success() => {
                return Err(Self::error_from(resp, "object store download").await);
            }
            _ => {}
        }

        let data = resp
            .bytes()
            .await
            .map_err(|e| BackendError::Backend(e.to_string()))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn delete(&self, token: &str) -> Result<(), BackendError> {
        let resp = self
            .request(
                Method::DELETE,
                token,
                &[],
                BTreeMap::new(),
                Vec::new(),
                Bytes::new(),
            )
            .await?;

        // 404 is fine -- object already gone
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(Self::error_from(resp, "object store delete").await);
        }
        Ok(())
    }

    async fn rename(&self, token: &str, new_display_name: &str) -> Result<String, BackendError> {
        // Copy-to-self with replaced metadata; bytes stay where they are.
        let content_type = self.head_content_type(token).await?;
        self.copy_object(token, token, &content_type, new_display_name)
            .await?;
        Ok(token.to_string())
    }

    async fn relocate_from(
        &self,
        source: &dyn StorageBackend,
        source_token: &str,
        key: &ObjectKey<'_>,
        hints: &WriteHints<'_>,
    ) -> Result<String, BackendError> {
        if source.kind() != StorageKind::ObjectStore {
            return stream_copy(source, source_token, self, key, hints).await;
        }

        let token = self.object_key(key);
        self.copy_object(source_token, &token, hints.content_type, hints.display_name)
            .await?;
        Ok(token)
    }
}

// ============================================================================
// SigV4 primitives
// ============================================================================

fn sha256(data: &[u8]) -> Vec<u8> {
    ring::digest::digest(&ring::digest::SHA256, data)
        .as_ref()
        .to_vec()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, key);
    ring::hmac::sign(&key, data).as_ref().to_vec()
}

fn hex(bytes: impl AsRef<[u8]>) -> String {
    bytes
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// RFC 3986 encoding as SigV4 canonicalization wants it: unreserved
/// characters pass through, '/' passes through only in paths.
fn uri_encode(s: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn content_disposition(display_name: &str) -> String {
    // Quotes and control characters would corrupt the header value.
    let safe: String = display_name
        .chars()
        .filter(|c| *c != '"' && !c.is_control())
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

/// Extract the text inside the first `<tag>...</tag>` pair.
fn xml_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_encode_preserves_unreserved() {
        assert_eq!(uri_encode("abc-123_~.ok", true), "abc-123_~.ok");
        assert_eq!(uri_encode("a/b", false), "a/b");
        assert_eq!(uri_encode("a/b", true), "a%2Fb");
        assert_eq!(uri_encode("a b+c", true), "a%20b%2Bc");
    }

    #[test]
    fn xml_tag_extracts_first_match() {
        let body = "<r><UploadId>abc-123</UploadId></r>";
        assert_eq!(xml_tag(body, "UploadId"), Some("abc-123".to_string()));
        assert_eq!(xml_tag(body, "Missing"), None);
    }

    #[test]
    fn content_disposition_strips_quotes() {
        assert_eq!(
            content_disposition("a\"b.png"),
            "attachment; filename=\"ab.png\""
        );
    }

    // Signing vector from the SigV4 documentation's key-derivation example.
    #[test]
    fn sigv4_key_derivation_matches_reference() {
        let secret = "AWS4wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";
        let k_date = hmac_sha256(secret.as_bytes(), b"20150830");
        let k_region = hmac_sha256(&k_date, b"us-east-1");
        let k_service = hmac_sha256(&k_region, b"iam");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        assert_eq!(
            hex(k_signing),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }
}
