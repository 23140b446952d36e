//! [`ObjectStore`] over any S3-compatible HTTP API, path-style addressing.

use bytes::Bytes;
use chrono::Utc;
use reqwest::{
    header::{AUTHORIZATION, ETAG, RETRY_AFTER},
    Method, Response,
};
use std::{collections::BTreeMap, fmt::Write as _, time::Duration};
use tracing::{debug, trace};
use url::Url;

use super::object_store::{
    CompletedPart, Listing, ObjectHeaders, ObjectStore, PutObject, MAX_LIST_KEYS,
};
use super::sigv4::{amz_date, canonical_query, sha256_hex, uri_encode, RequestParts, Signer};
use crate::config::StorageConfig;
use crate::error::{ConfigError, FailureReason};
use crate::source::parse_retry_after;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Client of one bucket.
pub struct S3Store {
    client: reqwest::Client,
    endpoint: Url,
    bucket: String,
    signer: Signer,
}

impl S3Store {
    pub fn new(cfg: &StorageConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: cfg.endpoint.clone(),
            bucket: cfg.bucket.clone(),
            signer: Signer::new(&cfg.access_key, &cfg.secret_key, &cfg.region),
        })
    }

    /// Path-style request path, below any base path of the endpoint.
    fn path(&self, key: Option<&str>) -> String {
        let base = self.endpoint.path().trim_end_matches('/');
        let bucket = uri_encode(&self.bucket, true);
        match key {
            Some(key) => format!("{}/{}/{}", base, bucket, uri_encode(key, false)),
            None => format!("{}/{}", base, bucket),
        }
    }

    /// Signs and sends one request. Non-success statuses are errors.
    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: &[(String, String)],
        extra_headers: BTreeMap<String, String>,
        body: Bytes,
    ) -> Result<Response, FailureReason> {
        let path = self.path(key);
        let mut url = self.endpoint.clone();
        url.set_path(&path);
        let query_string = canonical_query(query);
        url.set_query((!query_string.is_empty()).then_some(query_string.as_str()));

        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_owned(),
            (None, _) => return Err(FailureReason::internal("storage endpoint has no host")),
        };

        let payload_hash = sha256_hex(&body);
        let now = Utc::now();

        let mut headers = extra_headers;
        headers.insert("host".to_owned(), host);
        headers.insert("x-amz-content-sha256".to_owned(), payload_hash.clone());
        headers.insert("x-amz-date".to_owned(), amz_date(now));

        let authorization = self.signer.authorization(
            &RequestParts {
                method: method.as_str(),
                path: url.path(),
                query,
                headers: &headers,
                payload_hash: &payload_hash,
            },
            now,
        )?;

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .header(AUTHORIZATION, authorization);
        for (name, value) in headers.iter().filter(|(name, _)| name.as_str() != "host") {
            request = request.header(name.as_str(), value.as_str());
        }

        trace!(%method, %url, "storage request");
        let response = request
            .body(body)
            .send()
            .await
            .map_err(FailureReason::transport)?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response).await)
        }
    }
}

async fn error_from_response(response: Response) -> FailureReason {
    let status = response.status();
    let retry_after_ms = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
    let body = response.text().await.unwrap_or_default();
    let code = xml_first(&body, "Code").unwrap_or_default();
    debug!(status = status.as_u16(), code = %code, "storage error response");

    // Providers signal throttling as 503 SlowDown as well as 429.
    match code.as_str() {
        "SlowDown" | "Throttling" | "ThrottlingException" | "RequestLimitExceeded" => {
            FailureReason::Throttled { retry_after_ms }
        }
        _ => FailureReason::from_status(status.as_u16(), retry_after_ms),
    }
}

fn object_headers(headers: &ObjectHeaders) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert("content-type".to_owned(), headers.content_type.clone());
    out.insert("cache-control".to_owned(), headers.cache_control.clone());
    out.insert(
        "content-disposition".to_owned(),
        headers.content_disposition.clone(),
    );
    out.insert("x-amz-acl".to_owned(), headers.acl.clone());
    for (key, value) in &headers.metadata {
        out.insert(format!("x-amz-meta-{}", key.to_ascii_lowercase()), value.clone());
    }
    out
}

fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

impl ObjectStore for S3Store {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head_bucket(&self) -> Result<(), FailureReason> {
        self.send(Method::HEAD, None, &[], BTreeMap::new(), Bytes::new())
            .await
            .map(drop)
    }

    async fn list_prefix(&self, prefix: &str, max_keys: usize) -> Result<Listing, FailureReason> {
        let mut listing = Listing::default();
        let mut token: Option<String> = None;

        loop {
            let page = max_keys
                .saturating_sub(listing.keys.len())
                .min(MAX_LIST_KEYS)
                .to_string();
            let mut query = pairs(&[
                ("list-type", "2"),
                ("prefix", prefix),
                ("max-keys", page.as_str()),
            ]);
            if let Some(token) = &token {
                query.push(("continuation-token".to_owned(), token.clone()));
            }

            let body = self
                .send(Method::GET, None, &query, BTreeMap::new(), Bytes::new())
                .await?
                .text()
                .await
                .map_err(FailureReason::transport)?;

            listing.keys.extend(xml_all(&body, "Key"));
            let truncated = xml_first(&body, "IsTruncated").as_deref() == Some("true");
            token = xml_first(&body, "NextContinuationToken");

            if !truncated || token.is_none() {
                listing.truncated = truncated;
                break;
            }
            if listing.keys.len() >= max_keys {
                listing.truncated = true;
                break;
            }
        }

        listing.keys.truncate(max_keys);
        Ok(listing)
    }

    async fn head_object(&self, key: &str) -> Result<bool, FailureReason> {
        match self
            .send(Method::HEAD, Some(key), &[], BTreeMap::new(), Bytes::new())
            .await
        {
            Ok(_) => Ok(true),
            Err(FailureReason::HttpStatus { code: 404 }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn put_object(&self, request: PutObject) -> Result<(), FailureReason> {
        let mut headers = object_headers(&request.headers);
        headers.insert("content-md5".to_owned(), request.content_md5);

        self.send(Method::PUT, Some(&request.key), &[], headers, request.body)
            .await
            .map(drop)
    }

    async fn create_multipart(
        &self,
        key: &str,
        headers: &ObjectHeaders,
    ) -> Result<String, FailureReason> {
        let body = self
            .send(
                Method::POST,
                Some(key),
                &pairs(&[("uploads", "")]),
                object_headers(headers),
                Bytes::new(),
            )
            .await?
            .text()
            .await
            .map_err(FailureReason::transport)?;

        xml_first(&body, "UploadId")
            .ok_or_else(|| FailureReason::internal("multipart upload response without UploadId"))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, FailureReason> {
        let part = part_number.to_string();
        let response = self
            .send(
                Method::PUT,
                Some(key),
                &pairs(&[("partNumber", part.as_str()), ("uploadId", upload_id)]),
                BTreeMap::new(),
                body,
            )
            .await?;

        response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| FailureReason::internal("upload part response without ETag"))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), FailureReason> {
        let mut xml = String::from("<CompleteMultipartUpload>");
        for part in parts {
            let _ = write!(
                xml,
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                part.part_number,
                xml_escape(&part.etag)
            );
        }
        xml.push_str("</CompleteMultipartUpload>");

        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_owned(), "application/xml".to_owned());

        let body = self
            .send(
                Method::POST,
                Some(key),
                &pairs(&[("uploadId", upload_id)]),
                headers,
                Bytes::from(xml),
            )
            .await?
            .text()
            .await
            .map_err(FailureReason::transport)?;

        // Completion can fail after a 200 status line.
        if body.contains("<Error>") {
            let code = xml_first(&body, "Code").unwrap_or_default();
            return Err(FailureReason::transport(format!(
                "multipart completion failed: {}",
                code
            )));
        }

        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), FailureReason> {
        match self
            .send(
                Method::DELETE,
                Some(key),
                &pairs(&[("uploadId", upload_id)]),
                BTreeMap::new(),
                Bytes::new(),
            )
            .await
        {
            Ok(_) | Err(FailureReason::HttpStatus { code: 404 }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Text of every `<tag>…</tag>` element, unescaped.
fn xml_all(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);

    let mut found = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        rest = &rest[start + open.len()..];
        let Some(end) = rest.find(&close) else {
            break;
        };
        found.push(xml_unescape(&rest[..end]));
        rest = &rest[end + close.len()..];
    }
    found
}

fn xml_first(xml: &str, tag: &str) -> Option<String> {
    xml_all(xml, tag).into_iter().next()
}

fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_PAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>planning</Name>
  <Prefix>hanoi/qh-2030/</Prefix>
  <KeyCount>2</KeyCount>
  <MaxKeys>1000</MaxKeys>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM=</NextContinuationToken>
  <Contents><Key>hanoi/qh-2030/12/3252_1803.png</Key><Size>2048</Size></Contents>
  <Contents><Key>hanoi/qh-2030/12/a&amp;b.png</Key><Size>2048</Size></Contents>
</ListBucketResult>"#;

    #[test]
    fn parses_listing_page() {
        assert_eq!(
            xml_all(LIST_PAGE, "Key"),
            vec!["hanoi/qh-2030/12/3252_1803.png", "hanoi/qh-2030/12/a&b.png"]
        );
        assert_eq!(xml_first(LIST_PAGE, "IsTruncated").as_deref(), Some("true"));
        assert_eq!(
            xml_first(LIST_PAGE, "NextContinuationToken").as_deref(),
            Some("1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM=")
        );
        assert_eq!(xml_first(LIST_PAGE, "UploadId"), None);
    }

    #[test]
    fn escapes_round_trip() {
        assert_eq!(xml_unescape(&xml_escape("\"a&b<c>\"")), "\"a&b<c>\"");
    }

    #[test]
    fn object_headers_are_prefixed() {
        let headers = ObjectHeaders {
            content_type: "image/png".into(),
            cache_control: "max-age=31536000, public".into(),
            content_disposition: "inline".into(),
            acl: "public-read".into(),
            metadata: maplit::btreemap! { "region".to_owned() => "hanoi".to_owned() },
        };
        let out = object_headers(&headers);
        assert_eq!(out["x-amz-meta-region"], "hanoi");
        assert_eq!(out["x-amz-acl"], "public-read");
        assert_eq!(out["content-type"], "image/png");
    }

    #[test]
    fn path_style_urls() {
        let cfg = StorageConfig {
            endpoint: Url::parse("http://localhost:9000").unwrap(),
            bucket: "planning".into(),
            region: "us-east-1".into(),
            access_key: "a".into(),
            secret_key: "s".into(),
        };
        let store = S3Store::new(&cfg).unwrap();
        assert_eq!(store.path(None), "/planning");
        assert_eq!(
            store.path(Some("hanoi/qh-2030/12/1_2.png")),
            "/planning/hanoi/qh-2030/12/1_2.png"
        );
        assert_eq!(store.bucket(), "planning");
    }

    #[test]
    fn endpoint_base_path_is_kept() {
        let cfg = StorageConfig {
            endpoint: Url::parse("https://storage.example.vn/s3/").unwrap(),
            bucket: "planning".into(),
            region: "us-east-1".into(),
            access_key: "a".into(),
            secret_key: "s".into(),
        };
        let store = S3Store::new(&cfg).unwrap();
        assert_eq!(store.path(None), "/s3/planning");
        assert_eq!(
            store.path(Some("tiles/hanoi/qh-2030/12/1_2.png")),
            "/s3/planning/tiles/hanoi/qh-2030/12/1_2.png"
        );
    }
}
