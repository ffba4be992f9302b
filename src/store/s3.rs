use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::config::BucketConfig;
use crate::store::{CompletedPart, CompletedUpload, ObjectStore, StoreError, UploadPart};

const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// S3-compatible object store speaking the REST multipart protocol directly,
/// with SigV4 request signing and path-style addressing.
pub struct S3Store {
    client: reqwest::Client,
    bucket: String,
    endpoint: String,
    region: String,
    key_id: String,
    app_key: String,
}

impl S3Store {
    pub fn new(config: &BucketConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            bucket: config.name.clone(),
            endpoint: config.endpoint.clone(),
            region: config.region.clone(),
            key_id: config.key_id.clone(),
            app_key: config.app_key.clone(),
        })
    }

    fn object_url(&self, key: &str, query: &[(&str, &str)]) -> String {
        let mut url = format!(
            "https://{}/{}/{}",
            self.endpoint,
            self.bucket,
            uri_encode(key, false)
        );
        if !query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query(query));
        }
        url
    }

    /// Builds the SigV4 headers for one request. Signed headers are always
    /// host, x-amz-content-sha256 and x-amz-date.
    fn sign(
        &self,
        method: &Method,
        key: &str,
        query: &[(&str, &str)],
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Vec<(&'static str, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let canonical_uri = format!("/{}/{}", self.bucket, uri_encode(key, false));
        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            self.endpoint, payload_hash, amz_date
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_query(query),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!("{}/{}/s3/aws4_request", date, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signature = hex::encode(signing_key_chain(
            &self.app_key,
            &date,
            &self.region,
            string_to_sign.as_bytes(),
        ));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.key_id, scope, signed_headers, signature
        );

        vec![
            ("x-amz-date", amz_date),
            ("x-amz-content-sha256", payload_hash.to_string()),
            ("authorization", authorization),
        ]
    }

    fn request(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        payload_hash: &str,
    ) -> reqwest::RequestBuilder {
        let headers = self.sign(&method, key, query, payload_hash, Utc::now());
        let mut builder = self.client.request(method, self.object_url(key, query));
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder
    }
}

async fn check_status(response: reqwest::Response, path: &str) -> Result<reqwest::Response, StoreError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::UnexpectedStatus {
        status,
        path: path.to_string(),
        body,
    })
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn create_multipart(&self, storage_path: &str) -> Result<String, StoreError> {
        let query = [("uploads", "")];
        let response = self
            .request(Method::POST, storage_path, &query, EMPTY_PAYLOAD_SHA256)
            .header("content-type", "video/mp4")
            .send()
            .await?;
        let body = check_status(response, storage_path).await?.text().await?;

        extract_xml_tag(&body, "UploadId")
            .map(str::to_string)
            .ok_or_else(|| {
                StoreError::MalformedResponse(format!(
                    "create-multipart response has no UploadId: {body}"
                ))
            })
    }

    async fn upload_part(&self, part: UploadPart) -> Result<CompletedPart, StoreError> {
        let part_number = part.part_number.to_string();
        let query = [
            ("partNumber", part_number.as_str()),
            ("uploadId", part.upload_id.as_str()),
        ];
        let payload_hash = sha256_hex(&part.body);

        let response = self
            .request(Method::PUT, &part.storage_path, &query, &payload_hash)
            .header("content-length", part.body.len())
            .body(part.body.clone())
            .send()
            .await?;
        let response = check_status(response, &part.storage_path).await?;

        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                StoreError::MalformedResponse("upload-part response has no ETag".to_string())
            })?;

        Ok(CompletedPart {
            part_number: part.part_number,
            etag,
        })
    }

    async fn complete_multipart(
        &self,
        upload_id: &str,
        storage_path: &str,
        parts: &[CompletedPart],
    ) -> Result<CompletedUpload, StoreError> {
        let query = [("uploadId", upload_id)];
        let body = completion_body(parts);
        let payload_hash = sha256_hex(body.as_bytes());

        let response = self
            .request(Method::POST, storage_path, &query, &payload_hash)
            .header("content-type", "application/xml")
            .body(body)
            .send()
            .await?;
        let text = check_status(response, storage_path).await?.text().await?;

        // S3 reports completion failures inside a 200 body.
        if text.contains("<Error>") {
            return Err(StoreError::MalformedResponse(format!(
                "complete-multipart failed: {text}"
            )));
        }

        Ok(CompletedUpload {
            recording_url: format!(
                "https://{}.{}/{}",
                self.bucket, self.endpoint, storage_path
            ),
        })
    }

    async fn put_object(&self, storage_path: &str, local_file: &Path) -> Result<(), StoreError> {
        let metadata = tokio::fs::metadata(local_file).await?;
        let file = File::open(local_file).await?;
        let stream = ReaderStream::new(file);

        let response = self
            .request(Method::PUT, storage_path, &[], UNSIGNED_PAYLOAD)
            .header("content-length", metadata.len())
            .header("content-type", "video/mp4")
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;
        check_status(response, storage_path).await?;

        Ok(())
    }

    async fn get_object(
        &self,
        storage_path: &str,
        download_path: &Path,
    ) -> Result<(), StoreError> {
        let response = self
            .request(Method::GET, storage_path, &[], EMPTY_PAYLOAD_SHA256)
            .send()
            .await?;
        let response = check_status(response, storage_path).await?;

        if let Some(parent) = download_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = File::create(download_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        Ok(())
    }
}

fn completion_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number, part.etag
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

fn extract_xml_tag<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(&body[start..end])
}

fn canonical_query(query: &[(&str, &str)]) -> String {
    let mut pairs: Vec<String> = query
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
        .collect();
    pairs.sort();
    pairs.join("&")
}

/// SigV4 URI encoding: unreserved characters pass through, everything else is
/// percent-encoded. `encode_slash` is false for path components.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn signing_key_chain(secret: &str, date: &str, region: &str, string_to_sign: &[u8]) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    hmac_sha256(&k_signing, string_to_sign)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> S3Store {
        S3Store::new(&BucketConfig {
            name: "recordings".to_string(),
            endpoint: "s3.example.com".to_string(),
            region: "us-east-1".to_string(),
            key_id: "AKIDEXAMPLE".to_string(),
            app_key: "secret".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn object_url_is_path_style() {
        let store = store();
        assert_eq!(
            store.object_url("recording_pipeline_1.mp4", &[]),
            "https://s3.example.com/recordings/recording_pipeline_1.mp4"
        );
        assert_eq!(
            store.object_url("pipeline_1/chunk_00000.mp4", &[("uploadId", "abc")]),
            "https://s3.example.com/recordings/pipeline_1/chunk_00000.mp4?uploadId=abc"
        );
    }

    #[test]
    fn canonical_query_sorts_pairs() {
        assert_eq!(
            canonical_query(&[("uploadId", "u-1"), ("partNumber", "3")]),
            "partNumber=3&uploadId=u-1"
        );
        assert_eq!(canonical_query(&[("uploads", "")]), "uploads=");
    }

    #[test]
    fn uri_encode_handles_reserved_bytes() {
        assert_eq!(uri_encode("chunk_00000.mp4", true), "chunk_00000.mp4");
        assert_eq!(uri_encode("a b", true), "a%20b");
        assert_eq!(uri_encode("a/b", false), "a/b");
        assert_eq!(uri_encode("a/b", true), "a%2Fb");
    }

    #[test]
    fn signing_is_deterministic_and_scoped() {
        let store = store();
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
        let headers = store.sign(
            &Method::PUT,
            "recording_pipeline_1.mp4",
            &[("partNumber", "1"), ("uploadId", "u-1")],
            EMPTY_PAYLOAD_SHA256,
            now,
        );

        let auth = &headers
            .iter()
            .find(|(name, _)| *name == "authorization")
            .unwrap()
            .1;
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240502/us-east-1/s3/aws4_request"
        ));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));

        // Same inputs must produce the same signature.
        let again = store.sign(
            &Method::PUT,
            "recording_pipeline_1.mp4",
            &[("partNumber", "1"), ("uploadId", "u-1")],
            EMPTY_PAYLOAD_SHA256,
            now,
        );
        assert_eq!(headers, again);
    }

    #[test]
    fn completion_body_lists_parts_in_order() {
        let body = completion_body(&[
            CompletedPart {
                part_number: 1,
                etag: "\"e1\"".to_string(),
            },
            CompletedPart {
                part_number: 2,
                etag: "\"e2\"".to_string(),
            },
        ]);
        assert_eq!(
            body,
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>\"e1\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"e2\"</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[test]
    fn upload_id_extracted_from_response() {
        let body = r#"<?xml version="1.0"?>
            <InitiateMultipartUploadResult>
              <Bucket>recordings</Bucket>
              <Key>recording_pipeline_1.mp4</Key>
              <UploadId>VXBsb2FkIElE</UploadId>
            </InitiateMultipartUploadResult>"#;
        assert_eq!(extract_xml_tag(body, "UploadId"), Some("VXBsb2FkIElE"));
        assert_eq!(extract_xml_tag("<nope/>", "UploadId"), None);
    }
}
