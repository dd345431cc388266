//! Request builders for the resumable-upload session lifecycle: creating a
//! session, probing the server-acknowledged offset, and the headers of the
//! chunk stream itself.

use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::Method;

use crate::config::UploadConfig;
use crate::error::internal_error;
use crate::metadata::ObjectMetadata;
use crate::request::{RequestBody, RequestInfo, ResponseHandler, StreamRequest};
use crate::util::{header_value, parse_range_end};

/// Bytes escaped when a bucket name is spliced into a URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

/// What an offset probe learned about the session.
#[derive(Clone, Debug, PartialEq)]
pub enum ProbeOutcome {
    /// The session is live and expects the byte at this offset next.
    Offset(u64),
    /// The upload already finished; the response may carry the object
    /// resource.
    Complete {
        status: u16,
        metadata: Option<ObjectMetadata>,
    },
}

/// POST to the object-insert endpoint with `uploadType=resumable`. The
/// response's `Location` header is the session URI.
pub fn create_session_request(config: &UploadConfig) -> RequestInfo<String> {
    let endpoint = config.endpoint();
    let bucket = utf8_percent_encode(&config.bucket, PATH_SEGMENT);
    let url = format!("{endpoint}/upload/storage/v1/b/{bucket}/o");

    let handler: ResponseHandler<String> = Arc::new(|payload| {
        header_value(&payload.headers, "Location")
            .map(str::to_owned)
            .ok_or_else(|| {
                internal_error("no Location header in the response to the session creation request")
            })
    });

    let mut request = RequestInfo::new(url, Method::POST, handler)
        .with_success_codes(vec![200, 201])
        .with_query_param("name", config.file.clone())
        .with_query_param("uploadType", "resumable")
        .with_header("Content-Type", "application/json")
        .with_body(RequestBody::Text(metadata_body(&config.metadata)));

    if let Some(generation) = config.generation {
        request = request.with_query_param("ifGenerationMatch", generation.to_string());
    }
    if let Some(kms_key_name) = &config.kms_key_name {
        request = request.with_query_param("kmsKeyName", kms_key_name.clone());
    }
    if let Some(acl) = config.resolved_predefined_acl() {
        request = request.with_query_param("predefinedAcl", acl.as_str());
    }
    if let Some(user_project) = &config.user_project {
        request = request.with_query_param("userProject", user_project.clone());
    }
    for (name, value) in &config.params {
        request = request.with_query_param(name.clone(), value.clone());
    }

    if let Some(content_length) = config.content_length() {
        request = request.with_header("X-Upload-Content-Length", content_length.to_string());
    }
    if let Some(content_type) = &config.metadata.content_type {
        request = request.with_header("X-Upload-Content-Type", content_type.clone());
    }
    if let Some(origin) = &config.origin {
        request = request.with_header("Origin", origin.clone());
    }
    request = request.with_headers(encryption_headers(config));
    request = request.with_headers(config.custom_request_headers.clone());

    request
}

/// The zero-length status PUT. `308` is a non-error here; its `Range` header
/// carries the acknowledged extent. 404 and 410 surface unretried so the
/// controller can apply its restart policy.
pub fn probe_status_request(session_uri: &str) -> RequestInfo<ProbeOutcome> {
    let handler: ResponseHandler<ProbeOutcome> = Arc::new(|payload| {
        let status = payload.status.as_u16();
        if status == 308 {
            let offset = match header_value(&payload.headers, "Range") {
                Some(range) => {
                    let end = parse_range_end(range).ok_or_else(|| {
                        internal_error(format!("unparseable Range header in probe response: {range}"))
                    })?;
                    end + 1
                }
                None => 0,
            };
            return Ok(ProbeOutcome::Offset(offset));
        }

        let metadata = if payload.body.is_empty() {
            None
        } else {
            serde_json::from_slice(&payload.body)
                .ok()
                .map(ObjectMetadata::from_value)
        };
        Ok(ProbeOutcome::Complete { status, metadata })
    });

    RequestInfo::new(session_uri, Method::PUT, handler)
        .with_success_codes(vec![200, 201, 308])
        .with_no_retry_statuses(vec![404, 410])
        .with_header("Content-Length", "0")
        .with_header("Content-Range", "bytes */*")
}

/// Headers and query for the streaming chunk PUT starting at `offset`.
pub fn stream_request(config: &UploadConfig, session_uri: &str, offset: u64) -> StreamRequest {
    let total = match config.content_length() {
        Some(length) => length.to_string(),
        None => "*".to_string(),
    };

    let mut request = StreamRequest {
        url: session_uri.to_string(),
        headers: encryption_headers(config),
        query_params: Default::default(),
    };
    request
        .headers
        .insert("Content-Range".to_string(), format!("bytes {offset}-*/{total}"));
    request.headers.extend(config.custom_request_headers.clone());

    if let Some(user_project) = &config.user_project {
        request
            .query_params
            .insert("userProject".to_string(), user_project.clone());
    }

    request
}

fn encryption_headers(config: &UploadConfig) -> std::collections::HashMap<String, String> {
    let mut headers = std::collections::HashMap::new();
    if let Some(spec) = config.encryption() {
        headers.insert("x-goog-encryption-algorithm".to_string(), "AES256".to_string());
        headers.insert("x-goog-encryption-key".to_string(), spec.key_base64);
        headers.insert(
            "x-goog-encryption-key-sha256".to_string(),
            spec.key_sha256_base64,
        );
    }
    headers
}

/// The session-creation body is the declared metadata, minus `contentLength`,
/// which travels as the `X-Upload-Content-Length` header instead.
fn metadata_body(metadata: &ObjectMetadata) -> String {
    let mut value = serde_json::to_value(metadata).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.remove("contentLength");
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ResponsePayload;
    use reqwest::StatusCode;

    fn payload(status: u16, headers: &[(&str, &str)], body: &[u8]) -> ResponsePayload {
        ResponsePayload {
            status: StatusCode::from_u16(status).unwrap(),
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn session_creation_request_shape() {
        let mut config = UploadConfig::new("photos", "vacation dir/photo.jpg");
        config.generation = Some(7);
        config.user_project = Some("billing-project".to_string());
        config.origin = Some("https://example.com".to_string());
        config.metadata.content_length = Some(3_145_728);
        config.metadata.content_type = Some("image/jpeg".to_string());
        config.key = Some(vec![0u8; 32]);

        let request = create_session_request(&config);
        assert_eq!(request.url, "https://storage.googleapis.com/upload/storage/v1/b/photos/o");
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.query_params.get("uploadType").unwrap(), "resumable");
        assert_eq!(request.query_params.get("name").unwrap(), "vacation dir/photo.jpg");
        assert_eq!(request.query_params.get("ifGenerationMatch").unwrap(), "7");
        assert_eq!(request.query_params.get("userProject").unwrap(), "billing-project");
        assert_eq!(request.headers.get("X-Upload-Content-Length").unwrap(), "3145728");
        assert_eq!(request.headers.get("X-Upload-Content-Type").unwrap(), "image/jpeg");
        assert_eq!(request.headers.get("Origin").unwrap(), "https://example.com");
        assert_eq!(request.headers.get("x-goog-encryption-algorithm").unwrap(), "AES256");

        // contentLength rides in the header, not in the body document.
        match &request.body {
            RequestBody::Text(body) => {
                let value: serde_json::Value = serde_json::from_str(body).unwrap();
                assert_eq!(value["contentType"], "image/jpeg");
                assert!(value.get("contentLength").is_none());
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn extracts_session_uri_from_location() {
        let request = create_session_request(&UploadConfig::new("b", "f"));
        let outcome = (request.response_handler)(payload(
            200,
            &[("location", "https://session-uri")],
            b"",
        ));
        assert_eq!(outcome.unwrap(), "https://session-uri");

        let missing = (request.response_handler)(payload(200, &[], b""));
        assert!(missing.is_err());
    }

    #[test]
    fn probe_parses_acknowledged_ranges() {
        let request = probe_status_request("https://session-uri");
        assert_eq!(request.headers.get("Content-Length").unwrap(), "0");
        assert_eq!(request.headers.get("Content-Range").unwrap(), "bytes */*");

        let outcome =
            (request.response_handler)(payload(308, &[("range", "bytes=0-1499999")], b""));
        assert_eq!(outcome.unwrap(), ProbeOutcome::Offset(1_500_000));

        let outcome = (request.response_handler)(payload(308, &[], b""));
        assert_eq!(outcome.unwrap(), ProbeOutcome::Offset(0));

        let outcome = (request.response_handler)(payload(
            200,
            &[],
            br#"{"name": "obj", "size": "12"}"#,
        ));
        match outcome.unwrap() {
            ProbeOutcome::Complete { status, metadata } => {
                assert_eq!(status, 200);
                assert_eq!(metadata.unwrap().size_bytes(), Some(12));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn stream_request_content_range_forms() {
        let mut config = UploadConfig::new("b", "f");
        let request = stream_request(&config, "https://session-uri", 0);
        assert_eq!(request.headers.get("Content-Range").unwrap(), "bytes 0-*/*");

        config.metadata.content_length = Some(3_145_728);
        let request = stream_request(&config, "https://session-uri", 1_500_000);
        assert_eq!(
            request.headers.get("Content-Range").unwrap(),
            "bytes 1500000-*/3145728"
        );

        config.user_project = Some("billing".to_string());
        let request = stream_request(&config, "https://session-uri", 0);
        assert_eq!(request.query_params.get("userProject").unwrap(), "billing");
    }

    #[test]
    fn custom_headers_reach_every_request() {
        let mut config = UploadConfig::new("b", "f");
        config
            .custom_request_headers
            .insert("X-Custom".to_string(), "value".to_string());

        let create = create_session_request(&config);
        assert_eq!(create.headers.get("X-Custom").unwrap(), "value");

        let stream = stream_request(&config, "https://session-uri", 0);
        assert_eq!(stream.headers.get("X-Custom").unwrap(), "value");
    }

    #[test]
    fn unused_config_is_absent_from_the_query() {
        let request = create_session_request(&UploadConfig::new("b", "f"));
        assert!(request.query_params.get("ifGenerationMatch").is_none());
        assert!(request.query_params.get("kmsKeyName").is_none());
        assert!(request.query_params.get("predefinedAcl").is_none());
        assert!(request.headers.get("x-goog-encryption-key").is_none());
    }
}
