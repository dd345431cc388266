use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use sha2::{Digest, Sha256};
use url::Url;

use crate::constants::{
    DEFAULT_API_ENDPOINT, DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_DELAY_SECS,
    DEFAULT_RETRY_DELAY_MULTIPLIER, DEFAULT_TOTAL_TIMEOUT_SECS, GOOGLE_API_DOMAIN,
};
use crate::error::{invalid_argument, UploadResult};
use crate::metadata::ObjectMetadata;
use crate::request::{BackoffConfig, RetryableFn, TokenProvider};
use crate::util::is_url;

/// Predefined object ACLs accepted by the insert endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredefinedAcl {
    AuthenticatedRead,
    BucketOwnerFullControl,
    BucketOwnerRead,
    Private,
    ProjectPrivate,
    PublicRead,
}

impl PredefinedAcl {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredefinedAcl::AuthenticatedRead => "authenticatedRead",
            PredefinedAcl::BucketOwnerFullControl => "bucketOwnerFullControl",
            PredefinedAcl::BucketOwnerRead => "bucketOwnerRead",
            PredefinedAcl::Private => "private",
            PredefinedAcl::ProjectPrivate => "projectPrivate",
            PredefinedAcl::PublicRead => "publicRead",
        }
    }
}

/// Retry knobs, mirroring the option names the Node.js module accepts.
#[derive(Clone)]
pub struct RetryOptions {
    pub auto_retry: bool,
    pub max_retries: u32,
    pub max_retry_delay: Duration,
    pub retry_delay_multiplier: f64,
    pub total_timeout: Duration,
    pub retryable_error_fn: Option<RetryableFn>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            auto_retry: true,
            max_retries: DEFAULT_MAX_RETRIES,
            max_retry_delay: Duration::from_secs(DEFAULT_MAX_RETRY_DELAY_SECS),
            retry_delay_multiplier: DEFAULT_RETRY_DELAY_MULTIPLIER,
            total_timeout: Duration::from_secs(DEFAULT_TOTAL_TIMEOUT_SECS),
            retryable_error_fn: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("auto_retry", &self.auto_retry)
            .field("max_retries", &self.max_retries)
            .field("max_retry_delay", &self.max_retry_delay)
            .field("retry_delay_multiplier", &self.retry_delay_multiplier)
            .field("total_timeout", &self.total_timeout)
            .field("retryable_error_fn", &self.retryable_error_fn.is_some())
            .finish()
    }
}

/// Derived header values for a customer-supplied encryption key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionSpec {
    pub key_base64: String,
    pub key_sha256_base64: String,
}

impl EncryptionSpec {
    fn from_key(key: &[u8]) -> Self {
        let engine = base64::engine::general_purpose::STANDARD;
        Self {
            key_base64: engine.encode(key),
            key_sha256_base64: engine.encode(Sha256::digest(key)),
        }
    }
}

/// Everything an upload needs to know before the first byte flows.
/// Immutable once the upload begins.
#[derive(Clone, Default)]
pub struct UploadConfig {
    pub api_endpoint: Option<String>,
    pub bucket: String,
    pub file: String,
    pub auth: Option<Arc<dyn TokenProvider>>,
    pub config_path: Option<PathBuf>,
    /// Extra headers attached to every request of this upload.
    pub custom_request_headers: HashMap<String, String>,
    pub generation: Option<i64>,
    /// Customer-supplied AES-256 key, raw bytes.
    pub key: Option<Vec<u8>>,
    pub kms_key_name: Option<String>,
    pub metadata: ObjectMetadata,
    /// Server-acknowledged offset known up front, e.g. from an earlier probe.
    pub offset: Option<u64>,
    pub origin: Option<String>,
    /// Extra query parameters attached to the session-creation request.
    pub params: HashMap<String, String>,
    pub predefined_acl: Option<PredefinedAcl>,
    /// Alias for `predefined_acl: Private`.
    pub private: bool,
    /// Alias for `predefined_acl: PublicRead`.
    pub public: bool,
    /// Pre-existing session URI to resume against.
    pub uri: Option<String>,
    pub user_project: Option<String>,
    pub retry_options: RetryOptions,
}

impl fmt::Debug for UploadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadConfig")
            .field("api_endpoint", &self.api_endpoint)
            .field("bucket", &self.bucket)
            .field("file", &self.file)
            .field("generation", &self.generation)
            .field("kms_key_name", &self.kms_key_name)
            .field("offset", &self.offset)
            .field("predefined_acl", &self.resolved_predefined_acl())
            .field("uri", &self.uri)
            .field("user_project", &self.user_project)
            .field("retry_options", &self.retry_options)
            .finish()
    }
}

impl UploadConfig {
    pub fn new(bucket: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            file: file.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> UploadResult<()> {
        if self.bucket.is_empty() || self.file.is_empty() {
            return Err(invalid_argument("A bucket and file name are required"));
        }
        Ok(())
    }

    /// The normalized API endpoint: scheme defaults to https, trailing
    /// slashes are trimmed.
    pub fn endpoint(&self) -> String {
        normalize_endpoint(self.api_endpoint.as_deref().unwrap_or(DEFAULT_API_ENDPOINT))
    }

    /// Endpoints outside `*.googleapis.com` address an emulator; requests to
    /// them carry no credentials.
    pub fn is_emulator(&self) -> bool {
        let endpoint = self.endpoint();
        match Url::parse(&endpoint) {
            Ok(url) => match url.host_str() {
                Some(host) => {
                    host != GOOGLE_API_DOMAIN && !host.ends_with(&format!(".{GOOGLE_API_DOMAIN}"))
                }
                None => true,
            },
            Err(_) => true,
        }
    }

    /// `bucket/object[/generation]`, the checkpoint-store key for this
    /// destination.
    pub fn cache_key(&self) -> String {
        match self.generation {
            Some(generation) => format!("{}/{}/{}", self.bucket, self.file, generation),
            None => format!("{}/{}", self.bucket, self.file),
        }
    }

    pub fn encryption(&self) -> Option<EncryptionSpec> {
        self.key.as_deref().map(EncryptionSpec::from_key)
    }

    /// The effective predefined ACL, after applying the `private`/`public`
    /// aliases. An explicit `predefined_acl` wins over either alias.
    pub fn resolved_predefined_acl(&self) -> Option<PredefinedAcl> {
        self.predefined_acl.or(if self.private {
            Some(PredefinedAcl::Private)
        } else if self.public {
            Some(PredefinedAcl::PublicRead)
        } else {
            None
        })
    }

    /// Declared total upload length, when the caller knows it.
    pub fn content_length(&self) -> Option<u64> {
        self.metadata.content_length
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            auto_retry: self.retry_options.auto_retry,
            max_retries: self.retry_options.max_retries,
            multiplier: self.retry_options.retry_delay_multiplier,
            max_delay: self.retry_options.max_retry_delay,
            total_timeout: self.retry_options.total_timeout,
        }
    }
}

fn normalize_endpoint(raw: &str) -> String {
    let with_scheme = if is_url(raw) {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    with_scheme.trim_end_matches('/').to_string()
}
