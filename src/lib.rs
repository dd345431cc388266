#![doc = include_str!("../README.md")]

mod checkpoint;
mod config;
mod constants;
mod error;
mod events;
mod metadata;
mod pipeline;
mod request;
mod session;
mod upload;
mod util;

#[doc(inline)]
pub use checkpoint::{
    default_config_path, CheckpointRecord, CheckpointStore, FileCheckpointStore,
    InMemoryCheckpointStore,
};

#[doc(inline)]
pub use config::{EncryptionSpec, PredefinedAcl, RetryOptions, UploadConfig};

#[doc(inline)]
pub use constants::{
    DEFAULT_API_ENDPOINT, DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_DELAY_SECS,
    DEFAULT_RETRY_DELAY_MULTIPLIER, DEFAULT_TOTAL_TIMEOUT_SECS, FIRST_CHUNK_FINGERPRINT_LEN,
};

#[doc(inline)]
pub use error::{
    aborted, content_drift, internal_error, invalid_argument, network_error, request_failed,
    session_stale, session_terminated, unknown_error, UploadError, UploadErrorCode, UploadResult,
};

#[doc(inline)]
pub use events::{UploadEvent, UploadProgress};

#[doc(inline)]
pub use metadata::ObjectMetadata;

#[doc(inline)]
pub use pipeline::{ChunkDisposition, ProcessOutcome, UploadPipeline};

#[doc(inline)]
pub use request::{
    is_retriable, BackoffConfig, BackoffState, CancelToken, Exhaustion, HttpClient, RequestBody,
    RequestInfo, ResponseHandler, ResponsePayload, RetryableFn, StaticTokenProvider, StreamRequest,
    TokenProvider,
};

#[doc(inline)]
pub use session::{create_session_request, probe_status_request, stream_request, ProbeOutcome};

#[doc(inline)]
pub use upload::{
    create_session_uri, create_session_uri_with_store, ResumableUpload,
};

#[doc(inline)]
pub use util::{is_url, parse_range_end};
