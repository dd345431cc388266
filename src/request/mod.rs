mod backoff;
mod info;
mod transport;

pub use backoff::{is_retriable, BackoffConfig, BackoffState, Exhaustion, RetryableFn};
pub use info::{RequestBody, RequestInfo, ResponseHandler};
pub use transport::{
    CancelToken, HttpClient, ResponsePayload, StaticTokenProvider, StreamRequest, TokenProvider,
};

pub(crate) use transport::exhausted;
