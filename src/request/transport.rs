use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use reqwest::{Client, Method, Response, StatusCode, Url};

use crate::constants::USER_AGENT;
use crate::error::{aborted, internal_error, network_error, request_failed, UploadError, UploadResult};

use super::backoff::{is_retriable, BackoffConfig, BackoffState, Exhaustion, RetryableFn};
use super::info::{RequestBody, RequestInfo};

/// Supplies the bearer token attached to every request outside emulator mode.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> UploadResult<String>;
}

/// Token provider over a fixed, caller-managed credential.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait::async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> UploadResult<String> {
        Ok(self.token.clone())
    }
}

/// Cooperative cancellation signal threaded through every request the
/// uploader issues. Cloning shares the underlying flag.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<tokio::sync::watch::Sender<bool>>,
    rx: tokio::sync::watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct ResponsePayload {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ResponsePayload {
    async fn from_response(response: Response) -> UploadResult<Self> {
        let status = response.status();
        let headers = collect_headers(&response);
        let body = response
            .bytes()
            .await
            .map_err(|err| internal_error(format!("failed to read response body: {err}")))?
            .to_vec();
        Ok(Self { status, headers, body })
    }
}

/// Description of the streaming chunk PUT. Unlike [`RequestInfo`] it carries
/// no success codes: every status is final and the controller inspects it.
pub struct StreamRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
}

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    token_provider: Option<Arc<dyn TokenProvider>>,
    backoff: BackoffConfig,
    retryable_fn: Option<RetryableFn>,
    deadline: Instant,
}

impl HttpClient {
    /// `token_provider` is `None` in emulator mode; `deadline` anchors the
    /// total-timeout ceiling for every retry cycle of this upload.
    pub fn new(
        token_provider: Option<Arc<dyn TokenProvider>>,
        backoff: BackoffConfig,
        retryable_fn: Option<RetryableFn>,
    ) -> UploadResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|err| internal_error(format!("failed to build HTTP client: {err}")))?;
        let deadline = Instant::now() + backoff.total_timeout;
        Ok(Self {
            client,
            token_provider,
            backoff,
            retryable_fn,
            deadline,
        })
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn retryable_fn(&self) -> Option<&RetryableFn> {
        self.retryable_fn.as_ref()
    }

    /// Runs a request to completion, retrying retriable failures under the
    /// configured backoff until the shared deadline or retry budget runs out.
    pub async fn execute<O>(&self, info: RequestInfo<O>, cancel: &CancelToken) -> UploadResult<O> {
        let mut backoff = BackoffState::with_deadline(self.backoff.clone(), self.deadline);

        loop {
            let attempt = tokio::select! {
                result = self.try_once(&info) => result,
                _ = cancel.cancelled() => return Err(aborted()),
            };

            let error = match attempt {
                Ok(payload) => {
                    if info.success_codes.contains(&payload.status.as_u16()) {
                        return (info.response_handler)(payload);
                    }
                    map_failure(payload)
                }
                Err(err) => err,
            };

            if info.no_retry_statuses.iter().any(|code| error.status == Some(*code))
                || !is_retriable(&error, self.retryable_fn.as_ref())
            {
                return Err(error);
            }

            match backoff.next_delay() {
                Ok(delay) => {
                    log::debug!(
                        "retrying {} {} in {:?} after: {error}",
                        info.method,
                        info.url,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(aborted()),
                    }
                }
                Err(reason) => return Err(exhausted(reason, error)),
            }
        }
    }

    async fn try_once<O>(&self, info: &RequestInfo<O>) -> UploadResult<ResponsePayload> {
        let mut url = Url::parse(&info.url)
            .map_err(|err| internal_error(format!("invalid request URL {}: {err}", info.url)))?;
        if !info.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &info.query_params {
                pairs.append_pair(name, value);
            }
        }

        let mut builder = self.client.request(info.method.clone(), url);
        builder = self.apply_common_headers(builder, &info.headers).await?;

        match &info.body {
            RequestBody::Bytes(bytes) => {
                if !bytes.is_empty() {
                    builder = builder.body(bytes.clone());
                }
            }
            RequestBody::Text(text) => {
                if !text.is_empty() {
                    builder = builder.body(text.clone());
                }
            }
            RequestBody::Empty => {}
        }

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(network_error("upload deadline elapsed before the request was sent"));
        }

        let response = match tokio::time::timeout(remaining, builder.send()).await {
            Ok(result) => result.map_err(map_reqwest_error)?,
            Err(_) => return Err(network_error("request timed out")),
        };

        ResponsePayload::from_response(response).await
    }

    /// Issues the chunk PUT with a producer-driven body. Every status is
    /// treated as final so the caller can route it through its own state
    /// machine; only transport-level failures surface as errors.
    pub async fn send_streaming(
        &self,
        request: StreamRequest,
        body: async_channel::Receiver<io::Result<Bytes>>,
        cancel: &CancelToken,
    ) -> UploadResult<ResponsePayload> {
        let mut url = Url::parse(&request.url)
            .map_err(|err| internal_error(format!("invalid session URL {}: {err}", request.url)))?;
        if !request.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &request.query_params {
                pairs.append_pair(name, value);
            }
        }

        let mut builder = self
            .client
            .request(Method::PUT, url)
            .body(reqwest::Body::wrap_stream(body));
        builder = self.apply_common_headers(builder, &request.headers).await?;

        let response = tokio::select! {
            result = builder.send() => result.map_err(map_reqwest_error)?,
            _ = cancel.cancelled() => return Err(aborted()),
        };

        ResponsePayload::from_response(response).await
    }

    async fn apply_common_headers(
        &self,
        mut builder: reqwest::RequestBuilder,
        headers: &HashMap<String, String>,
    ) -> UploadResult<reqwest::RequestBuilder> {
        builder = builder.header("User-Agent", USER_AGENT);
        if let Some(provider) = &self.token_provider {
            let token = provider.access_token().await?;
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        Ok(builder)
    }
}

fn collect_headers(response: &Response) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (key, value) in response.headers().iter() {
        if let Ok(val) = value.to_str() {
            headers.insert(key.as_str().to_owned(), val.to_owned());
        }
    }
    headers
}

fn map_reqwest_error(err: reqwest::Error) -> UploadError {
    if err.is_timeout() {
        network_error(format!("request timed out: {err}"))
    } else {
        network_error(err.to_string())
    }
}

fn map_failure(payload: ResponsePayload) -> UploadError {
    let error = request_failed(payload.status.as_u16());
    if payload.body.is_empty() {
        error
    } else {
        error.with_server_response(String::from_utf8_lossy(&payload.body).to_string())
    }
}

/// Maps a refused retry onto the terminal error surfaced to the caller. With
/// auto-retry disabled the first failure is terminal and keeps its own shape.
pub(crate) fn exhausted(reason: Exhaustion, cause: UploadError) -> UploadError {
    match reason {
        Exhaustion::AutoRetryDisabled => cause,
        Exhaustion::RetryLimit => {
            let mut error = UploadError::new(
                crate::error::UploadErrorCode::RetryExhausted,
                format!("Retry limit exceeded - {cause}"),
            );
            if let Some(status) = cause.status {
                error = error.with_status(status);
            }
            error
        }
        Exhaustion::TimeLimit => {
            let mut error = UploadError::new(
                crate::error::UploadErrorCode::RetryExhausted,
                format!("Retry total time limit exceeded - {cause}"),
            );
            if let Some(status) = cause.status {
                error = error.with_status(status);
            }
            error
        }
    }
}
