use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Method;

use crate::error::UploadResult;

use super::transport::ResponsePayload;

pub type ResponseHandler<O> = Arc<dyn Fn(ResponsePayload) -> UploadResult<O> + Send + Sync>;

#[derive(Clone, Debug)]
pub enum RequestBody {
    Bytes(Vec<u8>),
    Text(String),
    Empty,
}

impl RequestBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }
}

/// A single HTTP request description plus the closure that turns its
/// successful response into a typed value.
///
/// `success_codes` decides which statuses reach the handler; everything else
/// is mapped to an error and fed to the retry policy, except statuses listed
/// in `no_retry_statuses`, which surface immediately (the offset probe uses
/// this so 404/410 reach the controller's restart logic instead of being
/// retried).
pub struct RequestInfo<O> {
    pub url: String,
    pub method: Method,
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub body: RequestBody,
    pub success_codes: Vec<u16>,
    pub no_retry_statuses: Vec<u16>,
    pub response_handler: ResponseHandler<O>,
}

impl<O> Clone for RequestInfo<O> {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            method: self.method.clone(),
            headers: self.headers.clone(),
            query_params: self.query_params.clone(),
            body: self.body.clone(),
            success_codes: self.success_codes.clone(),
            no_retry_statuses: self.no_retry_statuses.clone(),
            response_handler: Arc::clone(&self.response_handler),
        }
    }
}

impl<O> RequestInfo<O> {
    pub fn new(url: impl Into<String>, method: Method, response_handler: ResponseHandler<O>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: RequestBody::Empty,
            success_codes: vec![200],
            no_retry_statuses: Vec::new(),
            response_handler,
        }
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(name.into(), value.into());
        self
    }

    pub fn with_success_codes(mut self, codes: Vec<u16>) -> Self {
        self.success_codes = codes;
        self
    }

    pub fn with_no_retry_statuses(mut self, codes: Vec<u16>) -> Self {
        self.no_retry_statuses = codes;
        self
    }
}
