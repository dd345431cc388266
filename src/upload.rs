//! The upload controller: orchestrates session creation, offset probing, and
//! the chunk stream, retrying or restarting per the failure policy.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::Value;

use crate::checkpoint::{CheckpointRecord, CheckpointStore, FileCheckpointStore};
use crate::config::UploadConfig;
use crate::error::{
    aborted, internal_error, request_failed, session_stale, session_terminated, UploadError,
    UploadResult,
};
use crate::events::UploadEvent;
use crate::metadata::ObjectMetadata;
use crate::pipeline::{ChunkDisposition, UploadPipeline};
use crate::request::{exhausted, is_retriable, BackoffState, CancelToken, HttpClient, ResponsePayload};
use crate::session::{create_session_request, probe_status_request, stream_request, ProbeOutcome};

/// Chunks buffered between the caller and the driver before `write` blocks.
const PRODUCER_CHANNEL_CAPACITY: usize = 8;
/// Chunks buffered between the pipeline and the HTTP request body.
const BODY_CHANNEL_CAPACITY: usize = 8;

/// Handle to one in-flight resumable upload.
///
/// Bytes go in through [`write`](Self::write); [`finish`](Self::finish)
/// signals the end of the producer and resolves with the finalized object
/// resource. Lifecycle notifications arrive on [`events`](Self::events).
///
/// Must be created within a tokio runtime; the controller runs as a spawned
/// task and owns all session state for the upload's lifetime.
#[derive(Debug)]
pub struct ResumableUpload {
    sink: async_channel::Sender<Bytes>,
    events: async_channel::Receiver<UploadEvent>,
    cancel: CancelToken,
    driver: tokio::task::JoinHandle<UploadResult<ObjectMetadata>>,
    shared: Arc<SharedState>,
}

#[derive(Default, Debug)]
struct SharedState {
    last_error: Mutex<Option<UploadError>>,
}

impl ResumableUpload {
    /// Starts an upload backed by the file checkpoint store at the configured
    /// (or default) path.
    pub fn new(config: UploadConfig) -> UploadResult<Self> {
        let store = open_file_store(&config)?;
        Self::with_checkpoint_store(config, store)
    }

    /// Starts an upload with a caller-provided checkpoint store.
    pub fn with_checkpoint_store(
        config: UploadConfig,
        store: Arc<dyn CheckpointStore>,
    ) -> UploadResult<Self> {
        config.validate()?;
        let client = build_client(&config)?;

        let (sink, producer) = async_channel::bounded(PRODUCER_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = async_channel::unbounded();
        let cancel = CancelToken::new();
        let shared = Arc::new(SharedState::default());

        let controller = Controller {
            backoff: BackoffState::with_deadline(config.backoff_config(), client.deadline()),
            pipeline: UploadPipeline::new(config.content_length(), None),
            cache_key: config.cache_key(),
            session_uri: None,
            uri_from_caller: false,
            offset: config.offset,
            last_acked: 0,
            config,
            client,
            store,
            events: events_tx,
            producer,
            cancel: cancel.clone(),
        };

        let driver_shared = Arc::clone(&shared);
        let driver = tokio::spawn(async move { controller.run(driver_shared).await });

        Ok(Self {
            sink,
            events: events_rx,
            cancel,
            driver,
            shared,
        })
    }

    /// Pushes a chunk of caller data into the pipeline, waiting when the
    /// transport cannot drain fast enough.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> UploadResult<()> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        if self.sink.send(chunk).await.is_err() {
            return Err(self.terminal_error());
        }
        Ok(())
    }

    /// Ends the producer and waits for the server to finalize the object.
    pub async fn finish(self) -> UploadResult<ObjectMetadata> {
        self.sink.close();
        match self.driver.await {
            Ok(result) => result,
            Err(err) => Err(internal_error(format!("upload driver task failed: {err}"))),
        }
    }

    /// Aborts the upload: any in-flight request is cancelled, no further
    /// retries are attempted, and the terminating error surfaces to the
    /// caller. Terminal.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// The lifecycle event stream for this upload. The channel closes after
    /// the terminal `Finish` or `Error` event.
    pub fn events(&self) -> async_channel::Receiver<UploadEvent> {
        self.events.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn terminal_error(&self) -> UploadError {
        self.shared
            .last_error
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(aborted)
    }
}

/// Acquires (and checkpoints) a session URI without streaming any bytes,
/// using the file checkpoint store.
pub async fn create_session_uri(config: &UploadConfig) -> UploadResult<String> {
    let store = open_file_store(config)?;
    create_session_uri_with_store(config, store).await
}

/// As [`create_session_uri`], against a caller-provided checkpoint store.
pub async fn create_session_uri_with_store(
    config: &UploadConfig,
    store: Arc<dyn CheckpointStore>,
) -> UploadResult<String> {
    config.validate()?;
    let client = build_client(config)?;
    let cancel = CancelToken::new();
    let uri = client.execute(create_session_request(config), &cancel).await?;
    store
        .set(&config.cache_key(), CheckpointRecord::new(&uri))
        .await?;
    Ok(uri)
}

fn open_file_store(config: &UploadConfig) -> UploadResult<Arc<dyn CheckpointStore>> {
    let store = match &config.config_path {
        Some(path) => FileCheckpointStore::new(path.clone())?,
        None => FileCheckpointStore::with_default_path()?,
    };
    Ok(Arc::new(store))
}

fn build_client(config: &UploadConfig) -> UploadResult<HttpClient> {
    // Emulator endpoints are addressed without credentials.
    let token_provider = if config.is_emulator() {
        None
    } else {
        config.auth.clone()
    };
    HttpClient::new(
        token_provider,
        config.backoff_config(),
        config.retry_options.retryable_error_fn.clone(),
    )
}

enum FeedStep {
    Continue,
    Finished,
    Drift,
}

enum StreamEnd {
    Drift,
    Response(ResponsePayload),
    TransportError(UploadError),
}

enum ResponseAction {
    Final(ObjectMetadata),
    Retry(UploadError),
    Fail(UploadError),
}

enum ProbeAction {
    Resume(u64),
    Complete {
        status: u16,
        metadata: Option<ObjectMetadata>,
    },
    Restart(UploadError),
}

struct Controller {
    config: UploadConfig,
    client: HttpClient,
    store: Arc<dyn CheckpointStore>,
    cache_key: String,
    events: async_channel::Sender<UploadEvent>,
    producer: async_channel::Receiver<Bytes>,
    pipeline: UploadPipeline,
    session_uri: Option<String>,
    uri_from_caller: bool,
    offset: Option<u64>,
    /// Highest offset the server has acknowledged; advancing it starts a new
    /// retry cycle.
    last_acked: u64,
    backoff: BackoffState,
    cancel: CancelToken,
}

impl Controller {
    async fn run(mut self, shared: Arc<SharedState>) -> UploadResult<ObjectMetadata> {
        let result = self.drive().await;
        match &result {
            Ok(_) => {
                self.emit(UploadEvent::Finish).await;
            }
            Err(error) => {
                *shared.last_error.lock().unwrap() = Some(error.clone());
                self.emit(UploadEvent::Error(error.clone())).await;
            }
        }
        self.events.close();
        result
    }

    async fn drive(&mut self) -> UploadResult<ObjectMetadata> {
        // Resolve the session to resume: a caller-supplied URI wins over the
        // checkpoint; a checkpointed fingerprint is honored either way.
        if let Some(record) = self.store.get(&self.cache_key).await? {
            if self.config.uri.is_none() {
                self.session_uri = Some(record.uri.clone());
            }
            self.pipeline = UploadPipeline::new(self.config.content_length(), record.first_chunk);
        }
        if let Some(uri) = &self.config.uri {
            self.session_uri = Some(uri.clone());
            self.uri_from_caller = true;
        }

        // Stay idle until the first byte arrives (or the producer finishes
        // empty).
        tokio::select! {
            received = self.producer.recv() => {
                if let Ok(chunk) = received {
                    self.emit(UploadEvent::Writing).await;
                    self.pipeline.push(chunk);
                }
            }
            _ = self.cancel.cancelled() => return Err(aborted()),
        }

        loop {
            if self.cancel.is_cancelled() {
                return Err(aborted());
            }

            if self.session_uri.is_none() {
                let uri = self.client
                    .execute(create_session_request(&self.config), &self.cancel)
                    .await?;
                let mut record = CheckpointRecord::new(&uri);
                if let Some(fingerprint) = self.pipeline.fingerprint() {
                    record = record.with_first_chunk(fingerprint.to_vec());
                }
                self.store.set(&self.cache_key, record).await?;
                self.session_uri = Some(uri);
                self.offset = Some(0);
            }

            if self.offset.is_none() {
                match self.probe().await? {
                    ProbeAction::Resume(offset) => {
                        if offset < self.pipeline.base_offset() {
                            // The bytes between the two offsets are no longer
                            // buffered, so the gap cannot be filled.
                            return Err(internal_error(format!(
                                "server acknowledged {offset} bytes but {} were already confirmed; the upload cannot resume",
                                self.pipeline.base_offset()
                            )));
                        }
                        if offset > self.last_acked {
                            self.last_acked = offset;
                            self.backoff.reset();
                        }
                        self.pipeline.release(offset);
                        self.offset = Some(offset);
                    }
                    ProbeAction::Complete { status, metadata } => {
                        self.emit(UploadEvent::Response(status)).await;
                        let metadata = metadata.unwrap_or_default();
                        return self.finalize(metadata).await;
                    }
                    ProbeAction::Restart(cause) => {
                        log::warn!("restarting upload session: {cause}");
                        self.restart().await?;
                        continue;
                    }
                }
            }

            match self.stream_attempt().await? {
                StreamEnd::Drift => {
                    log::warn!("first chunk changed since the session was created; restarting");
                    self.restart().await?;
                }
                StreamEnd::Response(payload) => {
                    self.emit(UploadEvent::Response(payload.status.as_u16())).await;
                    match self.classify_stream_response(payload) {
                        ResponseAction::Final(metadata) => return self.finalize(metadata).await,
                        ResponseAction::Retry(cause) => {
                            self.delay_or_fail(cause).await?;
                            self.offset = None;
                        }
                        ResponseAction::Fail(error) => return Err(error),
                    }
                }
                StreamEnd::TransportError(error) => {
                    if is_retriable(&error, self.client.retryable_fn()) {
                        self.delay_or_fail(error).await?;
                        self.offset = None;
                    } else {
                        return Err(error);
                    }
                }
            }
        }
    }

    async fn probe(&mut self) -> UploadResult<ProbeAction> {
        let session_uri = self
            .session_uri
            .clone()
            .ok_or_else(|| internal_error("probe attempted without a session URI"))?;

        match self
            .client
            .execute(probe_status_request(&session_uri), &self.cancel)
            .await
        {
            Ok(ProbeOutcome::Offset(offset)) => Ok(ProbeAction::Resume(offset)),
            Ok(ProbeOutcome::Complete { status, metadata }) => {
                Ok(ProbeAction::Complete { status, metadata })
            }
            Err(error) => match error.status {
                Some(404) if !self.uri_from_caller => Ok(ProbeAction::Restart(session_stale())),
                Some(404) => Err(session_stale().with_server_response(error.to_string())),
                Some(410) => Ok(ProbeAction::Restart(session_terminated())),
                _ => Err(error),
            },
        }
    }

    /// One streaming PUT against the session, fed from the replay buffer and
    /// then the live producer.
    async fn stream_attempt(&mut self) -> UploadResult<StreamEnd> {
        let session_uri = self
            .session_uri
            .clone()
            .ok_or_else(|| internal_error("streaming attempted without a session URI"))?;
        let offset = self
            .offset
            .ok_or_else(|| internal_error("streaming attempted without a known offset"))?;

        let (body_tx, body_rx) = async_channel::bounded::<io::Result<Bytes>>(BODY_CHANNEL_CAPACITY);
        let request = stream_request(&self.config, &session_uri, offset);

        let client = self.client.clone();
        let cancel = self.cancel.clone();
        let request_fut = client.send_streaming(request, body_rx, &cancel);
        tokio::pin!(request_fut);

        self.pipeline.begin_attempt();
        let mut replay_index = 0;
        let mut feeding = true;

        loop {
            if feeding {
                tokio::select! {
                    response = &mut request_fut => {
                        return Ok(match response {
                            Ok(payload) => StreamEnd::Response(payload),
                            Err(error) => StreamEnd::TransportError(error),
                        });
                    }
                    step = self.feed_step(&mut replay_index, offset, &body_tx) => {
                        match step? {
                            FeedStep::Continue => {}
                            FeedStep::Drift => return Ok(StreamEnd::Drift),
                            FeedStep::Finished => {
                                feeding = false;
                                body_tx.close();
                            }
                        }
                    }
                }
            } else {
                return Ok(match (&mut request_fut).await {
                    Ok(payload) => StreamEnd::Response(payload),
                    Err(error) => StreamEnd::TransportError(error),
                });
            }
        }
    }

    /// Moves one chunk through the pipeline: replayed from the buffer first,
    /// then pulled live from the producer.
    async fn feed_step(
        &mut self,
        replay_index: &mut usize,
        offset: u64,
        body_tx: &async_channel::Sender<io::Result<Bytes>>,
    ) -> UploadResult<FeedStep> {
        let chunk = if let Some(buffered) = self.pipeline.chunk_at(*replay_index) {
            buffered
        } else {
            tokio::select! {
                received = self.producer.recv() => match received {
                    Ok(chunk) => {
                        self.pipeline.push(chunk.clone());
                        chunk
                    }
                    Err(_) => return Ok(FeedStep::Finished),
                },
                _ = self.cancel.cancelled() => return Err(aborted()),
            }
        };
        *replay_index += 1;

        let outcome = self.pipeline.process(&chunk, offset);
        if let Some(progress) = outcome.progress {
            self.emit(UploadEvent::Progress(progress)).await;
        }
        if let Some(fingerprint) = outcome.captured_fingerprint {
            if let Some(uri) = &self.session_uri {
                let record = CheckpointRecord::new(uri).with_first_chunk(fingerprint);
                self.store.set(&self.cache_key, record).await?;
            }
        }

        match outcome.disposition {
            ChunkDisposition::Drift => Ok(FeedStep::Drift),
            ChunkDisposition::Skip => Ok(FeedStep::Continue),
            ChunkDisposition::Forward(bytes) => {
                // A closed body means the request already completed; the
                // select around this step will pick its response up.
                let _ = body_tx.send(Ok(bytes)).await;
                Ok(FeedStep::Continue)
            }
        }
    }

    fn classify_stream_response(&self, payload: ResponsePayload) -> ResponseAction {
        let status = payload.status.as_u16();

        if (200..300).contains(&status) {
            if payload.body.is_empty() {
                return ResponseAction::Final(ObjectMetadata::default());
            }
            return match serde_json::from_slice::<Value>(&payload.body) {
                Ok(value) if value.get("error").is_some() => {
                    let embedded_status = value["error"]["code"].as_u64().map(|code| code as u16);
                    let error = request_failed(embedded_status.unwrap_or(status))
                        .with_server_response(value["error"].to_string());
                    self.retry_or_fail(error)
                }
                Ok(value) => ResponseAction::Final(ObjectMetadata::from_value(value)),
                Err(err) => ResponseAction::Fail(internal_error(format!(
                    "failed to parse the finalized object resource: {err}"
                ))),
            };
        }

        // A 308 here means the server expects more bytes after the producer
        // already finished; re-probe and resume rather than guessing.
        let error = if payload.body.is_empty() {
            request_failed(status)
        } else {
            request_failed(status)
                .with_server_response(String::from_utf8_lossy(&payload.body).to_string())
        };
        if status == 308 {
            return ResponseAction::Retry(error);
        }
        self.retry_or_fail(error)
    }

    fn retry_or_fail(&self, error: UploadError) -> ResponseAction {
        if is_retriable(&error, self.client.retryable_fn()) {
            ResponseAction::Retry(error)
        } else {
            ResponseAction::Fail(error)
        }
    }

    async fn finalize(&mut self, metadata: ObjectMetadata) -> UploadResult<ObjectMetadata> {
        self.store.delete(&self.cache_key).await?;
        self.emit(UploadEvent::Metadata(metadata.clone())).await;
        Ok(metadata)
    }

    /// Discards the current session and prepares a fresh start from offset
    /// zero. Not counted against the retry budget.
    async fn restart(&mut self) -> UploadResult<()> {
        self.pipeline.reset_for_restart()?;
        self.store.delete(&self.cache_key).await?;
        self.session_uri = None;
        self.uri_from_caller = false;
        self.offset = None;
        self.last_acked = 0;
        self.emit(UploadEvent::Restart).await;
        Ok(())
    }

    /// Sleeps out the next backoff delay, or converts exhaustion into the
    /// terminal error.
    async fn delay_or_fail(&mut self, cause: UploadError) -> UploadResult<()> {
        match self.backoff.next_delay() {
            Ok(delay) => {
                log::debug!(
                    "upload interrupted ({cause}); retry {} in {delay:?}",
                    self.backoff.retry_count()
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(()),
                    _ = self.cancel.cancelled() => Err(aborted()),
                }
            }
            Err(reason) => Err(exhausted(reason, cause)),
        }
    }

    async fn emit(&self, event: UploadEvent) {
        let _ = self.events.send(event).await;
    }
}
