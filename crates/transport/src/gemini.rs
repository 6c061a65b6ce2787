//! Gemini Code Assist transport.
//!
//! Features:
//! - Bearer authentication from a `CredentialProvider`, asked before every attempt
//! - HTTP 429 retry honouring the server's `RetryInfo` delay
//! - Streaming via SSE (`:streamGenerateContent?alt=sse`)
//! - Cancellation of in-flight requests, retry waits and open streams

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use turnloop_config::AppConfig;
use turnloop_core::{
    CredentialProvider, GenerateRequest, GenerateResponse, StreamEvent, Transport, TransportError,
    Usage,
};

use crate::retry::{RetryPolicy, parse_retry_delay};
use crate::sse::{SseDecoder, SseRecord};
use crate::wire::{RequestEnvelope, ResponseEnvelope};

const DEFAULT_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";
const DEFAULT_API_VERSION: &str = "v1internal";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_BUFFER: usize = 64;

pub struct GeminiTransport {
    client: reqwest::Client,
    base_url: String,
    api_version: String,
    credentials: Arc<dyn CredentialProvider>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl GeminiTransport {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.into(),
            api_version: DEFAULT_API_VERSION.into(),
            credentials,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(300),
        })
    }

    /// Build from the `[api]` and `[retry]` config tables.
    pub fn from_config(
        config: &AppConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, TransportError> {
        Ok(Self::new(credentials)?
            .with_base_url(&config.api.base_url)
            .with_api_version(&config.api.api_version)
            .with_retry_policy(RetryPolicy::from(&config.retry))
            .with_request_timeout(config.api.request_timeout()))
    }

    /// Use a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Total time allowed for a non-streaming request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}:{}", self.base_url, self.api_version, method)
    }

    /// POST `body` until a 200 arrives, retrying 429s per the retry policy.
    async fn send_with_retry(
        &self,
        url: &str,
        body: &[u8],
        streaming: bool,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, TransportError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let token = self.credentials.bearer_token().await?;

            let mut builder = self
                .client
                .post(url)
                .bearer_auth(token)
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_vec());
            builder = if streaming {
                builder.header(ACCEPT, "text/event-stream")
            } else {
                builder.timeout(self.request_timeout)
            };

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                sent = builder.send() => sent.map_err(|e| TransportError::Network(e.to_string()))?,
            };

            let status = response.status().as_u16();
            if status == 200 {
                return Ok(response);
            }

            let error_body = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                bytes = response.bytes() => bytes.unwrap_or_default(),
            };

            if status == 429 {
                let delay = parse_retry_delay(&error_body, self.retry.default_delay);
                if attempt >= self.retry.max_attempts() {
                    warn!(attempts = attempt, "Rate limited, giving up");
                    return Err(TransportError::RetriesExhausted {
                        attempts: attempt,
                        last_delay: delay,
                    });
                }
                warn!(attempt, ?delay, "Rate limited, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(delay) => continue,
                }
            }

            let body = String::from_utf8_lossy(&error_body).into_owned();
            warn!(status, body = %body, "Generation API error");
            return Err(TransportError::Http { status, body });
        }
    }
}

#[async_trait]
impl Transport for GeminiTransport {
    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<GenerateResponse, TransportError> {
        let url = self.endpoint("generateContent");
        let body = serde_json::to_vec(&RequestEnvelope::new(&request))
            .map_err(|e| TransportError::Decode(format!("failed to encode request: {e}")))?;

        debug!(model = %request.model, contents = request.contents.len(), "Sending generate request");

        let response = self.send_with_retry(&url, &body, false, &cancel).await?;
        let envelope: ResponseEnvelope = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            parsed = response.json() => parsed.map_err(|e| TransportError::Decode(e.to_string()))?,
        };
        Ok(envelope.into())
    }

    async fn stream_generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, TransportError> {
        let url = self.endpoint("streamGenerateContent?alt=sse");
        let body = serde_json::to_vec(&RequestEnvelope::new(&request))
            .map_err(|e| TransportError::Decode(format!("failed to encode request: {e}")))?;

        debug!(model = %request.model, contents = request.contents.len(), "Sending streaming request");

        let response = self.send_with_retry(&url, &body, true, &cancel).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(pump_stream(response, request.model, tx, cancel));
        Ok(rx)
    }
}

/// Forward an open SSE response as `StreamEvent`s.
///
/// Always emits `Start` first and `Done` last. Read failures and cancellation
/// become an `Error` event in between.
async fn pump_stream(
    response: reqwest::Response,
    model: String,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    if tx.send(StreamEvent::Start { model }).await.is_err() {
        return;
    }

    let mut bytes = std::pin::pin!(response.bytes_stream());
    let mut decoder = SseDecoder::new();
    let mut usage = Usage::default();

    'read: loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(StreamEvent::Error { message: TransportError::Cancelled.to_string() }).await;
                break;
            }
            next = bytes.next() => next,
        };

        let (records, eof) = match next {
            Some(Ok(chunk)) => (decoder.feed(&chunk), false),
            Some(Err(e)) => {
                warn!(error = %e, "Stream read failed");
                let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
                break;
            }
            None => (decoder.finish(), true),
        };

        for record in records {
            let data = match record {
                SseRecord::Done => break 'read,
                SseRecord::Data(data) => data,
            };
            let chunk: ResponseEnvelope = match serde_json::from_str(&data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    trace!(error = %e, data = %data, "Ignoring undecodable SSE record");
                    continue;
                }
            };
            if let Some(chunk_usage) = chunk.usage() {
                usage = chunk_usage;
            }
            for event in chunk.stream_events() {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }

        if eof {
            break;
        }
    }

    let _ = tx.send(StreamEvent::Done { usage }).await;
}
