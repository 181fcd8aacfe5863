//! Chat-completion transport.
//!
//! [`ChatTransport`] is the seam between the streaming core and the network:
//! [`LlmClient`] implements it over reqwest, tests substitute scripted fakes.
//! [`start_stream`] wraps a streamed call in a cancellable [`StreamHandle`].

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{MouthpieceError, Result};
use crate::providers::{ChatCompletion, ChatRequest};
use crate::relay::{relay_sse, RelayOutcome};

/// Raw response body, one item per network read.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// POST a streaming request. Fails with [`MouthpieceError::Api`] on a
    /// non-2xx status before any body byte is handed out.
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream>;

    /// POST a one-shot request and return the first choice's message content.
    async fn complete(&self, request: &ChatRequest) -> Result<String>;
}

// ---------------------------------------------------------------------------
// LlmClient: reqwest implementation
// ---------------------------------------------------------------------------

pub struct LlmClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    pub model: String,
}

impl LlmClient {
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config.api_key()?.to_string();
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;
        Ok(LlmClient {
            client,
            api_url: config.api_url.clone(),
            api_key,
            model: config.model.clone(),
        })
    }

    async fn post(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let mut body = request.clone();
        if body.model.is_empty() {
            body.model = self.model.clone();
        }
        let request_id = uuid::Uuid::new_v4();
        debug!(
            target: "mouthpiece::client",
            %request_id,
            stream = body.stream,
            messages = body.messages.len(),
            "sending chat completion request"
        );

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(target: "mouthpiece::client", %request_id, status, "chat completion rejected");
            return Err(MouthpieceError::Api { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatTransport for LlmClient {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream> {
        let response = self.post(request).await?;
        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| MouthpieceError::Stream(e.to_string()))
        });
        Ok(Box::pin(stream))
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let response = self.post(request).await?;
        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| MouthpieceError::json("chat completion", e))?;
        completion
            .content()
            .map(str::to_string)
            .ok_or_else(|| {
                MouthpieceError::json("chat completion", "response carried no message content")
            })
    }
}

// ---------------------------------------------------------------------------
// Call helpers
// ---------------------------------------------------------------------------

/// Open a streamed call and relay its text deltas to `on_delta`.
///
/// Cancellation while the connection is still being established also yields
/// `Ok(RelayOutcome::Cancelled)`.
pub async fn stream_text<T, F>(
    transport: &T,
    request: &ChatRequest,
    cancel: &CancellationToken,
    on_delta: F,
) -> Result<RelayOutcome>
where
    T: ChatTransport + ?Sized,
    F: FnMut(String),
{
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(RelayOutcome::Cancelled),
        opened = transport.open_stream(request) => opened?,
    };
    relay_sse(stream, cancel, on_delta).await
}

/// Collect a whole streamed call into one string.
pub async fn stream_to_string<T>(
    transport: &T,
    request: &ChatRequest,
    cancel: &CancellationToken,
) -> Result<(String, RelayOutcome)>
where
    T: ChatTransport + ?Sized,
{
    let mut text = String::new();
    let outcome = stream_text(transport, request, cancel, |delta| text.push_str(&delta)).await?;
    Ok((text, outcome))
}

/// Issue a one-shot call whose message content is itself a JSON document and
/// decode that inner document into `T`.
pub async fn complete_json<T, R>(transport: &T, request: &ChatRequest) -> Result<R>
where
    T: ChatTransport + ?Sized,
    R: DeserializeOwned,
{
    let content = transport.complete(request).await?;
    serde_json::from_str(strip_code_fence(&content))
        .map_err(|e| MouthpieceError::json("message content", e))
}

/// Models occasionally wrap JSON output in a markdown fence even when asked
/// for a bare object.
pub fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

// ---------------------------------------------------------------------------
// StreamHandle: cancellable background call
// ---------------------------------------------------------------------------

fn lock(gate: &Mutex<()>) -> MutexGuard<'_, ()> {
    gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A streamed call running on the tokio runtime.
///
/// The chunk callback runs behind a gate that [`StreamHandle::cancel`] also
/// takes, so once `cancel` returns the callback is never entered again.
pub struct StreamHandle {
    cancel: CancellationToken,
    gate: Arc<Mutex<()>>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn cancel(&self) {
        let _guard = lock(&self.gate);
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the call (and its completion callback) to finish.
    pub async fn join(mut self) {
        if let Err(e) = (&mut self.task).await {
            warn!(target: "mouthpiece::client", error = %e, "stream task panicked or was aborted");
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            self.cancel();
        }
    }
}

/// Start a streamed call in the background.
///
/// `on_chunk` receives every text delta in arrival order. `on_complete` runs
/// exactly once when the call ends: `Ok(RelayOutcome::Cancelled)` after a
/// cancellation (never an error), the transport error if the call failed, or
/// the normal outcome.
pub fn start_stream<T, C, D>(
    transport: Arc<T>,
    request: ChatRequest,
    cancel: CancellationToken,
    mut on_chunk: C,
    on_complete: D,
) -> StreamHandle
where
    T: ChatTransport + ?Sized + 'static,
    C: FnMut(&str) + Send + 'static,
    D: FnOnce(Result<RelayOutcome>) + Send + 'static,
{
    let gate = Arc::new(Mutex::new(()));
    let task_gate = Arc::clone(&gate);
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let result = stream_text(transport.as_ref(), &request, &token, |delta| {
            let _guard = lock(&task_gate);
            if !token.is_cancelled() {
                on_chunk(&delta);
            }
        })
        .await;

        let result = match result {
            Err(_) if token.is_cancelled() => Ok(RelayOutcome::Cancelled),
            other => other,
        };
        on_complete(result);
    });

    StreamHandle { cancel, gate, task }
}
