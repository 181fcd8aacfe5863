//! Scripted `ChatTransport` for driving the arena without a network.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;

use mouthpiece::client::{ByteStream, ChatTransport};
use mouthpiece::error::{MouthpieceError, Result};
use mouthpiece::prompts::{ACTOR_TEMPERATURE, MONOLOGUE_TEMPERATURE};
use mouthpiece::providers::{ChatRequest, ChatRole};
use mouthpiece::relay::encode_delta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Actor,
    Monologue,
    Judge,
    FinalActor,
    FinalMonologue,
}

/// Classify a request by the shape the prompt builders give it. In combined
/// mode the single streamed call reports as `Monologue` (same temperature).
pub fn classify(request: &ChatRequest) -> CallKind {
    let is_final = request.messages.len() > 1
        && request.messages.last().map(|m| m.role) == Some(ChatRole::System);
    if !request.stream {
        CallKind::Judge
    } else if request.temperature == ACTOR_TEMPERATURE {
        if is_final { CallKind::FinalActor } else { CallKind::Actor }
    } else if request.temperature == MONOLOGUE_TEMPERATURE {
        if is_final { CallKind::FinalMonologue } else { CallKind::Monologue }
    } else {
        CallKind::Actor
    }
}

#[derive(Clone)]
pub enum Reply {
    /// Stream these deltas, then the end sentinel.
    Deltas(Vec<String>),
    /// Stream these deltas and keep the connection open.
    Hang(Vec<String>),
    /// Wait for the gate before doing anything else.
    Gated(Arc<Notify>, Box<Reply>),
    /// One-shot reply content.
    Json(String),
    /// Reject with this HTTP status.
    Status(u16),
}

impl Reply {
    pub fn deltas(parts: &[&str]) -> Self {
        Reply::Deltas(parts.iter().map(|s| s.to_string()).collect())
    }

    pub fn json(text: &str) -> Self {
        Reply::Json(text.to_string())
    }

    pub fn gated(gate: &Arc<Notify>, inner: Reply) -> Self {
        Reply::Gated(Arc::clone(gate), Box::new(inner))
    }
}

type Router = dyn Fn(CallKind, &ChatRequest) -> Reply + Send + Sync;

pub struct ScriptedTransport {
    router: Box<Router>,
    calls: Mutex<Vec<(CallKind, ChatRequest)>>,
    open: Mutex<Vec<mpsc::Sender<Result<Vec<u8>>>>>,
}

impl ScriptedTransport {
    pub fn new<F>(router: F) -> Arc<Self>
    where
        F: Fn(CallKind, &ChatRequest) -> Reply + Send + Sync + 'static,
    {
        Arc::new(ScriptedTransport {
            router: Box::new(router),
            calls: Mutex::new(Vec::new()),
            open: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(CallKind, ChatRequest)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.calls.lock().unwrap().iter().filter(|(k, _)| *k == kind).count()
    }

    /// Send one more delta on every connection left open by `Reply::Hang`.
    pub async fn push_all(&self, text: &str) {
        let senders = self.open.lock().unwrap().clone();
        for tx in senders {
            let _ = tx.send(Ok(encode_delta(text).into_bytes())).await;
        }
    }

    async fn resolve(&self, request: &ChatRequest) -> Reply {
        let kind = classify(request);
        self.calls.lock().unwrap().push((kind, request.clone()));
        let mut reply = (self.router)(kind, request);
        while let Reply::Gated(gate, inner) = reply {
            gate.notified().await;
            reply = *inner;
        }
        reply
    }
}

fn wire(parts: &[String]) -> Vec<Result<Vec<u8>>> {
    parts.iter().map(|p| Ok(encode_delta(p).into_bytes())).collect()
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream> {
        match self.resolve(request).await {
            Reply::Deltas(parts) => {
                let mut items = wire(&parts);
                items.push(Ok(b"data: [DONE]\n\n".to_vec()));
                Ok(Box::pin(tokio_stream::iter(items)))
            }
            Reply::Hang(parts) => {
                let (tx, rx) = mpsc::channel(parts.len() + 1);
                for item in wire(&parts) {
                    let _ = tx.try_send(item);
                }
                self.open.lock().unwrap().push(tx);
                Ok(Box::pin(ReceiverStream::new(rx)))
            }
            Reply::Status(status) => Err(MouthpieceError::Api { status, body: "scripted".into() }),
            Reply::Json(_) => {
                Err(MouthpieceError::Stream("scripted json reply on a stream".into()))
            }
            Reply::Gated(..) => unreachable!("gates are resolved first"),
        }
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        match self.resolve(request).await {
            Reply::Json(text) => Ok(text),
            Reply::Status(status) => Err(MouthpieceError::Api { status, body: "scripted".into() }),
            Reply::Deltas(parts) | Reply::Hang(parts) => Ok(parts.concat()),
            Reply::Gated(..) => unreachable!("gates are resolved first"),
        }
    }
}

pub const NOT_OVER: &str = r#"{"mood": 62, "isGameOver": false, "isWin": false, "analysis": "", "funnyReaction": ""}"#;
pub const LOST: &str = r#"{"mood": 4, "isGameOver": true, "isWin": false, "analysis": "太软了", "funnyReaction": "大刘把你拉黑了"}"#;
pub const WON: &str = r#"{"mood": 70, "isGameOver": true, "isWin": true, "analysis": "稳", "funnyReaction": "大刘不情不愿地给你转了1块钱"}"#;
