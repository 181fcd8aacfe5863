//! SSE token relay.
//!
//! Turns a chunked chat-completion body (`data: {json}` records separated by
//! newlines, ended by `data: [DONE]`) into a flat sequence of text deltas.
//! Network reads may land anywhere, including inside a record or inside a
//! multi-byte character, so the decoder keeps a byte residual and only decodes
//! complete lines.

use std::collections::VecDeque;

use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::providers::{StreamChunk, DATA_PREFIX, DONE_SENTINEL};

/// One meaningful record recovered from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseRecord {
    Delta(String),
    Done,
}

/// How a relay run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The end-of-stream sentinel was seen.
    Completed,
    /// The connection closed without a sentinel.
    Closed,
    /// The caller cancelled; not an error.
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
enum LineOutcome {
    Blank,
    Done,
    Delta(String),
    NoText,
    Malformed,
    Foreign,
}

fn decode_line(raw: &str) -> LineOutcome {
    let line = raw.trim();
    if line.is_empty() {
        return LineOutcome::Blank;
    }
    if line == DONE_SENTINEL {
        return LineOutcome::Done;
    }
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        // `event:`, `id:` and `: keep-alive` comment lines carry no text.
        return LineOutcome::Foreign;
    };
    let payload = payload.trim_start();
    if payload == "[DONE]" {
        return LineOutcome::Done;
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => match chunk.delta_text() {
            Some(text) => LineOutcome::Delta(text.to_string()),
            None => LineOutcome::NoText,
        },
        Err(_) => LineOutcome::Malformed,
    }
}

/// Incremental line decoder for one response body.
#[derive(Debug, Default)]
pub struct SseDecoder {
    residual: Vec<u8>,
    finished: bool,
    malformed: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one network read and return the records it completed.
    ///
    /// After a `Done` record the decoder is finished and ignores further
    /// input, even bytes that were already buffered.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseRecord> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.residual.extend_from_slice(bytes);

        let mut start = 0;
        while let Some(pos) = self.residual[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            // '\n' never occurs inside a multi-byte UTF-8 sequence, so a
            // complete line is always a complete run of characters.
            let line = String::from_utf8_lossy(&self.residual[start..end]).into_owned();
            start = end + 1;
            if self.accept(&line, &mut out) {
                self.residual.clear();
                return out;
            }
        }
        self.residual.drain(..start);
        out
    }

    /// Flush the unterminated tail at connection close.
    pub fn finish(&mut self) -> Vec<SseRecord> {
        let mut out = Vec::new();
        if self.finished || self.residual.is_empty() {
            return out;
        }
        let tail = String::from_utf8_lossy(&self.residual).into_owned();
        self.residual.clear();
        self.accept(&tail, &mut out);
        self.finished = true;
        out
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of records skipped because their JSON did not parse.
    pub fn malformed_records(&self) -> usize {
        self.malformed
    }

    /// Returns true when the sentinel was reached.
    fn accept(&mut self, line: &str, out: &mut Vec<SseRecord>) -> bool {
        match decode_line(line) {
            LineOutcome::Done => {
                self.finished = true;
                out.push(SseRecord::Done);
                true
            }
            LineOutcome::Delta(text) => {
                out.push(SseRecord::Delta(text));
                false
            }
            LineOutcome::Malformed => {
                self.malformed += 1;
                debug!(
                    target: "mouthpiece::relay",
                    line = %line.trim(),
                    "skipping malformed SSE record"
                );
                false
            }
            LineOutcome::Blank | LineOutcome::NoText | LineOutcome::Foreign => false,
        }
    }
}

/// Drive `stream` to completion, handing every text delta to `on_delta` in
/// arrival order.
///
/// Cancellation is checked before each read and before each delta is
/// delivered; once `cancel` fires, `on_delta` is never called again and the
/// function returns `Ok(RelayOutcome::Cancelled)`. A transport failure
/// mid-stream is returned as-is; deltas already delivered are not retracted.
pub async fn relay_sse<S, F>(
    mut stream: S,
    cancel: &CancellationToken,
    mut on_delta: F,
) -> Result<RelayOutcome>
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
    F: FnMut(String),
{
    let mut decoder = SseDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(RelayOutcome::Cancelled),
            next = stream.next() => next,
        };

        let records = match next {
            Some(Ok(bytes)) => decoder.feed(&bytes),
            Some(Err(e)) => return Err(e),
            None => {
                let tail = decoder.finish();
                let sentinel = tail.contains(&SseRecord::Done);
                for record in tail {
                    if let SseRecord::Delta(text) = record {
                        if cancel.is_cancelled() {
                            return Ok(RelayOutcome::Cancelled);
                        }
                        on_delta(text);
                    }
                }
                return Ok(if sentinel { RelayOutcome::Completed } else { RelayOutcome::Closed });
            }
        };

        for record in records {
            match record {
                SseRecord::Delta(text) => {
                    if cancel.is_cancelled() {
                        return Ok(RelayOutcome::Cancelled);
                    }
                    on_delta(text);
                }
                SseRecord::Done => return Ok(RelayOutcome::Completed),
            }
        }
    }
}

struct DeltaState<S> {
    body: S,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    ended: bool,
}

/// Pull-based form of [`relay_sse`] for callers that need to await between
/// deltas. Ends after the sentinel or when the body closes; a transport
/// failure is yielded once as the last item.
pub fn sse_deltas<S>(body: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin + Send,
{
    let state = DeltaState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        ended: false,
    };
    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(text) = st.pending.pop_front() {
                return Some((Ok(text), st));
            }
            if st.ended {
                return None;
            }
            let records = match st.body.next().await {
                Some(Ok(bytes)) => st.decoder.feed(&bytes),
                Some(Err(e)) => {
                    st.ended = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.ended = true;
                    st.decoder.finish()
                }
            };
            for record in records {
                match record {
                    SseRecord::Delta(text) => st.pending.push_back(text),
                    SseRecord::Done => st.ended = true,
                }
            }
        }
    })
}

/// Build the wire form of one delta record. Used by tests and fake transports.
pub fn encode_delta(text: &str) -> String {
    let chunk = serde_json::json!({
        "choices": [{ "index": 0, "delta": { "content": text }, "finish_reason": null }]
    });
    format!("data: {}\n\n", chunk)
}
