//! Envelope splitter for the actor channel.
//!
//! One stream carries a structured header and free dialogue:
//!
//! ```text
//! ###DATA###
//! {"mood": 42, "innerOS": "..."}
//! ###TEXT###
//! 第一句|||第二句
//! ```
//!
//! The JSON is released only once it parses as a whole object; until then
//! nothing at all is exposed, dialogue included.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::client::strip_code_fence;

pub const DATA_MARK: &str = "###DATA###";
pub const TEXT_MARK: &str = "###TEXT###";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    pub metadata: Option<Value>,
    pub dialogue_text: String,
}

impl Envelope {
    pub fn metadata_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.metadata
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Pure split of an accumulated buffer.
pub fn split_envelope(buffer: &str) -> Envelope {
    match locate(buffer) {
        Some((metadata, text_start)) => Envelope {
            metadata: Some(metadata),
            dialogue_text: buffer[text_start..].trim_start().to_string(),
        },
        None => Envelope::default(),
    }
}

/// Find the data marker, then try each following text marker in turn: a text
/// marker quoted inside a JSON string leaves the JSON unparsable, and a later
/// occurrence may be the real one.
fn locate(buffer: &str) -> Option<(Value, usize)> {
    let data_start = buffer.find(DATA_MARK)? + DATA_MARK.len();
    let mut from = data_start;
    while let Some(rel) = buffer[from..].find(TEXT_MARK) {
        let text_at = from + rel;
        let candidate = strip_code_fence(&buffer[data_start..text_at]);
        match serde_json::from_str::<Value>(candidate) {
            Ok(value) if value.is_object() => return Some((value, text_at + TEXT_MARK.len())),
            Ok(_) | Err(_) => {
                debug!(
                    target: "mouthpiece::envelope",
                    offset = text_at,
                    "envelope JSON not complete yet"
                );
            }
        }
        from = text_at + TEXT_MARK.len();
    }
    None
}

/// Owns the buffer of one actor call and latches the metadata the first
/// time it parses.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeSplitter {
    buffer: String,
    metadata: Option<Value>,
    text_start: Option<usize>,
}

impl EnvelopeSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Returns true exactly once: on the chunk that completed
    /// the metadata.
    pub fn push(&mut self, chunk: &str) -> bool {
        self.buffer.push_str(chunk);
        if self.text_start.is_some() {
            return false;
        }
        match locate(&self.buffer) {
            Some((metadata, text_start)) => {
                self.metadata = Some(metadata);
                self.text_start = Some(text_start);
                true
            }
            None => false,
        }
    }

    pub fn is_latched(&self) -> bool {
        self.text_start.is_some()
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    pub fn metadata_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.metadata
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Dialogue received after the text marker; empty until latched.
    pub fn dialogue_text(&self) -> &str {
        match self.text_start {
            Some(start) => self.buffer[start..].trim_start(),
            None => "",
        }
    }

    pub fn envelope(&self) -> Envelope {
        Envelope {
            metadata: self.metadata.clone(),
            dialogue_text: self.dialogue_text().to_string(),
        }
    }

    /// Final view once the stream has ended. A reply that never opened an
    /// envelope at all is taken as plain dialogue; one that opened it but
    /// never closed it is withheld.
    pub fn finish(&self) -> Envelope {
        if self.is_latched() || self.buffer.contains(DATA_MARK) {
            return self.envelope();
        }
        Envelope {
            metadata: None,
            dialogue_text: self.buffer.trim().to_string(),
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }
}
