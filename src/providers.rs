use serde::{Deserialize, Serialize};

/// Sentinel record that ends an incremental chat-completion stream.
pub const DONE_SENTINEL: &str = "data: [DONE]";
/// Literal tag in front of every SSE payload line.
pub const DATA_PREFIX: &str = "data:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatRole::System => write!(f, "system"),
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
        }
    }
}

// -- Request types ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage { role: ChatRole::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

impl ResponseFormat {
    pub fn json_object() -> Self {
        ResponseFormat { format_type: "json_object".to_string() }
    }
}

/// Body of a chat-completion POST. `model` is filled in by the transport when
/// left empty so request builders stay independent of configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

impl ChatRequest {
    pub fn streaming(messages: Vec<ChatMessage>, temperature: f32) -> Self {
        ChatRequest {
            model: String::new(),
            messages,
            stream: true,
            temperature,
            response_format: None,
        }
    }

    pub fn one_shot_json(messages: Vec<ChatMessage>, temperature: f32) -> Self {
        ChatRequest {
            model: String::new(),
            messages,
            stream: false,
            temperature,
            response_format: Some(ResponseFormat::json_object()),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

// -- SSE chunk types ----------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
    #[allow(dead_code)]
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

impl StreamChunk {
    /// Text carried by the first choice, if any.
    pub fn delta_text(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.delta.content.as_deref())
            .filter(|s| !s.is_empty())
    }
}

// -- Whole-response types -----------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionChoice {
    pub message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

impl ChatCompletion {
    pub fn content(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.message.content.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display() {
        assert_eq!(ChatRole::System.to_string(), "system");
        assert_eq!(ChatRole::Assistant.to_string(), "assistant");
    }

    #[test]
    fn test_streaming_request_serializes() {
        let req = ChatRequest::streaming(vec![ChatMessage::user("hi")], 1.2).with_model("m");
        let json = serde_json::to_value(&req).expect("serialize");
        assert_eq!(json["model"], "m");
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("response_format").is_none());
    }

    #[test]
    fn test_json_request_has_response_format() {
        let req = ChatRequest::one_shot_json(vec![ChatMessage::system("judge")], 0.2);
        let json = serde_json::to_value(&req).expect("serialize");
        assert_eq!(json["stream"], false);
        assert_eq!(json["response_format"]["type"], "json_object");
        assert!(json.get("model").is_none());
    }

    #[test]
    fn test_chunk_delta_text() {
        let json = r#"{"id":"x","choices":[{"index":0,"delta":{"content":"你好"},"finish_reason":null}]}"#;
        let chunk: StreamChunk = serde_json::from_str(json).expect("deser");
        assert_eq!(chunk.delta_text(), Some("你好"));
    }

    #[test]
    fn test_chunk_empty_delta_is_none() {
        let json = r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#;
        let chunk: StreamChunk = serde_json::from_str(json).expect("deser");
        assert!(chunk.delta_text().is_none());
    }

    #[test]
    fn test_chunk_without_choices() {
        let chunk: StreamChunk = serde_json::from_str(r#"{"usage":{}}"#).expect("deser");
        assert!(chunk.delta_text().is_none());
    }

    #[test]
    fn test_chunk_role_only_delta() {
        let json = r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#;
        let chunk: StreamChunk = serde_json::from_str(json).expect("deser");
        assert!(chunk.delta_text().is_none());
    }

    #[test]
    fn test_completion_content() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":"{\"mood\":3}"}}]}"#;
        let c: ChatCompletion = serde_json::from_str(json).expect("deser");
        assert_eq!(c.content(), Some("{\"mood\":3}"));
    }

    #[test]
    fn test_completion_no_choices() {
        let c: ChatCompletion = serde_json::from_str(r#"{"choices":[]}"#).expect("deser");
        assert!(c.content().is_none());
    }
}
