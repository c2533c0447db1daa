//! Caller request schema
//!
//! The inbound body is validated once, in `Session::set_dynamic_data`. Fields
//! outside the schema (temperature, tools, ...) are ignored.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One part of a multi-part message. Only text parts carry content upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Message content: a plain string or an array of typed parts.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of the message. Non-text parts are skipped.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

/// A validated chat-completion request.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// Validate a raw JSON payload against the schema.
    pub fn from_value(payload: Value) -> Result<Self> {
        if !payload.is_object() {
            return Err(Error::Validation("request body must be a JSON object".into()));
        }
        let request: ChatRequest =
            serde_json::from_value(payload).map_err(|e| Error::Validation(e.to_string()))?;

        if request.model.trim().is_empty() {
            return Err(Error::Validation("model must not be empty".into()));
        }
        if request.messages.is_empty() {
            return Err(Error::Validation("messages must not be empty".into()));
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_minimal_request() {
        let req = ChatRequest::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        assert_eq!(req.model, "gpt-4o");
        assert!(!req.stream);
        assert_eq!(req.messages[0].role, Role::User);
        assert_eq!(req.messages[0].content.text(), "hi");
    }

    #[test]
    fn ignores_unknown_fields() {
        let req = ChatRequest::from_value(json!({
            "model": "gpt-4",
            "messages": [{"role": "system", "content": "be brief"}],
            "stream": true,
            "temperature": 0.2,
            "tools": []
        }))
        .unwrap();
        assert!(req.stream);
    }

    #[test]
    fn joins_text_parts_and_skips_others() {
        let req = ChatRequest::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "first"},
                {"type": "image_url", "image_url": {"url": "http://x"}},
                {"type": "text", "text": "second"}
            ]}]
        }))
        .unwrap();
        assert_eq!(req.messages[0].content.text(), "first\nsecond");
    }

    #[test]
    fn rejects_missing_model() {
        let err = ChatRequest::from_value(json!({
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn rejects_empty_messages() {
        let err = ChatRequest::from_value(json!({"model": "gpt-4o", "messages": []})).unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("messages")));
    }

    #[test]
    fn rejects_unknown_role() {
        let err = ChatRequest::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "wizard", "content": "hi"}]
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn rejects_non_object_body() {
        let err = ChatRequest::from_value(json!(["not", "an", "object"])).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn rejects_wrong_stream_type() {
        let err = ChatRequest::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": "yes"
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
