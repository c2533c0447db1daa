//! Upstream conversation payload
//!
//! Pure mapping from a validated `ChatRequest` to the node structure the
//! backend's conversation endpoint expects.

use serde_json::{Value, json};

use crate::request::ChatRequest;

/// Map a caller-facing model name to the upstream model slug.
pub fn upstream_model(model: &str) -> &'static str {
    if model.contains("gpt-4o-mini") {
        "gpt-4o-mini"
    } else if model.contains("gpt-4o") {
        "gpt-4o"
    } else if model.contains("gpt-4") {
        "gpt-4"
    } else {
        "auto"
    }
}

/// Build the conversation body. `next_id` supplies the message and parent
/// identifiers so callers (and tests) control id generation.
pub fn build_conversation(request: &ChatRequest, mut next_id: impl FnMut() -> String) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            json!({
                "id": next_id(),
                "author": {"role": message.role.as_str()},
                "content": {
                    "content_type": "text",
                    "parts": [message.content.text()],
                },
                "metadata": {},
            })
        })
        .collect();

    json!({
        "action": "next",
        "messages": messages,
        "parent_message_id": next_id(),
        "model": upstream_model(&request.model),
        "timezone_offset_min": 0,
        "suggestions": [],
        "history_and_training_disabled": true,
        "conversation_mode": {"kind": "primary_assistant"},
        "force_paragen": false,
        "force_rate_limit": false,
    })
}

/// Fresh random identifier for conversation nodes.
pub fn new_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
