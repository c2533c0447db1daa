//! Upstream events to OpenAI chat-completion output
//!
//! Upstream sends the whole assistant message so far in every event;
//! callers expect deltas. `Translator` keeps the emitted length and turns
//! each event into at most one delta chunk. `prime` reads a live stream up to
//! its first delta, `transcode` drives the rest and owns the session while
//! doing so; `aggregate` drives it to completion for non-streaming requests.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_stream::stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::Session;
use crate::sse::{RawEvent, RawEvents};

/// Terminal marker frame.
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ChunkChoice {
    index: u32,
    delta: Delta,
    logprobs: Option<()>,
    finish_reason: Option<&'static str>,
}

/// One `chat.completion.chunk`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    choices: [ChunkChoice; 1],
    /// Character offset of this delta within the full reply.
    #[serde(skip)]
    pub position: usize,
}

impl StreamChunk {
    pub fn delta(&self) -> &Delta {
        &self.choices[0].delta
    }

    pub fn finish_reason(&self) -> Option<&'static str> {
        self.choices[0].finish_reason
    }

    pub fn to_sse(&self) -> Bytes {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        Bytes::from(format!("data: {json}\n\n"))
    }
}

#[derive(Debug, Clone, Serialize)]
struct AssistantMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct CompletionChoice {
    index: u32,
    message: AssistantMessage,
    logprobs: Option<()>,
    finish_reason: &'static str,
}

/// Aggregated non-streaming reply.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    choices: [CompletionChoice; 1],
    #[serde(skip)]
    pub conversation_id: Option<String>,
}

impl ChatCompletion {
    pub fn content(&self) -> &str {
        &self.choices[0].message.content
    }

    pub fn finish_reason(&self) -> &'static str {
        self.choices[0].finish_reason
    }
}

enum Step {
    Delta(StreamChunk),
    Skip,
    Done,
    Failed(Error),
}

struct Translator {
    id: String,
    created: u64,
    model: String,
    emitted_chars: usize,
    chunks: usize,
    content: String,
    finish_reason: Option<&'static str>,
    conversation_id: Option<String>,
}

impl Translator {
    fn new(model: &str) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created,
            model: model.to_string(),
            emitted_chars: 0,
            chunks: 0,
            content: String::new(),
            finish_reason: None,
            conversation_id: None,
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<&'static str>, position: usize) -> StreamChunk {
        StreamChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: [ChunkChoice {
                index: 0,
                delta,
                logprobs: None,
                finish_reason,
            }],
            position,
        }
    }

    fn step(&mut self, event: &RawEvent) -> Step {
        let data = event.data.trim();
        if data == "[DONE]" {
            return Step::Done;
        }
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(data) else {
            return Step::Skip;
        };

        if let Some(err) = obj.get("error").filter(|e| !e.is_null()) {
            return Step::Failed(Error::upstream(error_message(err)));
        }
        if let Some(id) = obj.get("conversation_id").and_then(Value::as_str) {
            self.conversation_id.get_or_insert_with(|| id.to_string());
        }

        let Some(message) = obj.get("message") else {
            return Step::Skip;
        };
        if message.pointer("/author/role").and_then(Value::as_str) != Some("assistant")
            || message.pointer("/content/content_type").and_then(Value::as_str) != Some("text")
        {
            return Step::Skip;
        }
        if let Some(kind) = message
            .pointer("/metadata/finish_details/type")
            .and_then(Value::as_str)
        {
            self.finish_reason = Some(if kind == "max_tokens" { "length" } else { "stop" });
        }

        let Some(text) = message.pointer("/content/parts/0").and_then(Value::as_str) else {
            return Step::Skip;
        };
        let total = text.chars().count();
        if total <= self.emitted_chars {
            return Step::Skip;
        }

        let suffix: String = text.chars().skip(self.emitted_chars).collect();
        let position = self.emitted_chars;
        self.emitted_chars = total;
        self.content.push_str(&suffix);

        let role = (self.chunks == 0).then_some("assistant");
        self.chunks += 1;
        Step::Delta(self.chunk(
            Delta {
                role,
                content: Some(suffix),
            },
            None,
            position,
        ))
    }

    fn finish_chunk(&self) -> StreamChunk {
        self.chunk(
            Delta::default(),
            Some(self.finish_reason.unwrap_or("stop")),
            self.emitted_chars,
        )
    }

    fn into_completion(self) -> ChatCompletion {
        ChatCompletion {
            id: self.id,
            object: "chat.completion",
            created: self.created,
            model: self.model,
            choices: [CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content: self.content,
                },
                logprobs: None,
                finish_reason: self.finish_reason.unwrap_or("stop"),
            }],
            conversation_id: self.conversation_id,
        }
    }
}

fn error_message(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

/// Frame reporting a failure to a streaming caller.
pub fn error_frame(err: &Error) -> Bytes {
    let body = json!({
        "error": {
            "message": err.to_string(),
            "type": err.kind(),
            "code": err.status_code(),
        }
    });
    Bytes::from(format!("data: {body}\n\n"))
}

async fn next_event(events: &mut RawEvents, idle: Duration) -> Option<Result<RawEvent>> {
    match tokio::time::timeout(idle, events.next()).await {
        Ok(next) => next,
        Err(_) => Some(Err(Error::upstream(format!(
            "no upstream event within {}s",
            idle.as_secs()
        )))),
    }
}

/// A streaming reply read up to its first content delta.
///
/// Nothing has reached the caller yet, so a failure while priming is still an
/// ordinary error: retryable, with a real HTTP status.
pub struct PrimedStream {
    events: RawEvents,
    translator: Translator,
    first: Option<Bytes>,
    ended: bool,
}

impl std::fmt::Debug for PrimedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimedStream")
            .field("events", &self.events)
            .field("has_first", &self.first.is_some())
            .field("ended", &self.ended)
            .finish()
    }
}

/// Read events until the first delta or the end of the stream. An upstream
/// error or idle timeout before any content fails the whole reply.
pub(crate) async fn prime(
    mut events: RawEvents,
    model: &str,
    idle: Duration,
) -> Result<PrimedStream> {
    let mut translator = Translator::new(model);
    loop {
        let Some(event) = next_event(&mut events, idle).await else {
            return Ok(PrimedStream {
                events,
                translator,
                first: None,
                ended: true,
            });
        };
        match translator.step(&event?) {
            Step::Delta(chunk) => {
                return Ok(PrimedStream {
                    events,
                    first: Some(chunk.to_sse()),
                    translator,
                    ended: false,
                });
            }
            Step::Skip => {}
            Step::Done => {
                return Ok(PrimedStream {
                    events,
                    translator,
                    first: None,
                    ended: true,
                });
            }
            Step::Failed(e) => return Err(e),
        }
    }
}

/// Turn a primed reply into SSE frames ending with `[DONE]`.
///
/// The session is closed once upstream finishes or fails. If the returned
/// stream is dropped early, dropping the session releases the connection.
/// Failures after the first delta become an inline error frame.
pub fn transcode(mut session: Session, primed: PrimedStream) -> impl Stream<Item = Bytes> + Send {
    stream! {
        let idle = session.idle_timeout();
        let PrimedStream { mut events, mut translator, first, ended } = primed;
        let mut failure = None;

        if let Some(frame) = first {
            yield frame;
        }

        while !ended {
            let event = match next_event(&mut events, idle).await {
                None => break,
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
            };
            match translator.step(&event) {
                Step::Delta(chunk) => {
                    yield chunk.to_sse();
                }
                Step::Skip => {}
                Step::Done => break,
                Step::Failed(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(id) = translator.conversation_id.as_deref() {
            session.set_conversation_id(id);
        }
        session.close_client();

        match failure {
            Some(err) => {
                warn!(
                    session = %session.id(),
                    token = %session.credential(),
                    emitted = translator.chunks,
                    error = %err,
                    "upstream stream failed"
                );
                yield error_frame(&err);
            }
            None => {
                debug!(session = %session.id(), chunks = translator.chunks, "stream complete");
                yield translator.finish_chunk().to_sse();
            }
        }
        yield Bytes::from_static(DONE_FRAME);
    }
}

/// Drain events into a single completion. Any upstream failure, including
/// one after partial content, is an error.
pub(crate) async fn aggregate(
    mut events: RawEvents,
    model: &str,
    idle: Duration,
) -> Result<ChatCompletion> {
    let mut translator = Translator::new(model);
    while let Some(event) = next_event(&mut events, idle).await {
        match translator.step(&event?) {
            Step::Delta(_) | Step::Skip => {}
            Step::Done => break,
            Step::Failed(e) => return Err(e),
        }
    }
    Ok(translator.into_completion())
}
