//! Scripted backend for orchestrator and router tests.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use chat_session::{Backend, ByteStream, ChatRequirements, classify_status};
use futures_util::{Stream, StreamExt, stream};
use serde_json::Value;
use token_pool::CredentialToken;

#[derive(Clone)]
pub enum Script {
    /// Conversation body is exactly these frames.
    Reply(Vec<String>),
    /// These frames, then the body never ends.
    Hang(Vec<String>),
    RequirementsStatus(u16),
    ConversationStatus(u16),
}

/// Cumulative assistant event as upstream sends it.
pub fn assistant(text: &str) -> String {
    let event = serde_json::json!({
        "message": {
            "author": {"role": "assistant"},
            "content": {"content_type": "text", "parts": [text]},
            "status": "in_progress",
        },
        "conversation_id": "conv-test",
    });
    format!("data: {event}\n\n")
}

pub fn done() -> String {
    "data: [DONE]\n\n".to_string()
}

#[derive(Default)]
pub struct Calls {
    pub requirements: AtomicUsize,
    pub opened: AtomicUsize,
    pub released: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

struct CountedBody {
    inner: ByteStream,
    calls: Arc<Calls>,
}

impl Stream for CountedBody {
    type Item = chat_session::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for CountedBody {
    fn drop(&mut self) {
        self.calls.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct ScriptedBackend {
    default: Script,
    per_token: HashMap<String, Script>,
    pub calls: Arc<Calls>,
    /// Credentials in the order they were presented to the requirement call
    pub seen: std::sync::Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(default: Script) -> Self {
        Self {
            default,
            per_token: HashMap::new(),
            calls: Arc::new(Calls::default()),
            seen: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with(mut self, token: &str, script: Script) -> Self {
        self.per_token.insert(token.to_string(), script);
        self
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn script(&self, credential: &CredentialToken) -> &Script {
        self.per_token
            .get(credential.expose())
            .unwrap_or(&self.default)
    }
}

fn frames(chunks: &[String]) -> ByteStream {
    let items: Vec<chat_session::Result<Bytes>> = chunks
        .iter()
        .map(|c| Ok(Bytes::from(c.clone())))
        .collect();
    Box::pin(stream::iter(items))
}

impl Backend for ScriptedBackend {
    fn chat_requirements<'a>(
        &'a self,
        credential: &'a CredentialToken,
    ) -> Pin<Box<dyn Future<Output = chat_session::Result<ChatRequirements>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.requirements.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(credential.expose().to_string());
            match self.script(credential) {
                Script::RequirementsStatus(status) => Err(classify_status(*status, "scripted")),
                _ => Ok(ChatRequirements {
                    token: "scripted".into(),
                    persona: None,
                }),
            }
        })
    }

    fn conversation<'a>(
        &'a self,
        credential: &'a CredentialToken,
        _requirements: &'a ChatRequirements,
        _body: &'a Value,
    ) -> Pin<Box<dyn Future<Output = chat_session::Result<ByteStream>> + Send + 'a>> {
        Box::pin(async move {
            let body = match self.script(credential) {
                Script::ConversationStatus(status) => {
                    return Err(classify_status(*status, "scripted"));
                }
                Script::RequirementsStatus(_) => frames(&[]),
                Script::Reply(chunks) => frames(chunks),
                Script::Hang(chunks) => Box::pin(frames(chunks).chain(stream::pending())),
            };
            self.calls.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::pin(CountedBody {
                inner: body,
                calls: self.calls.clone(),
            }) as ByteStream)
        })
    }
}
