//! Fakes shared by the unit tests in this crate.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use serde_json::Value;
use token_pool::CredentialToken;

use crate::backend::{Backend, ByteStream, ChatRequirements};
use crate::error::{Result, classify_status};

pub fn body_from(chunks: &[&str]) -> ByteStream {
    body_from_bytes(chunks.iter().map(|c| c.as_bytes().to_vec()).collect())
}

pub fn body_from_bytes(chunks: Vec<Vec<u8>>) -> ByteStream {
    Box::pin(stream::iter(
        chunks
            .into_iter()
            .map(|c| Ok::<_, crate::error::Error>(Bytes::from(c)))
            .collect::<Vec<_>>(),
    ))
}

/// SSE frame carrying a cumulative assistant message.
pub fn assistant_event(text: &str, status: &str) -> String {
    let event = serde_json::json!({
        "message": {
            "author": {"role": "assistant"},
            "content": {"content_type": "text", "parts": [text]},
            "status": status,
        },
        "conversation_id": "conv-1",
        "error": null,
    });
    format!("data: {event}\n\n")
}

#[derive(Default)]
pub struct Counters {
    pub opened: AtomicUsize,
    pub released: AtomicUsize,
}

impl Counters {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// Body wrapper that counts releases when dropped.
struct TrackedBody {
    inner: ByteStream,
    counters: Arc<Counters>,
}

impl Stream for TrackedBody {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub enum Behaviour {
    /// Conversation body is exactly these chunks.
    Stream(Vec<String>),
    /// These chunks, then the body never ends.
    Hang(Vec<String>),
    RequirementsStatus(u16),
    ConversationStatus(u16),
}

pub struct FakeBackend {
    default: Behaviour,
    per_token: HashMap<String, Behaviour>,
    pub counters: Arc<Counters>,
    pub last_body: Mutex<Option<Value>>,
}

impl FakeBackend {
    pub fn new(default: Behaviour) -> Self {
        Self {
            default,
            per_token: HashMap::new(),
            counters: Arc::new(Counters::default()),
            last_body: Mutex::new(None),
        }
    }

    pub fn with_token(mut self, token: &str, behaviour: Behaviour) -> Self {
        self.per_token.insert(token.to_string(), behaviour);
        self
    }

    fn behaviour(&self, credential: &CredentialToken) -> &Behaviour {
        self.per_token
            .get(credential.expose())
            .unwrap_or(&self.default)
    }
}

impl Backend for FakeBackend {
    fn chat_requirements<'a>(
        &'a self,
        credential: &'a CredentialToken,
    ) -> Pin<Box<dyn Future<Output = Result<ChatRequirements>> + Send + 'a>> {
        Box::pin(async move {
            match self.behaviour(credential) {
                Behaviour::RequirementsStatus(status) => Err(classify_status(*status, "fake")),
                _ => Ok(ChatRequirements {
                    token: "fake-requirements".into(),
                    persona: None,
                }),
            }
        })
    }

    fn conversation<'a>(
        &'a self,
        credential: &'a CredentialToken,
        _requirements: &'a ChatRequirements,
        body: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<ByteStream>> + Send + 'a>> {
        Box::pin(async move {
            *self.last_body.lock().unwrap() = Some(body.clone());
            let chunks: ByteStream = match self.behaviour(credential) {
                Behaviour::ConversationStatus(status) => {
                    return Err(classify_status(*status, "fake"));
                }
                Behaviour::RequirementsStatus(_) => body_from(&[]),
                Behaviour::Stream(chunks) => {
                    body_from(&chunks.iter().map(String::as_str).collect::<Vec<_>>())
                }
                Behaviour::Hang(chunks) => Box::pin(
                    body_from(&chunks.iter().map(String::as_str).collect::<Vec<_>>())
                        .chain(stream::pending()),
                ),
            };
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::pin(TrackedBody {
                inner: chunks,
                counters: self.counters.clone(),
            }) as ByteStream)
        })
    }
}
