//! One request's conversation with the upstream chat backend
//!
//! A `Session` is bound to a single credential and walks a fixed sequence:
//! validate the caller's request, fetch the requirement token, build the
//! upstream conversation payload, send it. Streaming replies come back as raw
//! upstream events which `transcode` turns into `chat.completion.chunk`
//! frames; non-streaming replies are aggregated into one `chat.completion`.
//!
//! The `Backend` trait is the seam to the network. `HttpBackend` is the real
//! implementation; tests substitute fakes that count open connections.

pub mod backend;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod request;
pub mod session;
pub mod sse;
pub mod transcode;

#[cfg(test)]
mod testing;

pub use backend::{Backend, ByteStream, ChatRequirements, HttpBackend};
pub use connection::Connection;
pub use error::{Error, Result, classify_status};
pub use request::{ChatMessage, ChatRequest, MessageContent, Role};
pub use session::{Reply, Session, SessionState};
pub use sse::{RawEvent, RawEvents};
pub use transcode::{ChatCompletion, DONE_FRAME, PrimedStream, StreamChunk, error_frame, transcode};
