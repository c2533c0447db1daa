//! Shared handle to one open upstream response body
//!
//! The session and its event reader both hold a `Connection`. Whoever calls
//! `release` first drops the body (aborting the HTTP connection if it is still
//! streaming); every later call is a no-op. Reads after release see
//! end-of-stream.

use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;

use crate::backend::ByteStream;
use crate::error::Result;

#[derive(Clone)]
pub struct Connection {
    slot: Arc<Mutex<Option<ByteStream>>>,
}

impl Connection {
    pub fn new(body: ByteStream) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(body))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ByteStream>> {
        // A panic while polling leaves the Option intact; recover it.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop the body. Returns true only for the call that actually released it.
    pub fn release(&self) -> bool {
        let body = self.lock().take();
        body.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    pub(crate) fn poll_chunk(&self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes>>> {
        let mut slot = self.lock();
        match slot.as_mut() {
            Some(body) => body.as_mut().poll_next(cx),
            None => Poll::Ready(None),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.is_open())
            .finish()
    }
}
