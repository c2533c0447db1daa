//! Per-request session state machine
//!
//! ```text
//! Created -> DynamicDataSet -> RequirementsObtained -> Prepared -> Sent -> Closed
//!     \______________\___________________\________________\________-> Failed
//! ```
//!
//! Each operation checks the current state; calling one out of order is a
//! server error and moves the session to `Failed`. `close_client` may be
//! called from any state, any number of times, and dropping the session
//! calls it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use token_pool::CredentialToken;
use tracing::debug;

use crate::backend::{Backend, ChatRequirements};
use crate::connection::Connection;
use crate::conversation::{build_conversation, new_node_id};
use crate::error::{Error, Result};
use crate::request::ChatRequest;
use crate::sse::RawEvents;
use crate::transcode::{ChatCompletion, PrimedStream, aggregate, prime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    DynamicDataSet,
    RequirementsObtained,
    Prepared,
    Sent,
    Closed,
    Failed,
}

/// What `send_conversation` produced.
#[derive(Debug)]
pub enum Reply {
    /// Non-streaming request, already aggregated.
    Complete(ChatCompletion),
    /// Streaming request, read up to its first delta; feed to `transcode`.
    Stream(PrimedStream),
}

pub struct Session {
    id: String,
    backend: Arc<dyn Backend>,
    credential: CredentialToken,
    idle_timeout: Duration,
    state: SessionState,
    request: Option<ChatRequest>,
    requirements: Option<ChatRequirements>,
    payload: Option<Value>,
    conversation_id: Option<String>,
    connection: Option<Connection>,
}

impl Session {
    pub fn new(
        backend: Arc<dyn Backend>,
        credential: CredentialToken,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            backend,
            credential,
            idle_timeout,
            state: SessionState::Created,
            request: None,
            requirements: None,
            payload: None,
            conversation_id: None,
            connection: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn credential(&self) -> &CredentialToken {
        &self.credential
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn is_stream(&self) -> bool {
        self.request.as_ref().is_some_and(|r| r.stream)
    }

    /// Caller-facing model name, echoed back in responses.
    pub fn model(&self) -> &str {
        self.request.as_ref().map_or("", |r| r.model.as_str())
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub(crate) fn set_conversation_id(&mut self, id: &str) {
        if self.conversation_id.is_none() {
            self.conversation_id = Some(id.to_string());
        }
    }

    fn expect(&mut self, expected: SessionState, op: &str) -> Result<()> {
        if self.state == expected {
            return Ok(());
        }
        let err = Error::Server(format!(
            "{op} called in state {:?}, expected {expected:?}",
            self.state
        ));
        self.state = SessionState::Failed;
        Err(err)
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        debug!(session = %self.id, token = %self.credential, error = %err, "session failed");
        self.state = SessionState::Failed;
        Err(err)
    }

    /// Validate and store the caller's request. No network.
    pub fn set_dynamic_data(&mut self, payload: Value) -> Result<()> {
        self.expect(SessionState::Created, "set_dynamic_data")?;
        match ChatRequest::from_value(payload) {
            Ok(request) => {
                self.request = Some(request);
                self.state = SessionState::DynamicDataSet;
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Fetch the requirement artifact for this session's credential.
    pub async fn get_chat_requirements(&mut self) -> Result<()> {
        self.expect(SessionState::DynamicDataSet, "get_chat_requirements")?;
        match self.backend.chat_requirements(&self.credential).await {
            Ok(requirements) => {
                self.requirements = Some(requirements);
                self.state = SessionState::RequirementsObtained;
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Build the upstream conversation payload. No network.
    pub fn prepare_send_conversation(&mut self) -> Result<()> {
        self.expect(SessionState::RequirementsObtained, "prepare_send_conversation")?;
        let Some(request) = self.request.as_ref() else {
            return self.fail(Error::Server("request missing after validation".into()));
        };
        self.payload = Some(build_conversation(request, new_node_id));
        self.state = SessionState::Prepared;
        Ok(())
    }

    /// Send the conversation. Streaming requests are read up to the first
    /// content delta, so an upstream error before any content fails here;
    /// non-streaming requests are drained and aggregated here.
    pub async fn send_conversation(&mut self) -> Result<Reply> {
        self.expect(SessionState::Prepared, "send_conversation")?;
        let sent = match (self.requirements.as_ref(), self.payload.as_ref()) {
            (Some(requirements), Some(payload)) => {
                self.backend
                    .conversation(&self.credential, requirements, payload)
                    .await
            }
            _ => Err(Error::Server("send_conversation without prepared payload".into())),
        };
        let body = match sent {
            Ok(body) => body,
            Err(e) => return self.fail(e),
        };

        let connection = Connection::new(body);
        self.connection = Some(connection.clone());
        self.state = SessionState::Sent;
        let events = RawEvents::new(connection);
        let model = self.model().to_string();

        if self.is_stream() {
            return match prime(events, &model, self.idle_timeout).await {
                Ok(primed) => Ok(Reply::Stream(primed)),
                Err(e) => {
                    self.release_connection();
                    self.fail(e)
                }
            };
        }

        let result = aggregate(events, &model, self.idle_timeout).await;
        // Body fully read (or abandoned); give the connection back now.
        self.release_connection();
        match result {
            Ok(completion) => {
                if let Some(id) = completion.conversation_id.as_deref() {
                    self.set_conversation_id(id);
                }
                Ok(Reply::Complete(completion))
            }
            Err(e) => self.fail(e),
        }
    }

    fn release_connection(&self) {
        if let Some(connection) = self.connection.as_ref()
            && connection.release()
        {
            debug!(session = %self.id, token = %self.credential, "upstream connection released");
        }
    }

    /// Release the upstream connection. Safe to call repeatedly.
    pub fn close_client(&mut self) {
        self.release_connection();
        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.connection.as_ref().is_some_and(Connection::is_open) {
            debug!(session = %self.id, "session dropped with open connection, releasing");
        }
        self.close_client();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("credential", &self.credential)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
