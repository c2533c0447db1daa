//! Retry orchestration across credentials
//!
//! One inbound call runs up to `max_attempts` sessions, one at a time. A
//! failed session is closed before the next credential is drawn. Only auth
//! failures quarantine the credential; validation, pool exhaustion and server
//! errors end the loop immediately, as does an auth failure on a caller's own
//! credential. If the pool runs dry after a failed attempt, that attempt's
//! error is the one reported.

use std::sync::Arc;
use std::time::Duration;

use chat_session::{Backend, Error, Reply, Result, Session};
use serde_json::Value;
use token_pool::{CredentialToken, Pool};
use tracing::{debug, info, warn};

use crate::metrics;

/// Where a call's credentials come from.
pub enum CredentialSource {
    /// Rotate through the shared pool.
    Pool(Arc<Pool>),
    /// Caller supplied its own upstream credential; never pooled or quarantined.
    Direct(CredentialToken),
}

impl CredentialSource {
    async fn next(&self) -> Result<CredentialToken> {
        match self {
            CredentialSource::Pool(pool) => Ok(pool.select().await?),
            CredentialSource::Direct(token) => Ok(token.clone()),
        }
    }

    fn is_pooled(&self) -> bool {
        matches!(self, CredentialSource::Pool(_))
    }

    async fn quarantine(&self, token: &CredentialToken) {
        if let CredentialSource::Pool(pool) = self
            && pool.quarantine(token).await
        {
            warn!(token = %token, "credential quarantined after auth failure");
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub stream_idle_timeout: Duration,
}

pub struct Orchestrator {
    backend: Arc<dyn Backend>,
    policy: RetryPolicy,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn Backend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    /// Run the session pipeline until one attempt succeeds or retries run out.
    ///
    /// On success the live session is returned with its reply; for streaming
    /// replies the caller must keep the session alive while reading.
    pub async fn process(&self, source: &CredentialSource, payload: &Value) -> Result<(Session, Reply)> {
        let mut last_error = None;

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                metrics::record_retry();
                tokio::time::sleep(self.policy.backoff).await;
            }

            let token = match source.next().await {
                Ok(token) => token,
                // A pool that runs dry mid-loop reports the failure that drained it
                Err(exhausted) => match last_error {
                    Some(previous) => {
                        info!(attempt, error = %previous, "no usable credential left for retry");
                        return Err(previous);
                    }
                    None => return Err(exhausted),
                },
            };
            let mut session = Session::new(
                self.backend.clone(),
                token.clone(),
                self.policy.stream_idle_timeout,
            );

            match drive(&mut session, payload.clone()).await {
                Ok(reply) => {
                    debug!(attempt, token = %token, session = %session.id(), "session sent");
                    return Ok((session, reply));
                }
                Err(err) => {
                    session.close_client();
                    drop(session);

                    if !err.is_retryable() {
                        return Err(err);
                    }
                    metrics::record_upstream_error(err.kind());
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        token = %token,
                        error = %err,
                        "attempt failed"
                    );
                    if err.is_credential_fault() {
                        if !source.is_pooled() {
                            return Err(err);
                        }
                        source.quarantine(&token).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        info!(attempts = self.policy.max_attempts, "retries exhausted");
        Err(last_error.unwrap_or_else(|| Error::Server("no attempts were made".into())))
    }
}

async fn drive(session: &mut Session, payload: Value) -> Result<Reply> {
    session.set_dynamic_data(payload)?;
    session.get_chat_requirements().await?;
    session.prepare_send_conversation()?;
    session.send_conversation().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Calls, Script, ScriptedBackend, assistant, done};
    use chat_session::SessionState;
    use serde_json::json;

    fn payload(stream: bool) -> Value {
        json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": stream
        })
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
            stream_idle_timeout: Duration::from_secs(5),
        }
    }

    async fn pool_with(dir: &tempfile::TempDir, tokens: &[&str]) -> Arc<Pool> {
        let pool = Pool::open(dir.path().join("token.txt"), Duration::from_secs(3600))
            .await
            .unwrap();
        pool.add(tokens.iter().map(|t| CredentialToken::new(*t)).collect())
            .await
            .unwrap();
        Arc::new(pool)
    }

    fn ok_reply() -> Script {
        Script::Reply(vec![assistant("Hello"), done()])
    }

    #[tokio::test]
    async fn all_auth_failures_quarantine_each_and_surface_auth() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["a", "b", "c"]).await;
        let backend = Arc::new(ScriptedBackend::new(Script::RequirementsStatus(401)));
        let orchestrator = Orchestrator::new(backend.clone(), policy(3));

        let err = orchestrator
            .process(&CredentialSource::Pool(pool.clone()), &payload(false))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::Auth { status: 401, .. }));
        assert_eq!(backend.seen(), vec!["a", "b", "c"]);
        let snap = pool.snapshot().await;
        assert_eq!(snap.tokens_active, 0);
        assert_eq!(snap.quarantined.len(), 3);
    }

    #[tokio::test]
    async fn every_failed_session_releases_its_connection() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["a", "b", "c"]).await;
        // Non-streaming reply that fails mid-stream after the connection opened
        let failing = Script::Reply(vec![
            assistant("par"),
            "data: {\"error\": \"conversation failed\"}\n\n".into(),
        ]);
        let backend = Arc::new(ScriptedBackend::new(failing));
        let orchestrator = Orchestrator::new(backend.clone(), policy(3));

        let err = orchestrator
            .process(&CredentialSource::Pool(pool.clone()), &payload(false))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::Upstream { .. }));
        assert_eq!(Calls::get(&backend.calls.opened), 3);
        assert_eq!(Calls::get(&backend.calls.released), 3);
        // Upstream errors never quarantine
        assert_eq!(pool.snapshot().await.tokens_active, 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded_by_max() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["a", "b", "c", "d", "e"]).await;
        let backend = Arc::new(ScriptedBackend::new(Script::ConversationStatus(502)));
        let orchestrator = Orchestrator::new(backend.clone(), policy(2));

        let err = orchestrator
            .process(&CredentialSource::Pool(pool), &payload(false))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Upstream { status: Some(502), .. }));
        assert_eq!(Calls::get(&backend.calls.requirements), 2);
    }

    #[tokio::test]
    async fn validation_error_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["a", "b"]).await;
        let backend = Arc::new(ScriptedBackend::new(ok_reply()));
        let orchestrator = Orchestrator::new(backend.clone(), policy(3));

        let err = orchestrator
            .process(&CredentialSource::Pool(pool.clone()), &json!({"model": "gpt-4o"}))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(Calls::get(&backend.calls.requirements), 0);
        assert_eq!(pool.snapshot().await.tokens_active, 2);
    }

    #[tokio::test]
    async fn rate_limit_rotates_without_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["a", "b"]).await;
        let backend =
            Arc::new(ScriptedBackend::new(ok_reply()).with("a", Script::ConversationStatus(429)));
        let orchestrator = Orchestrator::new(backend.clone(), policy(3));

        let (session, reply) = orchestrator
            .process(&CredentialSource::Pool(pool.clone()), &payload(false))
            .await
            .unwrap();

        assert_eq!(session.credential(), &CredentialToken::new("b"));
        let Reply::Complete(completion) = reply else {
            panic!("expected aggregated reply");
        };
        assert_eq!(completion.content(), "Hello");
        assert_eq!(backend.seen(), vec!["a", "b"]);
        assert_eq!(pool.snapshot().await.tokens_active, 2);
    }

    #[tokio::test]
    async fn auth_failure_then_success_quarantines_only_bad_token() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["bad", "good"]).await;
        let backend =
            Arc::new(ScriptedBackend::new(ok_reply()).with("bad", Script::RequirementsStatus(403)));
        let orchestrator = Orchestrator::new(backend, policy(3));

        let (session, reply) = orchestrator
            .process(&CredentialSource::Pool(pool.clone()), &payload(true))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Sent);
        assert!(matches!(reply, Reply::Stream(_)));
        assert_eq!(
            pool.snapshot().await.quarantined,
            vec![CredentialToken::new("bad")]
        );
    }

    #[tokio::test]
    async fn stream_error_before_content_rotates_credential() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["a", "b"]).await;
        let broken = Script::Reply(vec!["data: {\"error\": \"internal\"}\n\n".into()]);
        let backend = Arc::new(ScriptedBackend::new(ok_reply()).with("a", broken));
        let orchestrator = Orchestrator::new(backend.clone(), policy(3));

        let (session, reply) = orchestrator
            .process(&CredentialSource::Pool(pool.clone()), &payload(true))
            .await
            .unwrap();

        assert_eq!(session.credential(), &CredentialToken::new("b"));
        assert!(matches!(reply, Reply::Stream(_)));
        assert_eq!(backend.seen(), vec!["a", "b"]);
        // The failed stream was released before the retry
        assert_eq!(Calls::get(&backend.calls.released), 1);
        assert_eq!(pool.snapshot().await.tokens_active, 2);
    }

    #[tokio::test]
    async fn pool_running_dry_surfaces_last_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["a", "b"]).await;
        let backend = Arc::new(ScriptedBackend::new(Script::RequirementsStatus(401)));
        let orchestrator = Orchestrator::new(backend.clone(), policy(3));

        let err = orchestrator
            .process(&CredentialSource::Pool(pool.clone()), &payload(false))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Auth { status: 401, .. }), "got {err:?}");
        assert_eq!(err.status_code(), 401);
        assert_eq!(Calls::get(&backend.calls.requirements), 2);
        assert_eq!(pool.snapshot().await.quarantined.len(), 2);
    }

    #[tokio::test]
    async fn empty_pool_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &[]).await;
        let backend = Arc::new(ScriptedBackend::new(ok_reply()));
        let orchestrator = Orchestrator::new(backend, policy(3));

        let err = orchestrator
            .process(&CredentialSource::Pool(pool), &payload(false))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn direct_credential_is_never_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(&dir, &["pooled"]).await;
        let backend = Arc::new(ScriptedBackend::new(Script::RequirementsStatus(401)));
        let orchestrator = Orchestrator::new(backend.clone(), policy(2));

        let err = orchestrator
            .process(
                &CredentialSource::Direct(CredentialToken::new("callers-own")),
                &payload(false),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Auth { .. }));
        // A rejected caller credential is not tried again
        assert_eq!(backend.seen(), vec!["callers-own"]);
        assert_eq!(pool.snapshot().await.tokens_active, 1);
    }

    #[tokio::test]
    async fn direct_credential_retries_upstream_errors() {
        let backend = Arc::new(ScriptedBackend::new(Script::ConversationStatus(502)));
        let orchestrator = Orchestrator::new(backend.clone(), policy(2));

        let err = orchestrator
            .process(
                &CredentialSource::Direct(CredentialToken::new("callers-own")),
                &payload(false),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Upstream { status: Some(502), .. }));
        assert_eq!(backend.seen(), vec!["callers-own", "callers-own"]);
    }
}
