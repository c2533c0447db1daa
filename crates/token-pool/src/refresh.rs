//! Scheduled token revalidation
//!
//! The pool doesn't know how to talk to the backend; a `TokenValidator`
//! supplied by the caller does. `spawn_refresh_task` is the timer that drives
//! `Pool::refresh`: one non-forced pass right after startup, then a forced
//! pass every `interval`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::pool::Pool;
use crate::token::CredentialToken;

/// Result of checking one token against the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// Backend rejected the credential (401/403). Quarantine it.
    Invalid(String),
    /// Network failure, 5xx, rate limiting. Says nothing about the token.
    Inconclusive(String),
}

/// Checks whether a credential is still accepted upstream.
///
/// Uses `Pin<Box<dyn Future>>` so the validator can be shared as
/// `Arc<dyn TokenValidator>`.
pub trait TokenValidator: Send + Sync {
    fn validate<'a>(
        &'a self,
        token: &'a CredentialToken,
    ) -> Pin<Box<dyn Future<Output = Validity> + Send + 'a>>;
}

/// Spawn the periodic revalidation task.
pub fn spawn_refresh_task(
    pool: Arc<Pool>,
    validator: Arc<dyn TokenValidator>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        pool.refresh(false, validator.as_ref()).await;

        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        info!(interval_secs = interval.as_secs(), "scheduled token refresh armed");

        loop {
            ticker.tick().await;
            pool.refresh(true, validator.as_ref()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingValidator {
        calls: AtomicUsize,
        reject: CredentialToken,
    }

    impl TokenValidator for CountingValidator {
        fn validate<'a>(
            &'a self,
            token: &'a CredentialToken,
        ) -> Pin<Box<dyn Future<Output = Validity> + Send + 'a>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                // Second and later passes reject one token
                if n >= 2 && *token == self.reject {
                    Validity::Invalid("401".into())
                } else {
                    Validity::Valid
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn startup_pass_then_forced_pass_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(
            Pool::open(dir.path().join("token.txt"), Duration::from_secs(86_400))
                .await
                .unwrap(),
        );
        pool.add(vec![CredentialToken::new("a"), CredentialToken::new("b")])
            .await
            .unwrap();

        let validator = Arc::new(CountingValidator {
            calls: AtomicUsize::new(0),
            reject: CredentialToken::new("b"),
        });
        let handle = spawn_refresh_task(pool.clone(), validator.clone(), Duration::from_secs(60));

        // Startup pass validates both tokens
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(validator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.snapshot().await.tokens_active, 2);

        // The interval pass is forced, so the fresh validations don't skip it
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(validator.calls.load(Ordering::SeqCst), 4);
        let snap = pool.snapshot().await;
        assert_eq!(snap.tokens_active, 1);
        assert_eq!(snap.quarantined, vec![CredentialToken::new("b")]);

        handle.abort();
    }
}
