//! Token sequence, quarantine set and round-robin selection
//!
//! All mutable state lives behind a single `tokio::sync::Mutex` so that
//! `select`, `quarantine`, `add`, `clear` and `snapshot` never observe a torn
//! intermediate state. Store writes happen while that lock is held, which
//! makes `add` and `clear` atomic with respect to concurrent readers.
//!
//! Quarantined tokens stay in the sequence (and on disk). Only `clear`
//! forgets them.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::refresh::{TokenValidator, Validity};
use crate::store::TokenStore;
use crate::token::CredentialToken;

#[derive(Debug, Default)]
struct PoolState {
    tokens: Vec<CredentialToken>,
    quarantined: HashSet<CredentialToken>,
    cursor: usize,
    validated_at: HashMap<CredentialToken, Instant>,
}

impl PoolState {
    fn distinct(&self) -> HashSet<&CredentialToken> {
        self.tokens.iter().collect()
    }

    fn active_count(&self) -> usize {
        self.distinct()
            .into_iter()
            .filter(|t| !self.quarantined.contains(*t))
            .count()
    }

    fn publish_gauges(&self) {
        metrics::gauge!("token_pool_active").set(self.active_count() as f64);
        metrics::gauge!("token_pool_quarantined").set(self.quarantined.len() as f64);
    }
}

/// Point-in-time view of the pool, taken under one lock acquisition.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    /// Length of the token sequence, duplicates included
    pub tokens_total: usize,
    /// Distinct tokens not in quarantine
    pub tokens_active: usize,
    /// Distinct quarantined tokens (raw values, admin use only)
    #[serde(skip)]
    pub quarantined: Vec<CredentialToken>,
}

impl PoolSnapshot {
    /// Status label: all tokens usable → healthy, some → degraded, none → unhealthy.
    pub fn status(&self) -> &'static str {
        let distinct = self.tokens_active + self.quarantined.len();
        if self.tokens_active == 0 {
            "unhealthy"
        } else if self.tokens_active == distinct {
            "healthy"
        } else {
            "degraded"
        }
    }
}

/// Outcome of one refresh cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub checked: usize,
    pub skipped: usize,
    pub quarantined: usize,
    pub inconclusive: usize,
}

/// Pool of upstream credential tokens.
pub struct Pool {
    state: Mutex<PoolState>,
    store: TokenStore,
    revalidate_after: Duration,
}

impl Pool {
    /// Create a pool over an already-loaded store.
    ///
    /// `tokens` is the store's content at startup. `revalidate_after` is how
    /// long a successful validation is trusted by non-forced refreshes.
    pub fn new(store: TokenStore, tokens: Vec<CredentialToken>, revalidate_after: Duration) -> Self {
        info!(tokens = tokens.len(), path = %store.path().display(), "pool initialized");
        let state = PoolState {
            tokens,
            ..PoolState::default()
        };
        state.publish_gauges();
        Self {
            state: Mutex::new(state),
            store,
            revalidate_after,
        }
    }

    /// Load the token file at `path` and build a pool from it.
    pub async fn open(path: PathBuf, revalidate_after: Duration) -> Result<Self> {
        let (store, tokens) = TokenStore::load(path).await?;
        Ok(Self::new(store, tokens, revalidate_after))
    }

    /// Persist and append tokens. Returns the active count afterwards.
    ///
    /// The file append completes before the in-memory list changes; if the
    /// append fails, the pool is left untouched.
    pub async fn add(&self, tokens: Vec<CredentialToken>) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.store.append(&tokens).await?;
        let added = tokens.len();
        state.tokens.extend(tokens);
        state.publish_gauges();
        info!(
            added,
            tokens_total = state.tokens.len(),
            tokens_quarantined = state.quarantined.len(),
            "tokens added to pool"
        );
        Ok(state.active_count())
    }

    /// Select the next usable token, round-robin over insertion order.
    ///
    /// Returns `PoolExhausted` with pool counts when the sequence is empty or
    /// every token is quarantined.
    pub async fn select(&self) -> Result<CredentialToken> {
        let mut state = self.state.lock().await;
        let n = state.tokens.len();
        let start = if n == 0 { 0 } else { state.cursor % n };

        for offset in 0..n {
            let idx = (start + offset) % n;
            if state.quarantined.contains(&state.tokens[idx]) {
                continue;
            }
            state.cursor = idx + 1;
            let token = state.tokens[idx].clone();
            debug!(token = %token, "token selected");
            return Ok(token);
        }

        Err(Error::PoolExhausted(exhausted_message(&state)))
    }

    /// Mark a token unusable without removing it.
    ///
    /// Idempotent. Returns `true` only when this call changed the quarantine
    /// set. Tokens the pool doesn't hold are ignored.
    pub async fn quarantine(&self, token: &CredentialToken) -> bool {
        let mut state = self.state.lock().await;
        if !state.tokens.contains(token) {
            debug!(token = %token, "ignoring quarantine for token not in pool");
            return false;
        }
        let inserted = state.quarantined.insert(token.clone());
        if inserted {
            state.validated_at.remove(token);
            state.publish_gauges();
            warn!(
                token = %token,
                tokens_active = state.active_count(),
                "token quarantined"
            );
        }
        inserted
    }

    /// Remove every token, forget the quarantine set and truncate the file.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.store.truncate().await?;
        *state = PoolState::default();
        state.publish_gauges();
        info!("pool cleared");
        Ok(())
    }

    /// Counts and quarantined values from a single instant.
    pub async fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock().await;
        PoolSnapshot {
            tokens_total: state.tokens.len(),
            tokens_active: state.active_count(),
            quarantined: state.quarantined.iter().cloned().collect(),
        }
    }

    /// Revalidate active tokens and quarantine the ones the backend rejects.
    ///
    /// Validation runs without holding the pool lock. Unless `force` is set,
    /// tokens validated within `revalidate_after` are skipped. Inconclusive
    /// results leave the token alone.
    pub async fn refresh(&self, force: bool, validator: &dyn TokenValidator) -> RefreshReport {
        let mut report = RefreshReport::default();

        let candidates: Vec<CredentialToken> = {
            let state = self.state.lock().await;
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for token in &state.tokens {
                if state.quarantined.contains(token) || !seen.insert(token) {
                    continue;
                }
                let fresh = state
                    .validated_at
                    .get(token)
                    .is_some_and(|at| at.elapsed() < self.revalidate_after);
                if fresh && !force {
                    report.skipped += 1;
                    continue;
                }
                out.push(token.clone());
            }
            out
        };

        for token in candidates {
            report.checked += 1;
            match validator.validate(&token).await {
                Validity::Valid => {
                    let mut state = self.state.lock().await;
                    // The pool may have been cleared while validation ran
                    if state.tokens.contains(&token) && !state.quarantined.contains(&token) {
                        state.validated_at.insert(token, Instant::now());
                    }
                }
                Validity::Invalid(reason) => {
                    warn!(token = %token, reason, "token failed revalidation");
                    if self.quarantine(&token).await {
                        report.quarantined += 1;
                    }
                }
                Validity::Inconclusive(reason) => {
                    warn!(token = %token, reason, "token revalidation inconclusive, will retry next cycle");
                    report.inconclusive += 1;
                }
            }
        }

        info!(
            force,
            checked = report.checked,
            skipped = report.skipped,
            quarantined = report.quarantined,
            inconclusive = report.inconclusive,
            "token refresh cycle finished"
        );
        report
    }
}

/// Build the exhausted error message JSON.
fn exhausted_message(state: &PoolState) -> String {
    serde_json::json!({
        "error": {
            "type": "pool_exhausted",
            "message": "No usable credential tokens",
            "pool": {
                "tokens_total": state.tokens.len(),
                "tokens_active": state.active_count(),
                "tokens_quarantined": state.quarantined.len()
            }
        }
    })
    .to_string()
}
