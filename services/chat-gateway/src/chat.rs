//! `POST /v1/chat/completions`

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chat_session::{Reply, transcode};
use common::Secret;
use serde_json::Value;
use token_pool::{CredentialToken, Pool};
use tracing::{Span, info, instrument};

use crate::AppState;
use crate::error::ApiError;
use crate::metrics::{self, TrackedStream};
use crate::retry::CredentialSource;

/// Pick the credential source for a caller.
///
/// A bearer key on the allow-list uses the pool. With an empty allow-list, a
/// missing bearer also uses the pool. Any other bearer is the caller's own
/// upstream credential.
pub fn credential_source(
    headers: &HeaderMap,
    allow_list: &[Secret<String>],
    pool: &Arc<Pool>,
) -> Result<CredentialSource, ApiError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
        .filter(|v| !v.is_empty());

    match bearer {
        None if allow_list.is_empty() => Ok(CredentialSource::Pool(pool.clone())),
        None => Err(ApiError::Unauthorized),
        Some(key) if allow_list.iter().any(|k| k.matches(key)) => {
            Ok(CredentialSource::Pool(pool.clone()))
        }
        Some(key) => Ok(CredentialSource::Direct(CredentialToken::new(key))),
    }
}

#[instrument(skip_all, fields(request_id))]
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    Span::current().record("request_id", request_id.as_str());
    let started = Instant::now();
    let guard = state.counters.begin();

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return failed(&state, ApiError::InvalidJson, false, started),
    };
    let stream = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let source = match credential_source(&headers, &state.authorization, &state.pool) {
        Ok(source) => source,
        Err(e) => return failed(&state, e, stream, started),
    };

    match state.orchestrator.process(&source, &payload).await {
        Err(e) => failed(&state, e.into(), stream, started),
        Ok((session, Reply::Complete(completion))) => {
            drop(session);
            metrics::record_request(200, false, started.elapsed().as_secs_f64());
            info!(%request_id, "completion served");
            Json(completion).into_response()
        }
        Ok((session, Reply::Stream(primed))) => {
            info!(%request_id, session = %session.id(), "streaming completion");
            let frames = TrackedStream::new(transcode(session, primed), guard, started);
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                Body::from_stream(frames),
            )
                .into_response()
        }
    }
}

fn failed(state: &AppState, err: ApiError, stream: bool, started: Instant) -> Response {
    let status = err.status().as_u16();
    state.counters.record_error();
    metrics::record_request(status, stream, started.elapsed().as_secs_f64());
    err.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    async fn pool() -> (tempfile::TempDir, Arc<Pool>) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(dir.path().join("token.txt"), std::time::Duration::from_secs(60))
            .await
            .unwrap();
        (dir, Arc::new(pool))
    }

    fn bearer(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {value}")).unwrap(),
        );
        headers
    }

    fn allow(keys: &[&str]) -> Vec<Secret<String>> {
        keys.iter().map(|k| Secret::new(k.to_string())).collect()
    }

    #[tokio::test]
    async fn allow_listed_key_uses_pool() {
        let (_dir, pool) = pool().await;
        let source = credential_source(&bearer("caller-key"), &allow(&["caller-key"]), &pool).unwrap();
        assert!(matches!(source, CredentialSource::Pool(_)));
    }

    #[tokio::test]
    async fn unknown_key_is_used_directly() {
        let (_dir, pool) = pool().await;
        let source = credential_source(&bearer("eyJ-upstream"), &allow(&["caller-key"]), &pool).unwrap();
        match source {
            CredentialSource::Direct(token) => assert_eq!(token.expose(), "eyJ-upstream"),
            CredentialSource::Pool(_) => panic!("unknown bearer must not use the pool"),
        }
    }

    #[tokio::test]
    async fn missing_bearer_with_empty_allow_list_uses_pool() {
        let (_dir, pool) = pool().await;
        let source = credential_source(&HeaderMap::new(), &[], &pool).unwrap();
        assert!(matches!(source, CredentialSource::Pool(_)));
    }

    #[tokio::test]
    async fn missing_bearer_with_allow_list_is_unauthorized() {
        let (_dir, pool) = pool().await;
        let err = credential_source(&HeaderMap::new(), &allow(&["caller-key"]), &pool)
            .err()
            .unwrap();
        assert!(matches!(err, ApiError::Unauthorized));
    }

    #[tokio::test]
    async fn bearer_with_empty_allow_list_is_direct() {
        let (_dir, pool) = pool().await;
        let source = credential_source(&bearer("tok"), &[], &pool).unwrap();
        assert!(matches!(source, CredentialSource::Direct(_)));
    }
}
