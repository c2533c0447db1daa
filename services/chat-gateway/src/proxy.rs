//! Passthrough gateway
//!
//! Requests no other route claims are forwarded to the upstream host with
//! hop-by-hop headers and `host` stripped. The upstream response streams back
//! unbuffered, error statuses included. Paths under the redirect prefix get a
//! 302 to the landing page carrying the caller's seed, whether or not the
//! gateway is enabled.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, instrument, warn};

use crate::AppState;
use crate::config::GatewayConfig;
use crate::error::ApiError;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest request body forwarded upstream.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Timeouts get this many attempts in total, 100ms apart.
const MAX_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct GatewayState {
    pub client: reqwest::Client,
    pub base_url: String,
    pub timeout: Duration,
    pub config: GatewayConfig,
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Value of cookie `name` from any `Cookie` header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn is_url_safe(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'))
}

/// 302 to `/?seed=<seed>`; the seed comes from the seed cookie, else the clock.
pub fn seed_redirect(headers: &HeaderMap, cookie: &str) -> Response {
    let seed = cookie_value(headers, cookie)
        .filter(|v| is_url_safe(v))
        .unwrap_or_else(|| unix_now().to_string());
    (
        StatusCode::FOUND,
        [(header::LOCATION, format!("/?seed={seed}"))],
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct LandingQuery {
    seed: Option<String>,
}

/// `GET /`: landing page. The seed comes from `?seed=`, else the clock, and is
/// handed back as the seed cookie.
pub async fn landing_page(
    State(state): State<AppState>,
    Query(query): Query<LandingQuery>,
) -> Response {
    let config = &state.gateway.config;
    if !config.enabled {
        return ApiError::GatewayDisabled.into_response();
    }
    let seed = query
        .seed
        .filter(|v| is_url_safe(v))
        .unwrap_or_else(|| unix_now().to_string());
    let cookie = format!(
        "{}={seed}; Path=/; Max-Age=31536000; SameSite=Lax",
        config.seed_cookie
    );
    (
        [(header::SET_COOKIE, cookie)],
        Html(format!(
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Chat</title></head>\n\
             <body><p>Session seed: {seed}</p></body></html>\n"
        )),
    )
        .into_response()
}

/// `GET /backend-api/gizmos/bootstrap`: the web UI asks for this on load.
pub async fn gizmos_bootstrap(State(state): State<AppState>) -> Response {
    if !state.gateway.config.enabled {
        return ApiError::GatewayDisabled.into_response();
    }
    Json(json!({"gizmos": []})).into_response()
}

/// Static profile the web UI expects for the signed-in user.
fn profile(created: u64) -> Value {
    json!({
        "object": "user",
        "id": "org-chatgpt",
        "email": "chatgpt@openai.com",
        "name": "ChatGPT",
        "picture": "https://cdn.auth0.com/avatars/ai.png",
        "created": created,
        "phone_number": null,
        "mfa_flag_enabled": false,
        "amr": [],
        "groups": [],
        "orgs": {
            "object": "list",
            "data": [{
                "object": "organization",
                "id": "org-chatgpt",
                "created": 1715641300,
                "title": "Personal",
                "name": "user-chatgpt",
                "description": "Personal org for chatgpt@openai.com",
                "personal": true,
                "settings": {},
                "parent_org_id": null,
                "is_default": false,
                "role": "owner",
                "is_scale_tier_authorized_purchaser": null,
                "is_scim_managed": false,
                "projects": {"object": "list", "data": []},
                "groups": [],
                "geography": null
            }]
        },
        "has_payg_project_spend_limit": null
    })
}

/// `GET /backend-api/me`
pub async fn backend_me(State(state): State<AppState>) -> Response {
    if !state.gateway.config.enabled {
        return ApiError::GatewayDisabled.into_response();
    }
    Json(profile(unix_now())).into_response()
}

/// Catch-all route.
pub async fn passthrough_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let gateway = &state.gateway;
    let path = request.uri().path().trim_start_matches('/');
    if !gateway.config.redirect_prefix.is_empty() && path.starts_with(&gateway.config.redirect_prefix) {
        return seed_redirect(request.headers(), &gateway.config.seed_cookie);
    }
    if !gateway.config.enabled {
        return ApiError::GatewayDisabled.into_response();
    }
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy_request(gateway, request, request_id).await
}

/// Forward a request upstream and stream the response back.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &GatewayState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let method = request.method().clone();
    let upstream_url = match request.uri().path_and_query() {
        Some(pq) => format!("{}{}", state.base_url.trim_end_matches('/'), pq),
        None => state.base_url.clone(),
    };

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str()) && *name != header::HOST {
            headers.append(name.clone(), value.clone());
        }
    }

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return ApiError::BadRequest(e.to_string()).into_response();
        }
    };

    let retry_delay = Duration::from_millis(100);
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            warn!(attempt, "retrying after upstream timeout");
            tokio::time::sleep(retry_delay).await;
        }

        let sent = state
            .client
            .request(method.clone(), &upstream_url)
            .headers(headers.clone())
            .timeout(state.timeout)
            .body(body_bytes.clone())
            .send()
            .await;

        match sent {
            Ok(upstream_response) => {
                let mut response = Response::builder().status(upstream_response.status());
                for (name, value) in upstream_response.headers() {
                    if !is_hop_by_hop(name.as_str()) {
                        response = response.header(name, value);
                    }
                }
                return response
                    .body(Body::from_stream(upstream_response.bytes_stream()))
                    .unwrap_or_else(|e| {
                        ApiError::Upstream(format!("response build error: {e}")).into_response()
                    });
            }
            Err(e) if e.is_timeout() && attempt < MAX_ATTEMPTS - 1 => continue,
            Err(e) if e.is_timeout() => {
                error!(error = %e, attempts = MAX_ATTEMPTS, "upstream timeout after all retries");
                return ApiError::UpstreamTimeout(format!(
                    "no response after {}s ({MAX_ATTEMPTS} attempts)",
                    state.timeout.as_secs()
                ))
                .into_response();
            }
            Err(e) => {
                error!(error = %e, "upstream request failed");
                return ApiError::Upstream(e.to_string()).into_response();
            }
        }
    }

    ApiError::Upstream("retry loop ended without a response".into()).into_response()
}
