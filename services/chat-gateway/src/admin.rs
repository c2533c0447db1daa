//! Token administration
//!
//! - GET  {prefix}/tokens         HTML page with the active count and upload form
//! - POST {prefix}/tokens/upload  form field `text`, newline-delimited tokens
//! - POST {prefix}/tokens/clear   drop every token, in memory and on disk
//! - POST {prefix}/tokens/error   list quarantined tokens

use axum::Form;
use axum::Json;
use axum::extract::State;
use axum::response::{Html, IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use token_pool::parse_token_lines;
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct UploadForm {
    #[serde(default)]
    text: String,
}

pub async fn tokens_page(State(state): State<AppState>) -> Html<String> {
    let snapshot = state.pool.snapshot().await;
    let prefix = &state.api_prefix;
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Tokens</title></head>
<body>
<h1>Credential tokens</h1>
<p>Active tokens: {active} of {total}</p>
<form method="post" action="{prefix}/tokens/upload">
<textarea name="text" rows="12" cols="80" placeholder="one token per line"></textarea><br>
<button type="submit">Upload</button>
</form>
<form method="post" action="{prefix}/tokens/clear">
<button type="submit">Clear all tokens</button>
</form>
</body>
</html>
"#,
        active = snapshot.tokens_active,
        total = snapshot.tokens_total,
    ))
}

pub async fn upload_tokens(
    State(state): State<AppState>,
    Form(form): Form<UploadForm>,
) -> Response {
    let tokens = parse_token_lines(&form.text);
    let uploaded = tokens.len();
    match state.pool.add(tokens).await {
        Ok(active) => {
            info!(uploaded, active, "tokens uploaded");
            Json(json!({"status": "success", "tokens_count": active})).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

pub async fn clear_tokens(State(state): State<AppState>) -> Response {
    match state.pool.clear().await {
        Ok(()) => {
            info!("token pool cleared");
            Json(json!({"status": "success", "tokens_count": 0})).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

pub async fn error_tokens(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.pool.snapshot().await;
    let tokens: Vec<&str> = snapshot.quarantined.iter().map(|t| t.expose()).collect();
    Json(json!({"status": "success", "error_tokens": tokens}))
}
