//! Network seam to the upstream chat backend
//!
//! `Backend` covers the two calls a session makes: the pre-flight requirement
//! fetch and the streaming conversation send. `HttpBackend` talks HTTP via
//! reqwest; tests plug in fakes.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use token_pool::{CredentialToken, TokenValidator, Validity};
use tracing::debug;

use crate::error::{Error, Result, classify_status};

/// Raw upstream response body, chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Header carrying the requirement token on the conversation call.
pub const REQUIREMENTS_HEADER: &str = "openai-sentinel-chat-requirements-token";

/// Artifact returned by the requirement pre-flight.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequirements {
    pub token: String,
    #[serde(default)]
    pub persona: Option<String>,
}

/// The two upstream operations a session performs.
///
/// Uses `Pin<Box<dyn Future>>` return types so it can be held as
/// `Arc<dyn Backend>`.
pub trait Backend: Send + Sync {
    fn chat_requirements<'a>(
        &'a self,
        credential: &'a CredentialToken,
    ) -> BoxFuture<'a, Result<ChatRequirements>>;

    /// Open the conversation. On success the returned stream is the live
    /// upstream response body; dropping it releases the connection.
    fn conversation<'a>(
        &'a self,
        credential: &'a CredentialToken,
        requirements: &'a ChatRequirements,
        body: &'a Value,
    ) -> BoxFuture<'a, Result<ByteStream>>;
}

/// reqwest-backed implementation.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(
        base_url: impl Into<String>,
        user_agent: &str,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| Error::Server(format!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    fn headers(&self, credential: &CredentialToken) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        // An unencodable token can never authenticate; treat it as rejected
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
            .map_err(|_| Error::Auth {
                status: 401,
                message: format!("credential {credential} is not a valid header value"),
            })?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("oai-language", HeaderValue::from_static("en-US"));
        if let Ok(origin) = HeaderValue::from_str(&self.base_url) {
            headers.insert("origin", origin);
        }
        Ok(headers)
    }

    async fn fetch_requirements(&self, credential: &CredentialToken) -> Result<ChatRequirements> {
        let url = format!("{}/backend-api/sentinel/chat-requirements", self.base_url);
        let resp = self
            .client
            .post(&url)
            .headers(self.headers(credential)?)
            .body("{}")
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let requirements: ChatRequirements = resp
            .json()
            .await
            .map_err(|e| Error::upstream(format!("malformed requirements response: {e}")))?;
        if requirements.token.is_empty() {
            return Err(Error::upstream("requirements response carried an empty token"));
        }
        debug!(token = %credential, "chat requirements obtained");
        Ok(requirements)
    }

    async fn open_conversation(
        &self,
        credential: &CredentialToken,
        requirements: &ChatRequirements,
        body: &Value,
    ) -> Result<ByteStream> {
        let url = format!("{}/backend-api/conversation", self.base_url);
        let mut headers = self.headers(credential)?;
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        let sentinel = HeaderValue::from_str(&requirements.token)
            .map_err(|_| Error::upstream("requirement token is not a valid header value"))?;
        headers.insert(REQUIREMENTS_HEADER, sentinel);

        let payload =
            serde_json::to_vec(body).map_err(|e| Error::Server(format!("encoding body: {e}")))?;

        // Only the response head is bounded here; body reads are bounded by the
        // stream idle timeout in the transcoder.
        let send = self.client.post(&url).headers(headers).body(payload).send();
        let resp = tokio::time::timeout(self.request_timeout, send)
            .await
            .map_err(|_| {
                Error::upstream(format!(
                    "no response head after {}s",
                    self.request_timeout.as_secs()
                ))
            })?
            .map_err(transport_error)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(transport_error));
        Ok(Box::pin(stream))
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::upstream(format!("upstream timeout: {err}"))
    } else {
        Error::upstream(format!("upstream request failed: {err}"))
    }
}

impl Backend for HttpBackend {
    fn chat_requirements<'a>(
        &'a self,
        credential: &'a CredentialToken,
    ) -> BoxFuture<'a, Result<ChatRequirements>> {
        Box::pin(self.fetch_requirements(credential))
    }

    fn conversation<'a>(
        &'a self,
        credential: &'a CredentialToken,
        requirements: &'a ChatRequirements,
        body: &'a Value,
    ) -> BoxFuture<'a, Result<ByteStream>> {
        Box::pin(self.open_conversation(credential, requirements, body))
    }
}

/// Revalidation uses the same pre-flight a real request makes.
impl TokenValidator for HttpBackend {
    fn validate<'a>(
        &'a self,
        token: &'a CredentialToken,
    ) -> Pin<Box<dyn Future<Output = Validity> + Send + 'a>> {
        Box::pin(async move {
            match self.fetch_requirements(token).await {
                Ok(_) => Validity::Valid,
                Err(e) if e.is_credential_fault() => Validity::Invalid(e.to_string()),
                Err(e) => Validity::Inconclusive(e.to_string()),
            }
        })
    }
}
