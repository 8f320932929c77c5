// Sidecar connectivity client - owns the connection descriptor and executes requests
use crate::error::{classify_response, ApiError, Result};
use futures::{Stream, StreamExt};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;

/// Probed first; cached on success.
const PRIMARY_HOST: &str = "127.0.0.1";
/// Probed only when the primary host refuses the connection.
const FALLBACK_HOST: &str = "localhost";

/// Header carrying the sidecar auth token once discovery has delivered one.
pub const TOKEN_HEADER: &str = "x-scholar-token";

const RATE_LIMIT_RETRIES: u32 = 3;
const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Everything needed to address the sidecar. Produced by discovery, consumed
/// by [`ApiClient::apply_descriptor`]; immutable until a fresh discovery event
/// (e.g. a backend restart) replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_hint: Option<String>,
    pub port: String,
    pub token: String,
}

impl ConnectionDescriptor {
    pub fn is_complete(&self) -> bool {
        !self.port.trim().is_empty() && !self.token.trim().is_empty()
    }
}

fn known_host(host: &str) -> Option<&'static str> {
    match host {
        PRIMARY_HOST => Some(PRIMARY_HOST),
        FALLBACK_HOST => Some(FALLBACK_HOST),
        _ => None,
    }
}

fn build_http_client() -> Client {
    Client::builder()
        .build()
        .expect("Failed to create HTTP client")
}

fn build_stream_client() -> Client {
    Client::builder()
        .http1_only()
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .expect("Failed to create stream client")
}

/// Outcome of one host attempt (including its rate-limit retries).
enum Attempt {
    Success(reqwest::Response),
    /// Response received and classified; authoritative, no retry or fallback.
    Classified(ApiError),
    Transport(reqwest::Error),
}

/// Process-wide connectivity client for the sidecar API.
///
/// Holds the current connection descriptor and the cached reachable host.
/// Constructed once by the host runtime and shared (`Arc`) with whichever
/// layer issues requests.
pub struct ApiClient {
    http_client: Client,
    /// Separate client tuned for long-lived chunked responses
    stream_client: Client,
    port: RwLock<Option<String>>,
    token: RwLock<Option<String>>,
    active_host: RwLock<Option<&'static str>>,
}

impl ApiClient {
    pub fn new() -> Self {
        Self {
            http_client: build_http_client(),
            stream_client: build_stream_client(),
            port: RwLock::new(None),
            token: RwLock::new(None),
            active_host: RwLock::new(None),
        }
    }

    /// Get the port the client is currently addressing, if discovery ran.
    pub async fn port(&self) -> Option<String> {
        self.port.read().await.clone()
    }

    /// The most recently verified reachable host for the current port.
    pub async fn active_host(&self) -> Option<&'static str> {
        *self.active_host.read().await
    }

    /// Accept a new sidecar port. Empty input is rejected so a spurious
    /// notification can never clear a previously valid value. Accepting a
    /// port resets the cached host; the next request re-probes reachability.
    pub async fn set_port(&self, port: &str) {
        if port.trim().is_empty() {
            tracing::warn!("Ignoring empty sidecar port update");
            return;
        }
        {
            let mut guard = self.port.write().await;
            *guard = Some(port.to_string());
        }
        {
            let mut host = self.active_host.write().await;
            *host = None;
        }
        tracing::info!("API client bound to sidecar port {}", port);
    }

    /// Accept a new auth token. Empty input is rejected (no-op).
    pub async fn set_token(&self, token: &str) {
        if token.trim().is_empty() {
            tracing::warn!("Ignoring empty sidecar token update");
            return;
        }
        let mut guard = self.token.write().await;
        *guard = Some(token.to_string());
    }

    /// Install a full descriptor (both discovery paths funnel through here).
    /// Safe to call repeatedly; a refresh replaces port and token and resets
    /// the cached host. A `host_hint` naming a known probe host seeds the
    /// cache so the first request skips straight to it.
    pub async fn apply_descriptor(&self, descriptor: &ConnectionDescriptor) {
        self.set_port(&descriptor.port).await;
        self.set_token(&descriptor.token).await;

        if let Some(hint) = descriptor.host_hint.as_deref() {
            match known_host(hint) {
                Some(host) => {
                    let mut guard = self.active_host.write().await;
                    *guard = Some(host);
                }
                None => tracing::debug!("Ignoring unknown host hint: {}", hint),
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.execute(&self.http_client, Method::GET, path, None).await?;
        decode_json(response).await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let response = self
            .execute(&self.http_client, Method::POST, path, Some(body))
            .await?;
        decode_json(response).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .execute(&self.http_client, Method::DELETE, path, None)
            .await?;
        decode_json(response).await
    }

    /// Issue a streaming POST and return the raw chunk sequence: one item per
    /// non-blank line flushed by the backend, before any semantic decoding
    /// (see [`crate::stream::decode_chunk`] for that layer). The sequence is
    /// single-pass and ends when the transport closes; a retry is a fresh
    /// `stream` call.
    pub async fn stream(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<impl Stream<Item = Result<String>>> {
        let response = self
            .execute(&self.stream_client, Method::POST, path, Some(body))
            .await?;

        let stream = response.bytes_stream();

        Ok(async_stream::stream! {
            futures::pin_mut!(stream);

            while let Some(chunk_result) = stream.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        let text = String::from_utf8_lossy(&chunk);
                        for line in text.split('\n') {
                            if !line.trim().is_empty() {
                                yield Ok(line.to_string());
                            }
                        }
                    }
                    Err(e) => {
                        let err_msg = e.to_string();
                        // "error decoding response body" is the usual reqwest wording when the
                        // connection closes mid-transfer, e.g. a sidecar idle timeout.
                        if err_msg.contains("error decoding response body") {
                            tracing::warn!("Stream closed by sidecar: {}", err_msg);
                        } else {
                            tracing::error!("Stream transport error: {}", e);
                        }
                        yield Err(ApiError::Network(format!("stream error: {}", e)));
                        break;
                    }
                }
            }
            tracing::debug!("Sidecar stream ended");
        })
    }

    /// Execute one logical request. Ordering:
    ///
    /// 1. cached host first; a classified HTTP error is authoritative and
    ///    propagates, any other failure clears the cache and falls through;
    /// 2. primary host, then the fallback host only when the primary refused
    ///    the connection; the host that answers is cached.
    ///
    /// Rate limiting is handled per host inside [`Self::attempt_host`].
    async fn execute(
        &self,
        client: &Client,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let port = self.port.read().await.clone().ok_or_else(|| {
            ApiError::Config(format!(
                "request to {} issued before sidecar discovery assigned a port",
                path
            ))
        })?;
        let token = self.token.read().await.clone();

        let cached = *self.active_host.read().await;
        if let Some(host) = cached {
            match self
                .attempt_host(client, &method, host, &port, path, body, token.as_deref())
                .await
            {
                Attempt::Success(response) => return Ok(response),
                Attempt::Classified(error) => return Err(error),
                Attempt::Transport(error) => {
                    tracing::debug!("Cached host {} unreachable ({}), re-probing", host, error);
                    let mut guard = self.active_host.write().await;
                    *guard = None;
                }
            }
        }

        match self
            .attempt_host(client, &method, PRIMARY_HOST, &port, path, body, token.as_deref())
            .await
        {
            Attempt::Success(response) => {
                let mut guard = self.active_host.write().await;
                *guard = Some(PRIMARY_HOST);
                Ok(response)
            }
            Attempt::Classified(error) => Err(error),
            Attempt::Transport(error) if error.is_connect() => {
                tracing::debug!(
                    "Primary host refused connection, falling back to {}",
                    FALLBACK_HOST
                );
                match self
                    .attempt_host(
                        client,
                        &method,
                        FALLBACK_HOST,
                        &port,
                        path,
                        body,
                        token.as_deref(),
                    )
                    .await
                {
                    Attempt::Success(response) => {
                        let mut guard = self.active_host.write().await;
                        *guard = Some(FALLBACK_HOST);
                        Ok(response)
                    }
                    Attempt::Classified(error) => Err(error),
                    Attempt::Transport(error) => Err(ApiError::Network(error.to_string())),
                }
            }
            Attempt::Transport(error) => Err(ApiError::Network(error.to_string())),
        }
    }

    /// One host attempt, absorbing HTTP 429 with exponential backoff
    /// (1s, 2s, 4s) before the final response is classified like any other.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_host(
        &self,
        client: &Client,
        method: &Method,
        host: &'static str,
        port: &str,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Attempt {
        let url = format!("http://{}:{}{}", host, port, path);
        let mut delay = RATE_LIMIT_BASE_DELAY;
        let mut retries_left = RATE_LIMIT_RETRIES;

        loop {
            let mut request = client
                .request(method.clone(), &url)
                .header(reqwest::header::CONTENT_TYPE, "application/json");
            if let Some(token) = token {
                request = request.header(TOKEN_HEADER, token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(error) => return Attempt::Transport(error),
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS && retries_left > 0 {
                tracing::warn!(
                    "Rate limited by {} ({} retries left), backing off {:?}",
                    url,
                    retries_left,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                retries_left -= 1;
                continue;
            }

            if status.is_success() {
                return Attempt::Success(response);
            }

            return Attempt::Classified(classify_response(response).await);
        }
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| ApiError::Network(format!("failed to decode response body: {}", e)))
}
