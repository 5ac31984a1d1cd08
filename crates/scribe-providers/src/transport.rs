use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, Proxy, Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{classify_error_body, ProviderError};

pub const DEFAULT_ENDPOINT_URL: &str = "https://api.openai.com";
pub const DEFAULT_CHAT_PATH: &str = "/v1/chat/completions";

/// Scheme, host and path of a chat-completion endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    /// Falls back to the public endpoint when unset and to the default chat path
    /// when the configured url has no path component.
    pub fn parse(raw: Option<&str>) -> Result<Self, ProviderError> {
        let raw = raw
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_ENDPOINT_URL);
        let mut url = Url::parse(raw).map_err(|err| ProviderError::InvalidEndpoint {
            url: raw.to_string(),
            reason: err.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ProviderError::InvalidEndpoint {
                    url: raw.to_string(),
                    reason: format!("unsupported scheme `{other}`"),
                })
            }
        }
        if url.host_str().is_none() {
            return Err(ProviderError::InvalidEndpoint {
                url: raw.to_string(),
                reason: "missing host".to_string(),
            });
        }
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(DEFAULT_CHAT_PATH);
        }
        Ok(Self { url })
    }

    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "https"
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxySettings {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxySettings {
    pub fn is_configured(&self) -> bool {
        !self.address.trim().is_empty() && self.port > 0
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub proxy: Option<ProxySettings>,
    pub connect_timeout: Duration,
    /// Idle time allowed between two body reads.
    pub read_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub endpoint: Endpoint,
    pub token: String,
    pub body: Value,
}

/// Issues a chat-completion request and hands back the live response body.
///
/// Implementations classify 4xx/5xx responses before returning, so a
/// `Connection` always represents a successful (200-399) response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ChatRequest) -> Result<Connection, ProviderError>;
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ProviderError>> + Send>>;

/// A response body being read. Closing drops the body and runs the close hook;
/// both happen at most once, and dropping the connection closes it.
pub struct Connection {
    chunks: Option<ChunkStream>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Connection {
    pub fn new(chunks: ChunkStream) -> Self {
        Self {
            chunks: Some(chunks),
            on_close: None,
        }
    }

    pub fn from_response(response: Response) -> Self {
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ProviderError::from));
        Self::new(Box::pin(chunks))
    }

    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    /// `None` once the body is exhausted or the connection closed.
    pub async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, ProviderError>> {
        self.chunks.as_mut()?.next().await
    }

    pub fn is_closed(&self) -> bool {
        self.chunks.is_none()
    }

    pub fn close(&mut self) {
        if self.chunks.take().is_some() {
            if let Some(hook) = self.on_close.take() {
                hook();
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(settings: &TransportSettings) -> Result<Self, ProviderError> {
        let mut builder = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .read_timeout(settings.read_timeout);
        if let Some(proxy) = settings.proxy.as_ref().filter(|p| p.is_configured()) {
            let proxy_url = format!("http://{}:{}", proxy.address.trim(), proxy.port);
            let mut rule =
                Proxy::all(proxy_url.as_str()).map_err(|err| ProviderError::InvalidEndpoint {
                    url: proxy_url.clone(),
                    reason: err.to_string(),
                })?;
            if let Some(username) = proxy.username.as_deref().filter(|u| !u.is_empty()) {
                rule = rule.basic_auth(username, proxy.password.as_deref().unwrap_or_default());
            }
            builder = builder.proxy(rule);
        } else {
            builder = builder.no_proxy();
        }
        let client = builder.build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ChatRequest) -> Result<Connection, ProviderError> {
        tracing::debug!(
            host = request.endpoint.host(),
            path = request.endpoint.path(),
            tls = request.endpoint.is_tls(),
            "sending chat completion request"
        );
        let response = self
            .client
            .post(request.endpoint.url().clone())
            .header(CONTENT_TYPE, "application/json")
            .header(CACHE_CONTROL, "no-cache")
            .bearer_auth(&request.token)
            .json(&request.body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if (200..400).contains(&status) {
            return Ok(Connection::from_response(response)
                .on_close(|| tracing::debug!("provider connection closed")));
        }
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status, "provider rejected chat completion request");
        Err(classify_error_body(status, &body))
    }
}

/// Drains a connection into memory, for non-streaming responses.
pub async fn read_body(connection: &mut Connection) -> Result<Vec<u8>, ProviderError> {
    let mut body = Vec::new();
    while let Some(chunk) = connection.next_chunk().await {
        body.extend_from_slice(&chunk?);
    }
    connection.close();
    Ok(body)
}
