//! HTTP manager - one-shot requests keyed by request id

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::constants::STREAMING_CONTENT_TYPES;
use crate::error::ManagerError;
use crate::messages::HttpResponse;
use crate::models::{
    enabled_headers, AuthType, ConnectOptions, Header, HttpMethod, HttpRequestOptions,
    OutboundPayload, Protocol,
};
use crate::network::lifecycle::{ConnectionInfo, ConnectionManager};
use crate::network::registry::{CallToken, InFlight, Registry};

/// Build a request from the given parameters
fn build_request(
    client: &reqwest::Client,
    request: &HttpRequestOptions,
    timeout: Duration,
) -> reqwest::RequestBuilder {
    let url = request.url.trim();
    let mut req_builder = match request.method {
        HttpMethod::GET => client.get(url),
        HttpMethod::POST => client.post(url),
        HttpMethod::PUT => client.put(url),
        HttpMethod::PATCH => client.patch(url),
        HttpMethod::DELETE => client.delete(url),
        HttpMethod::HEAD => client.head(url),
        HttpMethod::OPTIONS => client.request(reqwest::Method::OPTIONS, url),
    };

    req_builder = req_builder.timeout(timeout);

    for header in enabled_headers(&request.headers) {
        req_builder = req_builder.header(header.key.trim(), &header.value);
    }

    match &request.auth {
        AuthType::Bearer(token) => {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", token));
        }
        AuthType::Basic { username, password } => {
            let credentials = format!("{}:{}", username, password);
            let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
            req_builder = req_builder.header("Authorization", format!("Basic {}", encoded));
        }
        AuthType::None => {}
    }

    // Bodiless methods never carry a body, even if one was supplied
    if request.method.has_body() {
        if let Some(body) = request.body.as_ref().filter(|b| !b.is_empty()) {
            req_builder = req_builder.body(body.clone());
        }
    }

    req_builder
}

/// True when the content type says the body is an open-ended stream
pub fn is_streaming(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            let essence = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            STREAMING_CONTENT_TYPES.contains(&essence.as_str())
        })
        .unwrap_or(false)
}

fn response_headers(headers: &HeaderMap) -> Vec<Header> {
    headers
        .iter()
        .map(|(name, value)| Header::new(name.as_str(), String::from_utf8_lossy(value.as_bytes())))
        .collect()
}

pub struct HttpManager {
    client: reqwest::Client,
    /// Same as `client` but accepting any certificate
    insecure_client: reqwest::Client,
    in_flight: Registry<CallToken>,
    default_timeout: Duration,
}

impl HttpManager {
    pub fn new(config: &Config) -> Self {
        HttpManager {
            client: create_client(config, false),
            insecure_client: create_client(config, true),
            in_flight: Registry::new(),
            default_timeout: config.http_timeout(),
        }
    }

    /// Execute a request. The body is only read when the response is not a stream.
    pub async fn request(
        &self,
        request_id: &str,
        options: HttpRequestOptions,
    ) -> Result<HttpResponse, ManagerError> {
        let call = InFlight::register(&self.in_flight, request_id)?;
        let token = call.token();

        tracing::info!(request_id, url = %options.url, method = ?options.method, "Executing request");
        let result = tokio::select! {
            biased;

            _ = token.cancelled() => Err(ManagerError::Cancelled),
            result = self.execute(&options) => result,
        };

        match &result {
            Ok(resp) => tracing::info!(request_id, status = resp.status, is_stream = resp.is_stream, "Request completed"),
            Err(e) => tracing::info!(request_id, error = %e, "Request failed"),
        }
        result
    }

    /// Abort an in-flight request. Best effort: the peer may still see it.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.in_flight.lookup(request_id) {
            Some(token) => {
                tracing::info!(request_id, "Cancelling request");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    async fn execute(&self, options: &HttpRequestOptions) -> Result<HttpResponse, ManagerError> {
        let start = Instant::now();
        let client = if options.ignore_ssl_errors {
            &self.insecure_client
        } else {
            &self.client
        };
        let timeout = options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let resp = build_request(client, options, timeout).send().await?;
        let status = resp.status();
        let headers = response_headers(resp.headers());
        let status_text = status.canonical_reason().unwrap_or("").to_string();

        if is_streaming(resp.headers()) {
            // Leave the body to the event-stream manager
            return Ok(HttpResponse {
                status: status.as_u16(),
                status_text,
                headers,
                body: None,
                size: 0,
                time_ms: start.elapsed().as_millis() as u64,
                is_stream: true,
            });
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ManagerError::Transport(format!("Error reading body: {}", e)))?;

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text,
            headers,
            body: Some(String::from_utf8_lossy(&bytes).into_owned()),
            size: bytes.len(),
            time_ms: start.elapsed().as_millis() as u64,
            is_stream: false,
        })
    }
}

#[async_trait]
impl ConnectionManager for HttpManager {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn connect(&self, _id: &str, _options: ConnectOptions) -> Result<(), ManagerError> {
        Err(ManagerError::unsupported(Protocol::Http, "connect"))
    }

    async fn send(&self, _id: &str, _payload: OutboundPayload) -> Result<(), ManagerError> {
        Err(ManagerError::unsupported(Protocol::Http, "send"))
    }

    async fn disconnect(&self, _id: &str) {}

    fn status(&self, _id: &str) -> ConnectionInfo {
        ConnectionInfo::absent(Protocol::Http)
    }

    async fn shutdown(&self) {
        for (id, token) in self.in_flight.remove_all() {
            tracing::info!(request_id = %id, "Cancelling request for shutdown");
            token.cancel();
        }
    }
}

/// Create an HTTP client for one-shot requests; timeouts are set per request
pub fn create_client(config: &Config, accept_invalid_certs: bool) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(config.connect_timeout())
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
