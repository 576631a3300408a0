//! Outbound calls to other services
//!
//! [`OutboundClient::call`] posts JSON under the current identity and returns
//! whatever the peer answered. It never retries: a failed call is reported
//! once, classified by [`TransportErrorKind`], and the caller decides what to
//! do next.

use crate::error::{Error, Result, TransportErrorKind};
use crate::mtls::{FallbackPolicy, TransportFactory};
use parking_lot::Mutex;
use rustls::ClientConfig;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const DEFAULT_NAMESPACE: &str = "security-training";
const DEFAULT_HOST: &str = "localhost";
const UNKNOWN_SERVICE_PORT: u16 = 80;

/// A peer's answer. Non-2xx statuses are returned here, not as errors.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Decoded JSON body; a non-JSON body is kept as a string, an empty one is null
    pub body: Value,
}

impl Response {
    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum HostResolution {
    Kubernetes { namespace: String },
    Fixed(String),
}

/// Maps logical service names to base URLs
#[derive(Clone, Debug)]
pub struct ServiceDirectory {
    ports: HashMap<String, u16>,
    hosts: HostResolution,
}

impl Default for ServiceDirectory {
    fn default() -> Self {
        Self::with_host(DEFAULT_HOST)
    }
}

impl ServiceDirectory {
    /// Resolve every service to `host`
    pub fn with_host(host: impl Into<String>) -> Self {
        ServiceDirectory {
            ports: default_ports(),
            hosts: HostResolution::Fixed(host.into()),
        }
    }

    /// Resolve through cluster DNS in `namespace`
    pub fn kubernetes(namespace: impl Into<String>) -> Self {
        ServiceDirectory {
            ports: default_ports(),
            hosts: HostResolution::Kubernetes {
                namespace: namespace.into(),
            },
        }
    }

    /// Cluster DNS when running in a pod, `SERVICE_HOST` otherwise
    pub fn from_env() -> Self {
        if Path::new(SERVICE_ACCOUNT_DIR).exists() {
            let namespace =
                std::env::var("K8S_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
            Self::kubernetes(namespace)
        } else {
            let host = std::env::var("SERVICE_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
            Self::with_host(host)
        }
    }

    /// Add or override one service's port
    pub fn with_port(mut self, service: impl Into<String>, port: u16) -> Self {
        self.ports.insert(service.into(), port);
        self
    }

    /// Port for `service`; unknown services get port 80
    pub fn port(&self, service: &str) -> u16 {
        self.ports
            .get(service)
            .copied()
            .unwrap_or(UNKNOWN_SERVICE_PORT)
    }

    /// Host for `service`
    pub fn host(&self, service: &str) -> String {
        match &self.hosts {
            HostResolution::Kubernetes { namespace } => {
                format!("{service}-svc.{namespace}.svc.cluster.local")
            }
            HostResolution::Fixed(host) => host.clone(),
        }
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self, service: &str, https: bool) -> String {
        let scheme = if https { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host(service), self.port(service))
    }
}

fn default_ports() -> HashMap<String, u16> {
    [
        ("risk-scorer", 8510),
        ("training-recommender", 8511),
        ("llm-gateway", 8520),
        ("git-collector", 8501),
    ]
    .into_iter()
    .map(|(name, port)| (name.to_string(), port))
    .collect()
}

/// Makes authenticated requests to peer services
#[derive(Clone)]
pub struct OutboundClient {
    factory: TransportFactory,
    directory: ServiceDirectory,
    default_timeout: Duration,
    cached: Arc<Mutex<Option<(Arc<ClientConfig>, reqwest::Client)>>>,
}

impl OutboundClient {
    /// Create a client drawing TLS material from `factory`
    pub fn new(factory: TransportFactory, directory: ServiceDirectory, default_timeout: Duration) -> Self {
        OutboundClient {
            factory,
            directory,
            default_timeout,
            cached: Arc::default(),
        }
    }

    /// The service directory
    pub fn directory(&self) -> &ServiceDirectory {
        &self.directory
    }

    /// Deadline used by [`OutboundClient::post_service`]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// POST `payload` as JSON to `url` over mutual TLS.
    ///
    /// Fails with [`Error::CredentialsNotInitialized`] before the first
    /// refresh. Transport failures come back as [`Error::Transport`]; the
    /// request is attempted exactly once.
    pub async fn call(&self, url: &str, payload: &Value, timeout: Duration) -> Result<Response> {
        let client = self.mtls_client()?;
        send(client.post(url).json(payload), url, timeout).await
    }

    /// GET `url` over mutual TLS
    pub async fn get(&self, url: &str, timeout: Duration) -> Result<Response> {
        let client = self.mtls_client()?;
        send(client.get(url), url, timeout).await
    }

    /// POST to `path` on a named service, resolved through the directory.
    ///
    /// Before the first refresh, and only under [`FallbackPolicy::FailOpen`],
    /// the call goes out over plain HTTP instead.
    pub async fn post_service(&self, service: &str, path: &str, payload: &Value) -> Result<Response> {
        if self.factory.store().is_ready() {
            let url = format!("{}{}", self.directory.base_url(service, true), path);
            return self.call(&url, payload, self.default_timeout).await;
        }

        if self.factory.policy() == FallbackPolicy::FailClosed {
            return Err(Error::CredentialsNotInitialized);
        }

        let url = format!("{}{}", self.directory.base_url(service, false), path);
        warn!(url = %url, "Credentials not ready; calling peer over plain HTTP");
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::transport(TransportErrorKind::Other, e.to_string()))?;
        send(client.post(&url).json(payload), &url, self.default_timeout).await
    }

    fn mtls_client(&self) -> Result<reqwest::Client> {
        let config = self.factory.client_context()?;

        let mut cached = self.cached.lock();
        if let Some((built_from, client)) = cached.as_ref() {
            if Arc::ptr_eq(built_from, &config) {
                return Ok(client.clone());
            }
        }

        let client = reqwest::Client::builder()
            .use_preconfigured_tls((*config).clone())
            .build()
            .map_err(|e| Error::tls_error(format!("Failed to create HTTP client: {e}")))?;
        debug!("Built outbound HTTP client for new credentials");
        *cached = Some((config, client.clone()));
        Ok(client)
    }
}

impl std::fmt::Debug for OutboundClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundClient")
            .field("directory", &self.directory)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

async fn send(request: reqwest::RequestBuilder, url: &str, timeout: Duration) -> Result<Response> {
    let exchange = async {
        let response = request.timeout(timeout).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok::<_, reqwest::Error>((status, body))
    };

    let (status, body) = match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => {
            let kind = classify(&e);
            warn!(url = %url, kind = %kind, error = %e, "Outbound call failed");
            return Err(Error::transport(kind, error_chain(&e)));
        }
        Err(_) => {
            warn!(url = %url, timeout_ms = timeout.as_millis() as u64, "Outbound call timed out");
            return Err(Error::transport(
                TransportErrorKind::Timeout,
                format!("no response within {timeout:?}"),
            ));
        }
    };

    debug!(url = %url, status, "Outbound call completed");
    Ok(Response {
        status,
        body: decode_body(&body),
    })
}

fn decode_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Classify a failed request by walking its error chain
pub(crate) fn classify(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        return TransportErrorKind::Timeout;
    }

    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(e) = source {
        if e.is::<rustls::Error>() {
            return TransportErrorKind::Handshake;
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => return TransportErrorKind::Refused,
                std::io::ErrorKind::TimedOut => return TransportErrorKind::Timeout,
                _ => {}
            }
            // io::Error::source() skips the wrapped error
            if io.get_ref().is_some_and(|inner| inner.is::<rustls::Error>()) {
                return TransportErrorKind::Handshake;
            }
        }
        source = e.source();
    }

    TransportErrorKind::Other
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    message
}
