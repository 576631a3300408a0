//! The generic service runtime
//!
//! Accepts connections (mutual TLS when credentials are ready), authorizes
//! each request and hands the decoded JSON body to a single
//! [`RequestHandler`]. `GET /health` is answered by the runtime itself and
//! bypasses the allow-list.
//!
//! Lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`.

use crate::authz::extract_peer_id;
use crate::context::MeshContext;
use crate::error::{Error, Result};
use crate::mtls::ServerContext;
use crate::spiffe_id::SpiffeId;
use async_trait::async_trait;
use futures::FutureExt;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Liveness probe path
pub const HEALTH_PATH: &str = "/health";

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type HttpResponse = hyper::Response<Full<Bytes>>;

/// Business logic of one concrete service
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle a `POST` to `path`.
    ///
    /// `peer_id` is the caller's verified identity, absent when none was
    /// presented. An error becomes a 500 response carrying its message.
    async fn handle(
        &self,
        path: &str,
        data: Map<String, Value>,
        peer_id: Option<&SpiffeId>,
    ) -> anyhow::Result<Map<String, Value>>;
}

/// Runtime lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeState {
    /// Not serving
    Stopped,
    /// Binding and preparing TLS
    Starting,
    /// Accepting connections
    Running,
    /// Draining connections after a shutdown signal
    Stopping,
}

/// How accepted connections are wrapped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    /// TLS on every connection, mutual whenever credentials are ready
    Tls,
    /// Plain HTTP; no peer identity is ever available
    Plaintext,
}

/// Body of `GET /health`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// `healthy` with credentials, `degraded` without
    pub status: String,
    /// Configured service name
    pub service_name: String,
    /// Own SPIFFE ID, `unknown` before the first refresh
    pub spiffe_id: String,
    /// Whether new connections are required to present a client certificate
    pub mtls: bool,
}

/// Serves one service's HTTPS surface
pub struct ServiceRuntime {
    ctx: MeshContext,
    handler: Arc<dyn RequestHandler>,
    state: watch::Sender<RuntimeState>,
    mode: Mutex<TransportMode>,
    last_mutual: Mutex<Option<bool>>,
}

impl ServiceRuntime {
    /// Create a stopped runtime
    pub fn new(ctx: MeshContext, handler: Arc<dyn RequestHandler>) -> Self {
        let mode = if ctx.config().tls_enabled {
            TransportMode::Tls
        } else {
            TransportMode::Plaintext
        };
        let (state, _) = watch::channel(RuntimeState::Stopped);
        ServiceRuntime {
            ctx,
            handler,
            state,
            mode: Mutex::new(mode),
            last_mutual: Mutex::new(None),
        }
    }

    /// The service context
    pub fn context(&self) -> &MeshContext {
        &self.ctx
    }

    /// Current lifecycle state
    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<RuntimeState> {
        self.state.subscribe()
    }

    /// Current transport mode
    pub fn transport_mode(&self) -> TransportMode {
        *self.mode.lock()
    }

    fn set_state(&self, next: RuntimeState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Runtime state changed");
        }
    }

    /// Startup refresh, bind, then serve until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.set_state(RuntimeState::Starting);
        self.ctx.bootstrap().await;
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Bind the configured address. Failure leaves the runtime stopped.
    pub async fn bind(&self) -> Result<TcpListener> {
        self.set_state(RuntimeState::Starting);
        let addr = self.ctx.config().listen_addr();
        match TcpListener::bind(addr).await {
            Ok(listener) => Ok(listener),
            Err(source) => {
                self.set_state(RuntimeState::Stopped);
                error!(addr = %addr, error = %source, "Failed to bind listener");
                Err(Error::Bind {
                    addr: addr.to_string(),
                    source,
                })
            }
        }
    }

    /// Serve `listener` until `shutdown` fires.
    ///
    /// Starts the background refresher, and on shutdown drains open
    /// connections and joins it before returning.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        self.set_state(RuntimeState::Starting);
        self.prepare_transport();

        let refresher = self.ctx.refresher().spawn(shutdown.child_token());
        let tracker = TaskTracker::new();

        let local = listener.local_addr()?;
        self.set_state(RuntimeState::Running);
        info!(
            service = %self.ctx.config().service_name,
            addr = %local,
            mode = ?self.transport_mode(),
            "Service listening"
        );

        loop {
            let (stream, remote) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let this = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tracker.spawn(async move { this.handle_connection(stream, remote, shutdown).await });
        }

        self.set_state(RuntimeState::Stopping);
        drop(listener);
        tracker.close();
        tracker.wait().await;
        if let Err(e) = refresher.await {
            error!(error = %e, "Background refresh task ended abnormally");
        }

        self.set_state(RuntimeState::Stopped);
        info!(service = %self.ctx.config().service_name, "Service stopped");
        Ok(())
    }

    /// Try the TLS wrap once at startup; degrade to plaintext if it cannot be built.
    fn prepare_transport(&self) {
        if !self.ctx.config().tls_enabled {
            *self.mode.lock() = TransportMode::Plaintext;
            error!("TLS disabled by configuration; serving plaintext HTTP without peer authentication");
            return;
        }

        match self.ctx.transport().server_context() {
            Ok(_) => *self.mode.lock() = TransportMode::Tls,
            Err(Error::CredentialsNotInitialized) => {
                *self.mode.lock() = TransportMode::Tls;
                warn!("Credentials not initialized and fallback is fail-closed; connections are refused until a refresh succeeds");
            }
            Err(e) => {
                *self.mode.lock() = TransportMode::Plaintext;
                error!(error = %e, "Failed to build TLS context; serving plaintext HTTP without peer authentication");
            }
        }
    }

    fn note_posture(&self, context: &ServerContext) {
        let mutual = context.is_mutual();
        let mut last = self.last_mutual.lock();
        if *last == Some(mutual) {
            return;
        }
        *last = Some(mutual);

        match context {
            ServerContext::Mutual {
                spiffe_id,
                generation,
                ..
            } => info!(spiffe_id = %spiffe_id, generation, "Mutual TLS enforced for new connections"),
            ServerContext::Insecure { .. } => warn!(
                "INSECURE: credentials not ready, serving TLS without client authentication"
            ),
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr, shutdown: CancellationToken) {
        if self.transport_mode() == TransportMode::Plaintext {
            self.serve_http(TokioIo::new(stream), None, shutdown).await;
            return;
        }

        let context = match self.ctx.transport().server_context() {
            Ok(context) => context,
            Err(e) => {
                warn!(remote = %remote, error = %e, "Refusing connection");
                return;
            }
        };
        self.note_posture(&context);

        let tls = match tokio::time::timeout(HANDSHAKE_TIMEOUT, context.acceptor().accept(stream)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                warn!(remote = %remote, error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                warn!(remote = %remote, "TLS handshake timed out");
                return;
            }
        };

        let peer_id = if context.is_mutual() {
            extract_peer_id(tls.get_ref().1)
        } else {
            None
        };
        debug!(remote = %remote, peer_id = ?peer_id.as_ref().map(SpiffeId::as_str), "Connection accepted");

        self.serve_http(TokioIo::new(tls), peer_id, shutdown).await;
    }

    async fn serve_http<I>(self: Arc<Self>, io: I, peer_id: Option<SpiffeId>, shutdown: CancellationToken)
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let peer_id = Arc::new(peer_id);
        let this = Arc::clone(&self);
        let service = service_fn(move |req| {
            let this = Arc::clone(&this);
            let peer_id = Arc::clone(&peer_id);
            async move { Ok::<_, Infallible>(this.dispatch(req, peer_id.as_ref().as_ref()).await) }
        });

        let conn = http1::Builder::new().serve_connection(io, service);
        tokio::pin!(conn);

        let outcome = tokio::select! {
            res = conn.as_mut() => res,
            _ = shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        if let Err(e) = outcome {
            debug!(error = %e, "Connection closed with error");
        }
    }

    async fn dispatch(&self, req: Request<Incoming>, peer_id: Option<&SpiffeId>) -> HttpResponse {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        if path == HEALTH_PATH && method == Method::GET {
            return json_response(StatusCode::OK, &self.health());
        }

        match method {
            Method::POST => match self.process(req, &path, peer_id).await {
                Ok(body) => json_response(StatusCode::OK, &Value::Object(body)),
                Err(e) => error_response(&path, e),
            },
            Method::GET => json_response(StatusCode::NOT_FOUND, &json!({ "error": "Not found" })),
            _ => json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &json!({ "error": "Method not allowed" }),
            ),
        }
    }

    async fn process(
        &self,
        req: Request<Incoming>,
        path: &str,
        peer_id: Option<&SpiffeId>,
    ) -> Result<Map<String, Value>> {
        let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
            .collect()
            .await
            .map_err(|e| Error::MalformedRequest(format!("unreadable request body: {e}")))?
            .to_bytes();
        let data = parse_body(&body)?;

        let peer_id = self.ctx.authorizer().authorize(peer_id).into_result()?;
        self.invoke(path, data, peer_id.as_ref()).await
    }

    async fn invoke(
        &self,
        path: &str,
        data: Map<String, Value>,
        peer_id: Option<&SpiffeId>,
    ) -> Result<Map<String, Value>> {
        let peer = peer_id.map(SpiffeId::as_str).unwrap_or("none");
        match AssertUnwindSafe(self.handler.handle(path, data, peer_id))
            .catch_unwind()
            .await
        {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => {
                error!(path, peer_id = peer, error = %format!("{e:#}"), "Request handler failed");
                Err(Error::CallbackFailure(e.to_string()))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                error!(path, peer_id = peer, panic = %message, "Request handler panicked");
                Err(Error::CallbackFailure("request handler panicked".into()))
            }
        }
    }

    /// Current health snapshot
    pub fn health(&self) -> HealthReport {
        let creds = self.ctx.store().get_current();
        let mtls = self.transport_mode() == TransportMode::Tls && creds.is_some();
        HealthReport {
            status: if creds.is_some() { "healthy" } else { "degraded" }.to_string(),
            service_name: self.ctx.config().service_name.clone(),
            spiffe_id: creds
                .map(|c| c.document().spiffe_id().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            mtls,
        }
    }
}

impl fmt::Debug for ServiceRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRuntime")
            .field("service", &self.ctx.config().service_name)
            .field("state", &self.state())
            .field("mode", &self.transport_mode())
            .finish()
    }
}

/// Decode a request body. Empty means `{}`; anything but a JSON object is rejected.
fn parse_body(body: &[u8]) -> Result<Map<String, Value>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::MalformedRequest("request body must be a JSON object".into())),
        Err(e) => Err(Error::MalformedRequest(format!("invalid JSON: {e}"))),
    }
}

fn error_response(path: &str, err: Error) -> HttpResponse {
    let status = err.status_code();
    let body = match &err {
        Error::Unauthorized { peer_id } => json!({
            "error": err.to_string(),
            "peer_id": peer_id.as_deref().unwrap_or("none"),
        }),
        Error::MalformedRequest(_) => {
            warn!(path, error = %err, "Rejected malformed request");
            json!({ "error": err.to_string() })
        }
        _ => json!({ "error": err.to_string() }),
    };
    json_response(status, &body)
}

fn json_response(status: StatusCode, body: &impl Serialize) -> HttpResponse {
    let (status, bytes) = match serde_json::to_vec(body) {
        Ok(bytes) => (status, bytes),
        Err(e) => {
            error!(error = %e, "Failed to encode response body");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                br#"{"error":"response encoding failed"}"#.to_vec(),
            )
        }
    };

    let mut response = hyper::Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ServiceDirectory;
    use crate::config::ServiceConfig;
    use crate::dev::DevIdentityAgent;

    struct Scripted;

    #[async_trait]
    impl RequestHandler for Scripted {
        async fn handle(
            &self,
            path: &str,
            data: Map<String, Value>,
            _peer_id: Option<&SpiffeId>,
        ) -> anyhow::Result<Map<String, Value>> {
            match path {
                "/fail" => anyhow::bail!("database offline"),
                "/panic" => panic!("handler bug"),
                _ => Ok(data),
            }
        }
    }

    fn runtime() -> ServiceRuntime {
        let agent = DevIdentityAgent::standalone(
            SpiffeId::parse("spiffe://example.org/svc-a").unwrap(),
        )
        .unwrap();
        let mut config = ServiceConfig::new("svc-a");
        config.trust_domain = "example.org".into();
        let ctx = MeshContext::with_directory(config, Arc::new(agent), ServiceDirectory::default())
            .unwrap();
        ServiceRuntime::new(ctx, Arc::new(Scripted))
    }

    #[test]
    fn test_parse_body() {
        assert!(parse_body(b"").unwrap().is_empty());
        assert!(parse_body(b"  \n").unwrap().is_empty());
        assert_eq!(parse_body(br#"{"a":1}"#).unwrap()["a"], json!(1));

        assert!(matches!(parse_body(b"{not json"), Err(Error::MalformedRequest(_))));
        assert!(matches!(parse_body(b"[1,2]"), Err(Error::MalformedRequest(_))));
    }

    #[tokio::test]
    async fn test_invoke_maps_failures() {
        let rt = runtime();

        let mut data = Map::new();
        data.insert("k".into(), json!("v"));
        assert_eq!(rt.invoke("/echo", data.clone(), None).await.unwrap(), data);

        let err = rt.invoke("/fail", Map::new(), None).await.unwrap_err();
        assert!(matches!(&err, Error::CallbackFailure(m) if m == "database offline"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let err = rt.invoke("/panic", Map::new(), None).await.unwrap_err();
        assert!(matches!(err, Error::CallbackFailure(_)));
    }

    #[tokio::test]
    async fn test_health_tracks_credentials() {
        let rt = runtime();
        assert_eq!(rt.state(), RuntimeState::Stopped);

        let report = rt.health();
        assert_eq!(report.status, "degraded");
        assert_eq!(report.spiffe_id, "unknown");
        assert!(!report.mtls);

        assert!(rt.context().bootstrap().await);
        let report = rt.health();
        assert_eq!(report.status, "healthy");
        assert_eq!(report.service_name, "svc-a");
        assert_eq!(report.spiffe_id, "spiffe://example.org/svc-a");
        assert!(report.mtls);
    }

    #[test]
    fn test_error_response_includes_rejected_peer() {
        let response = error_response(
            "/x",
            Error::Unauthorized {
                peer_id: Some("spiffe://example.org/evil".into()),
            },
        );
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
