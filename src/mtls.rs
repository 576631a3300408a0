//! TLS contexts built from the current credentials
//!
//! [`TransportFactory`] turns whatever the [`CredentialStore`] holds right now
//! into rustls server and client configurations. Configs are cached per
//! credential generation, so a rotation is picked up by the next handshake
//! while handshakes already in progress keep the config they started with.
//!
//! Outbound connections verify the server's chain against the trust bundle
//! and require a SPIFFE ID from our trust domain, but do not match the
//! hostname: SPIFFE IDs are not DNS names. See [`VERIFIES_SERVER_HOSTNAME`].

use crate::error::{Error, Result};
use crate::spiffe_id::SpiffeId;
use crate::store::{CredentialStore, Credentials};
use crate::svid::spiffe_id_from_der;
use parking_lot::Mutex;
use rcgen::{CertificateParams, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig,
    SignatureScheme, SupportedProtocolVersion,
};
use std::fmt;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// Outbound verification never matches the server hostname.
pub const VERIFIES_SERVER_HOSTNAME: bool = false;

/// Protocol versions offered and accepted, TLS 1.3 only
pub static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// What to do when a server context is requested before any credential exists
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Serve TLS without client authentication (availability first)
    #[default]
    FailOpen,
    /// Refuse with [`Error::CredentialsNotInitialized`]
    FailClosed,
}

/// Server-side TLS context
#[derive(Clone)]
pub enum ServerContext {
    /// Client certificates required and verified against the trust bundle
    Mutual {
        /// rustls configuration
        config: Arc<ServerConfig>,
        /// Our own identity
        spiffe_id: SpiffeId,
        /// Credential generation the config was built from
        generation: u64,
    },
    /// Ephemeral self-signed certificate, no client authentication
    Insecure {
        /// rustls configuration
        config: Arc<ServerConfig>,
    },
}

impl ServerContext {
    /// The rustls configuration
    pub fn config(&self) -> Arc<ServerConfig> {
        match self {
            ServerContext::Mutual { config, .. } | ServerContext::Insecure { config } => {
                Arc::clone(config)
            }
        }
    }

    /// Whether peers must present a verified certificate
    pub fn is_mutual(&self) -> bool {
        matches!(self, ServerContext::Mutual { .. })
    }

    /// A tokio acceptor for this context
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config())
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerContext::Mutual {
                spiffe_id,
                generation,
                ..
            } => f
                .debug_struct("Mutual")
                .field("spiffe_id", spiffe_id)
                .field("generation", generation)
                .finish(),
            ServerContext::Insecure { .. } => f.write_str("Insecure"),
        }
    }
}

type GenerationCache<T> = Arc<Mutex<Option<(u64, Arc<T>)>>>;

/// Builds TLS contexts from the credential store
#[derive(Clone)]
pub struct TransportFactory {
    store: CredentialStore,
    policy: FallbackPolicy,
    provider: Arc<CryptoProvider>,
    server_cache: GenerationCache<ServerConfig>,
    client_cache: GenerationCache<ClientConfig>,
    insecure: Arc<Mutex<Option<Arc<ServerConfig>>>>,
}

impl TransportFactory {
    /// Create a factory reading `store`
    pub fn new(store: CredentialStore, policy: FallbackPolicy) -> Self {
        TransportFactory {
            store,
            policy,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            server_cache: Arc::default(),
            client_cache: Arc::default(),
            insecure: Arc::default(),
        }
    }

    /// The configured fallback policy
    pub fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    /// The store contexts are built from
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Server context for the next accepted connection.
    ///
    /// Mutual when credentials are ready. Otherwise [`ServerContext::Insecure`]
    /// under [`FallbackPolicy::FailOpen`], which the caller must log, or
    /// [`Error::CredentialsNotInitialized`] under [`FallbackPolicy::FailClosed`].
    pub fn server_context(&self) -> Result<ServerContext> {
        match self.store.get_current() {
            Some(creds) => Ok(ServerContext::Mutual {
                config: self.server_config_for(&creds)?,
                spiffe_id: creds.document().spiffe_id().clone(),
                generation: creds.generation(),
            }),
            None => match self.policy {
                FallbackPolicy::FailClosed => Err(Error::CredentialsNotInitialized),
                FallbackPolicy::FailOpen => Ok(ServerContext::Insecure {
                    config: self.insecure_config()?,
                }),
            },
        }
    }

    /// Client context presenting the current identity.
    ///
    /// Fails with [`Error::CredentialsNotInitialized`] before the first refresh.
    pub fn client_context(&self) -> Result<Arc<ClientConfig>> {
        let creds = self.store.require()?;
        self.client_config_for(&creds)
    }

    /// Mutual-TLS server config for a specific credential snapshot
    pub fn server_config_for(&self, creds: &Credentials) -> Result<Arc<ServerConfig>> {
        if let Some((generation, config)) = self.server_cache.lock().as_ref() {
            if *generation == creds.generation() {
                return Ok(Arc::clone(config));
            }
        }

        let material = creds.material();
        let verifier =
            WebPkiClientVerifier::builder_with_provider(material.roots(), Arc::clone(&self.provider))
                .build()
                .map_err(|e| Error::tls_error(format!("Failed to create client verifier: {e}")))?;

        let config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| Error::tls_error(format!("Unsupported protocol versions: {e}")))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(material.cert_chain(), material.private_key())
            .map_err(|e| Error::tls_error(format!("Failed to create server config: {e}")))?;
        let config = Arc::new(config);

        debug!(generation = creds.generation(), "Built mTLS server config");
        *self.server_cache.lock() = Some((creds.generation(), Arc::clone(&config)));
        Ok(config)
    }

    /// Client config for a specific credential snapshot
    pub fn client_config_for(&self, creds: &Credentials) -> Result<Arc<ClientConfig>> {
        if let Some((generation, config)) = self.client_cache.lock().as_ref() {
            if *generation == creds.generation() {
                return Ok(Arc::clone(config));
            }
        }

        let material = creds.material();
        let verifier = SpiffeServerVerifier {
            roots: material.roots(),
            trust_domain: creds.bundle().trust_domain().to_string(),
            algorithms: self.provider.signature_verification_algorithms,
        };

        let config = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| Error::tls_error(format!("Unsupported protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(material.cert_chain(), material.private_key())
            .map_err(|e| Error::tls_error(format!("Failed to create client config: {e}")))?;
        let config = Arc::new(config);

        debug!(generation = creds.generation(), "Built mTLS client config");
        *self.client_cache.lock() = Some((creds.generation(), Arc::clone(&config)));
        Ok(config)
    }

    fn insecure_config(&self) -> Result<Arc<ServerConfig>> {
        let mut cached = self.insecure.lock();
        if let Some(config) = cached.as_ref() {
            return Ok(Arc::clone(config));
        }

        let key = KeyPair::generate()
            .map_err(|e| Error::tls_error(format!("Failed to generate fallback key: {e}")))?;
        let cert = CertificateParams::new(vec!["localhost".to_string()])
            .and_then(|params| params.self_signed(&key))
            .map_err(|e| Error::tls_error(format!("Failed to generate fallback certificate: {e}")))?;

        let config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| Error::tls_error(format!("Unsupported protocol versions: {e}")))?
            .with_no_client_auth()
            .with_single_cert(
                vec![cert.der().clone()],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            )
            .map_err(|e| Error::tls_error(format!("Failed to create fallback config: {e}")))?;
        let config = Arc::new(config);

        info!("Generated ephemeral self-signed certificate for insecure fallback");
        *cached = Some(Arc::clone(&config));
        Ok(config)
    }
}

impl fmt::Debug for TransportFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportFactory")
            .field("policy", &self.policy)
            .field("ready", &self.store.is_ready())
            .finish()
    }
}

/// Verifies a server's chain against the trust bundle and requires a SPIFFE
/// ID in our trust domain. The server name is ignored.
#[derive(Debug)]
struct SpiffeServerVerifier {
    roots: Arc<RootCertStore>,
    trust_domain: String,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.algorithms.all,
        )?;

        let spiffe_id = match spiffe_id_from_der(end_entity.as_ref()) {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!("Server certificate carries no SPIFFE ID");
                return Err(CertificateError::ApplicationVerificationFailure.into());
            }
            Err(e) => {
                debug!(error = %e, "Server certificate SPIFFE ID unreadable");
                return Err(CertificateError::ApplicationVerificationFailure.into());
            }
        };

        if !spiffe_id.is_member_of(&self.trust_domain) {
            debug!(
                server = %spiffe_id,
                expected = %self.trust_domain,
                "Server identity outside our trust domain"
            );
            return Err(CertificateError::ApplicationVerificationFailure.into());
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dev::DevAuthority;
    use std::time::Duration;
    use tokio_rustls::TlsConnector;

    /// Accepts any server certificate; stands in for an unauthenticated client.
    #[derive(Debug)]
    pub(crate) struct AcceptAnyServer(WebPkiSupportedAlgorithms);

    impl ServerCertVerifier for AcceptAnyServer {
        fn verify_server_cert(
            &self,
            _: &CertificateDer<'_>,
            _: &[CertificateDer<'_>],
            _: &ServerName<'_>,
            _: &[u8],
            _: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.supported_schemes()
        }
    }

    pub(crate) fn anonymous_client() -> Arc<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let algorithms = provider.signature_verification_algorithms;
        Arc::new(
            ClientConfig::builder_with_provider(provider)
                .with_protocol_versions(PROTOCOL_VERSIONS)
                .unwrap()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServer(algorithms)))
                .with_no_client_auth(),
        )
    }

    /// Runs both handshake halves over an in-memory pipe.
    pub(crate) async fn handshake(
        server: Arc<ServerConfig>,
        client: Arc<ClientConfig>,
        server_name: &'static str,
    ) -> (
        std::io::Result<tokio_rustls::server::TlsStream<tokio::io::DuplexStream>>,
        std::io::Result<tokio_rustls::client::TlsStream<tokio::io::DuplexStream>>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let name = ServerName::try_from(server_name).unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(
                TlsAcceptor::from(server).accept(server_io),
                TlsConnector::from(client).connect(name, client_io)
            )
        })
        .await
        .unwrap()
    }

    fn ready_factory(
        authority: &DevAuthority,
        path: &str,
        policy: FallbackPolicy,
    ) -> TransportFactory {
        let store = CredentialStore::new();
        let id = SpiffeId::new(authority.trust_domain(), path).unwrap();
        store
            .replace(
                authority.issue(&id, Duration::from_secs(3600)).unwrap(),
                authority.bundle(),
            )
            .unwrap();
        TransportFactory::new(store, policy)
    }

    #[test]
    fn test_hostname_verification_is_relaxed() {
        assert!(!VERIFIES_SERVER_HOSTNAME);
    }

    #[tokio::test]
    async fn test_mutual_handshake_between_peers() {
        let authority = DevAuthority::new("example.org").unwrap();
        let server = ready_factory(&authority, "/svc-a", FallbackPolicy::FailOpen);
        let client = ready_factory(&authority, "/svc-b", FallbackPolicy::FailOpen);

        let ctx = server.server_context().unwrap();
        assert!(ctx.is_mutual());

        // The server name matches nothing in the certificate.
        let (s, c) = handshake(ctx.config(), client.client_context().unwrap(), "svc-a.invalid").await;
        let s = s.unwrap();
        c.unwrap();

        let peer = s.get_ref().1.peer_certificates().unwrap();
        let peer_id = spiffe_id_from_der(peer[0].as_ref()).unwrap().unwrap();
        assert_eq!(peer_id.as_str(), "spiffe://example.org/svc-b");
    }

    #[tokio::test]
    async fn test_mutual_server_rejects_client_without_certificate() {
        let authority = DevAuthority::new("example.org").unwrap();
        let server = ready_factory(&authority, "/svc-a", FallbackPolicy::FailOpen);

        let (s, _) = handshake(
            server.server_context().unwrap().config(),
            anonymous_client(),
            "localhost",
        )
        .await;
        assert!(s.is_err());
    }

    #[tokio::test]
    async fn test_client_rejects_server_from_other_authority() {
        let ours = DevAuthority::new("example.org").unwrap();
        let theirs = DevAuthority::new("example.org").unwrap();
        let server = ready_factory(&theirs, "/svc-a", FallbackPolicy::FailOpen);
        let client = ready_factory(&ours, "/svc-b", FallbackPolicy::FailOpen);

        let (_, c) = handshake(
            server.server_context().unwrap().config(),
            client.client_context().unwrap(),
            "localhost",
        )
        .await;
        assert!(c.is_err());
    }

    #[tokio::test]
    async fn test_not_ready_fail_open_serves_insecure() {
        let factory = TransportFactory::new(CredentialStore::new(), FallbackPolicy::FailOpen);
        let ctx = factory.server_context().unwrap();
        assert!(!ctx.is_mutual());

        let (s, c) = handshake(ctx.config(), anonymous_client(), "localhost").await;
        s.unwrap();
        c.unwrap();

        // Cached across calls.
        let again = factory.server_context().unwrap();
        assert!(Arc::ptr_eq(&ctx.config(), &again.config()));
    }

    #[test]
    fn test_not_ready_fail_closed_refuses() {
        let factory = TransportFactory::new(CredentialStore::new(), FallbackPolicy::FailClosed);
        assert!(matches!(
            factory.server_context(),
            Err(Error::CredentialsNotInitialized)
        ));
        assert!(matches!(
            factory.client_context(),
            Err(Error::CredentialsNotInitialized)
        ));
    }

    #[test]
    fn test_configs_rebuilt_per_generation() {
        let authority = DevAuthority::new("example.org").unwrap();
        let factory = ready_factory(&authority, "/svc-a", FallbackPolicy::FailOpen);

        let first = factory.server_context().unwrap().config();
        assert!(Arc::ptr_eq(&first, &factory.server_context().unwrap().config()));

        let id = SpiffeId::new("example.org", "/svc-a").unwrap();
        factory
            .store()
            .replace(
                authority.issue(&id, Duration::from_secs(3600)).unwrap(),
                authority.bundle(),
            )
            .unwrap();

        let second = factory.server_context().unwrap();
        assert!(!Arc::ptr_eq(&first, &second.config()));
        assert!(matches!(second, ServerContext::Mutual { generation: 2, .. }));
    }
}
