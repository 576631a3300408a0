//! Process-wide credential store
//!
//! Holds the current identity document and trust bundle behind an
//! [`ArcSwapOption`]. Readers take a lock-free snapshot; the refresher swaps
//! in a fully built [`Credentials`] value in one store, so no reader can see
//! a certificate without its key or a key from another generation.

use crate::error::{Error, Result};
use crate::svid::X509Svid;
use crate::trust_bundle::TrustBundle;
use arc_swap::ArcSwapOption;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// In-memory material in the form rustls consumes.
///
/// Built fresh on every replace and dropped with its [`Credentials`]; nothing
/// is written to disk. The key is held zeroizing and only turned into a
/// rustls key type when a config is built; that copy belongs to rustls.
pub struct TlsMaterial {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: Zeroizing<Vec<u8>>,
    roots: Arc<RootCertStore>,
}

impl TlsMaterial {
    fn build(document: &X509Svid, bundle: &TrustBundle) -> Result<Self> {
        let cert_chain = document
            .cert_chain()
            .iter()
            .map(|der| CertificateDer::from(der.clone()))
            .collect();
        let private_key = Zeroizing::new(document.private_key().to_vec());
        let roots = Arc::new(bundle.root_store()?);

        Ok(TlsMaterial {
            cert_chain,
            private_key,
            roots,
        })
    }

    /// Certificate chain, leaf first
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        self.cert_chain.clone()
    }

    /// A fresh copy of the private key for a rustls config builder
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.private_key.to_vec()))
    }

    /// Trust anchors for peer verification
    pub fn roots(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.roots)
    }
}

/// One generation of credentials
pub struct Credentials {
    document: X509Svid,
    bundle: TrustBundle,
    material: TlsMaterial,
    generation: u64,
}

impl Credentials {
    /// The identity document
    pub fn document(&self) -> &X509Svid {
        &self.document
    }

    /// The trust bundle used to verify peers
    pub fn bundle(&self) -> &TrustBundle {
        &self.bundle
    }

    /// Materialized TLS inputs
    pub fn material(&self) -> &TlsMaterial {
        &self.material
    }

    /// Monotonic generation counter, starting at 1
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("spiffe_id", self.document.spiffe_id())
            .field("trust_domain", &self.bundle.trust_domain())
            .field("generation", &self.generation)
            .field("not_after", &self.document.not_after())
            .finish()
    }
}

/// Shared handle to the current credentials
#[derive(Clone, Default)]
pub struct CredentialStore {
    current: Arc<ArcSwapOption<Credentials>>,
    generation: Arc<AtomicU64>,
}

impl CredentialStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current credentials, or `None` before the first successful refresh.
    ///
    /// Never blocks.
    pub fn get_current(&self) -> Option<Arc<Credentials>> {
        self.current.load_full()
    }

    /// Current credentials or [`Error::CredentialsNotInitialized`]
    pub fn require(&self) -> Result<Arc<Credentials>> {
        self.get_current().ok_or(Error::CredentialsNotInitialized)
    }

    /// Whether a refresh has ever succeeded
    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }

    /// Validate and materialize new credentials, then publish them.
    ///
    /// On error the previously visible credentials stay in place. Returns the
    /// new generation number.
    pub fn replace(&self, document: X509Svid, bundle: TrustBundle) -> Result<u64> {
        document.validate()?;
        let material = TlsMaterial::build(&document, &bundle)?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let spiffe_id = document.spiffe_id().to_string();
        let not_after = document.not_after();

        let previous = self.current.swap(Some(Arc::new(Credentials {
            document,
            bundle,
            material,
            generation,
        })));

        if let Some(previous) = previous {
            debug!(
                previous_generation = previous.generation,
                "Superseded credentials released to remaining readers"
            );
        }
        info!(
            spiffe_id = %spiffe_id,
            generation,
            %not_after,
            "Installed new credentials"
        );

        Ok(generation)
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("current", &self.get_current())
            .finish()
    }
}
