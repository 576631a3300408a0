//! Trust bundle management for SPIFFE

use crate::error::{Error, Result};
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use std::collections::HashMap;
use tracing::debug;

/// Trust bundle containing root certificates for a trust domain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustBundle {
    /// Trust domain this bundle belongs to
    trust_domain: String,
    /// Root CA certificates (DER encoded)
    authorities: Vec<Vec<u8>>,
}

impl TrustBundle {
    /// Create a new trust bundle
    pub fn new(trust_domain: impl Into<String>, authorities: Vec<Vec<u8>>) -> Self {
        TrustBundle {
            trust_domain: trust_domain.into(),
            authorities,
        }
    }

    /// Get the trust domain
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Get the root certificates
    pub fn authorities(&self) -> &[Vec<u8>] {
        &self.authorities
    }

    /// Validate the trust bundle
    pub fn validate(&self) -> Result<()> {
        if self.trust_domain.is_empty() {
            return Err(Error::TrustBundleError(
                "Trust domain cannot be empty".into(),
            ));
        }

        if self.authorities.is_empty() {
            return Err(Error::TrustBundleError(
                "Trust bundle must contain at least one certificate".into(),
            ));
        }

        for (i, cert) in self.authorities.iter().enumerate() {
            if cert.is_empty() {
                return Err(Error::TrustBundleError(format!(
                    "Certificate {} is empty",
                    i
                )));
            }
        }

        Ok(())
    }

    /// Build a rustls root store holding every authority of this bundle
    pub fn root_store(&self) -> Result<RootCertStore> {
        self.validate()?;

        let mut roots = RootCertStore::empty();
        for der in &self.authorities {
            roots
                .add(CertificateDer::from(der.clone()))
                .map_err(|e| Error::TrustBundleError(format!("Failed to add root certificate: {e}")))?;
        }

        debug!(
            trust_domain = %self.trust_domain,
            "Added {} certificates to root store",
            roots.len()
        );
        Ok(roots)
    }
}

/// Bundles returned by an identity agent, keyed by trust domain
#[derive(Clone, Debug, Default)]
pub struct BundleSet {
    bundles: HashMap<String, TrustBundle>,
}

impl BundleSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the bundle for its trust domain
    pub fn insert(&mut self, bundle: TrustBundle) {
        self.bundles.insert(bundle.trust_domain().to_string(), bundle);
    }

    /// Get a trust bundle for a domain
    pub fn get(&self, trust_domain: &str) -> Option<&TrustBundle> {
        self.bundles.get(trust_domain)
    }

    /// Pick the bundle for `preferred`, falling back to `fallback`
    pub fn select(&self, preferred: &str, fallback: &str) -> Result<TrustBundle> {
        self.get(preferred)
            .or_else(|| self.get(fallback))
            .cloned()
            .ok_or_else(|| {
                Error::TrustBundleError(format!(
                    "No trust bundle for {} (agent returned: {:?})",
                    preferred,
                    self.domains()
                ))
            })
    }

    /// Get all trust domains, sorted
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.bundles.keys().cloned().collect();
        domains.sort();
        domains
    }

    /// Number of bundles
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// Whether the set holds no bundles
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

impl From<TrustBundle> for BundleSet {
    fn from(bundle: TrustBundle) -> Self {
        let mut set = BundleSet::new();
        set.insert(bundle);
        set
    }
}
