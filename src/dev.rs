//! In-process development identity agent
//!
//! Mints a throwaway CA and short-lived X.509-SVIDs with `rcgen`, so a
//! service (or a test) can run the full mTLS path without a SPIRE agent.
//! Keys live only in memory.

use crate::error::{Error, Result};
use crate::spiffe_id::SpiffeId;
use crate::svid::{CertChainSource, KeySource, X509Svid};
use crate::trust_bundle::{BundleSet, TrustBundle};
use crate::workload::IdentityAgent;
use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Default lifetime of a minted SVID
pub const DEFAULT_DEV_TTL: Duration = Duration::from_secs(3600);

const CA_LIFETIME_DAYS: i64 = 365;
const BACKDATE: time::Duration = time::Duration::minutes(1);

/// A self-signed signing authority for one trust domain
pub struct DevAuthority {
    trust_domain: String,
    ca_key: KeyPair,
    ca_cert: rcgen::Certificate,
}

impl DevAuthority {
    /// Generate a fresh CA for `trust_domain`
    pub fn new(trust_domain: impl Into<String>) -> Result<Self> {
        let trust_domain = trust_domain.into();
        let ca_key = KeyPair::generate().map_err(issue_error)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("dev CA {trust_domain}"));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.subject_alt_names = vec![uri_san(&format!("spiffe://{trust_domain}"))?];
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - BACKDATE;
        params.not_after = now + time::Duration::days(CA_LIFETIME_DAYS);

        let ca_cert = params.self_signed(&ca_key).map_err(issue_error)?;
        debug!(trust_domain = %trust_domain, "Generated development CA");

        Ok(DevAuthority {
            trust_domain,
            ca_key,
            ca_cert,
        })
    }

    /// Trust domain this authority signs for
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Bundle holding this authority's CA certificate
    pub fn bundle(&self) -> TrustBundle {
        TrustBundle::new(self.trust_domain.clone(), vec![self.ca_cert.der().to_vec()])
    }

    /// Mint an SVID for `spiffe_id` valid from one minute ago for `ttl`
    pub fn issue(&self, spiffe_id: &SpiffeId, ttl: Duration) -> Result<X509Svid> {
        if !spiffe_id.is_member_of(&self.trust_domain) {
            return Err(Error::invalid_identity(format!(
                "{} is outside trust domain {}",
                spiffe_id, self.trust_domain
            )));
        }

        let leaf_key = KeyPair::generate().map_err(issue_error)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, spiffe_id.path().trim_start_matches('/'));
        params.distinguished_name = dn;
        params.subject_alt_names = vec![uri_san(spiffe_id.as_str())?];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - BACKDATE;
        params.not_after = now + time::Duration::seconds(ttl.as_secs() as i64);

        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(issue_error)?;

        X509Svid::from_agent_parts(
            CertChainSource::Der(vec![leaf.der().to_vec()]),
            KeySource::Der(Zeroizing::new(leaf_key.serialize_der())),
        )
    }
}

fn uri_san(uri: &str) -> Result<SanType> {
    Ia5String::try_from(uri)
        .map(SanType::URI)
        .map_err(|e| Error::invalid_identity(format!("Invalid URI SAN '{uri}': {e}")))
}

fn issue_error(e: rcgen::Error) -> Error {
    Error::invalid_identity(format!("Development certificate generation failed: {e}"))
}

/// [`IdentityAgent`] backed by a [`DevAuthority`]
pub struct DevIdentityAgent {
    authority: Arc<DevAuthority>,
    spiffe_id: SpiffeId,
    ttl: Duration,
    unreachable: AtomicBool,
    fetches: AtomicUsize,
}

impl DevIdentityAgent {
    /// Agent issuing `spiffe_id` from a shared authority
    pub fn new(authority: Arc<DevAuthority>, spiffe_id: SpiffeId) -> Self {
        DevIdentityAgent {
            authority,
            spiffe_id,
            ttl: DEFAULT_DEV_TTL,
            unreachable: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Agent with its own freshly generated authority
    pub fn standalone(spiffe_id: SpiffeId) -> Result<Self> {
        let authority = Arc::new(DevAuthority::new(spiffe_id.trust_domain())?);
        Ok(Self::new(authority, spiffe_id))
    }

    /// Set the lifetime of issued SVIDs
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Make every fetch fail as if the agent socket were gone
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of `fetch_identity` calls seen so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// The signing authority
    pub fn authority(&self) -> &Arc<DevAuthority> {
        &self.authority
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            warn!("Development identity agent is set unreachable");
            return Err(Error::agent_error("development agent unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityAgent for DevIdentityAgent {
    async fn fetch_identity(&self) -> Result<X509Svid> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        self.authority.issue(&self.spiffe_id, self.ttl)
    }

    async fn fetch_trust_bundle(&self) -> Result<BundleSet> {
        self.check_reachable()?;
        Ok(BundleSet::from(self.authority.bundle()))
    }
}
