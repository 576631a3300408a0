//! X.509 SPIFFE Verifiable Identity Documents (X.509-SVIDs)
//!
//! [`X509Svid`] is the single canonical identity document shape used by the
//! rest of the crate. Whatever an identity agent hands back (PEM text, DER
//! blobs, a chain or a lone leaf) goes through [`X509Svid::from_agent_parts`]
//! exactly once, at the agent boundary.

use crate::error::{Error, Result};
use crate::spiffe_id::SpiffeId;
use chrono::{DateTime, Utc};
use std::fmt;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;
use zeroize::Zeroizing;

/// Certificate chain as handed over by an identity agent
#[derive(Clone, Debug)]
pub enum CertChainSource {
    /// One or more concatenated `CERTIFICATE` PEM blocks, leaf first
    Pem(String),
    /// DER certificates, leaf first
    Der(Vec<Vec<u8>>),
}

/// Private key as handed over by an identity agent (PKCS#8)
pub enum KeySource {
    /// A `PRIVATE KEY` PEM block
    Pem(Zeroizing<String>),
    /// PKCS#8 DER bytes
    Der(Zeroizing<Vec<u8>>),
}

/// X.509 SVID for mTLS authentication
#[derive(Clone)]
pub struct X509Svid {
    /// The SPIFFE ID carried in the leaf certificate
    spiffe_id: SpiffeId,
    /// X.509 certificate chain (DER encoded, leaf first)
    cert_chain: Vec<Vec<u8>>,
    /// PKCS#8 private key, wiped on drop
    private_key: Zeroizing<Vec<u8>>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    serial_number: String,
}

impl X509Svid {
    /// Normalize raw agent output into an identity document.
    ///
    /// The SPIFFE ID and validity window are read from the leaf certificate.
    /// Fails with [`Error::InvalidIdentity`] when the chain is empty, the leaf
    /// carries no SPIFFE URI SAN, or the key does not match the leaf.
    pub fn from_agent_parts(chain: CertChainSource, key: KeySource) -> Result<Self> {
        let cert_chain = match chain {
            CertChainSource::Der(ders) => ders,
            CertChainSource::Pem(pem) => parse_pem_chain(&pem)?,
        };
        if cert_chain.is_empty() || cert_chain.iter().any(|c| c.is_empty()) {
            return Err(Error::invalid_identity("Certificate chain cannot be empty"));
        }

        let private_key = match key {
            KeySource::Der(der) => der,
            KeySource::Pem(pem) => parse_pem_key(&pem)?,
        };
        if private_key.is_empty() {
            return Err(Error::invalid_identity("Private key cannot be empty"));
        }

        let leaf = LeafInfo::parse(&cert_chain[0])?;
        check_key_matches(&private_key, &leaf.public_key)?;

        Ok(X509Svid {
            spiffe_id: leaf.spiffe_id,
            cert_chain,
            private_key,
            not_before: leaf.not_before,
            not_after: leaf.not_after,
            serial_number: leaf.serial_number,
        })
    }

    /// Get the SPIFFE ID
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Get the certificate chain
    pub fn cert_chain(&self) -> &[Vec<u8>] {
        &self.cert_chain
    }

    /// Get the leaf certificate
    pub fn leaf_cert(&self) -> &[u8] {
        // from_agent_parts guarantees a non-empty chain
        &self.cert_chain[0]
    }

    /// Get the PKCS#8 private key
    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    /// Start of the validity window
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of the validity window
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Length of the validity window
    pub fn validity_window(&self) -> chrono::Duration {
        self.not_after - self.not_before
    }

    /// Get the serial number (hex)
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// Check if the SVID has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.not_after
    }

    /// Validate the SVID against the current time
    pub fn validate(&self) -> Result<()> {
        if self.is_expired() {
            return Err(Error::invalid_identity(format!(
                "SVID for {} expired at {}",
                self.spiffe_id, self.not_after
            )));
        }
        if Utc::now() < self.not_before {
            return Err(Error::invalid_identity(format!(
                "SVID for {} is not valid before {}",
                self.spiffe_id, self.not_before
            )));
        }
        Ok(())
    }

    /// Re-check that the private key belongs to the leaf certificate
    pub fn key_matches_leaf(&self) -> bool {
        LeafInfo::parse(self.leaf_cert())
            .and_then(|leaf| check_key_matches(&self.private_key, &leaf.public_key))
            .is_ok()
    }
}

impl fmt::Debug for X509Svid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509Svid")
            .field("spiffe_id", &self.spiffe_id)
            .field("chain_len", &self.cert_chain.len())
            .field("private_key", &"<redacted>")
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("serial_number", &self.serial_number)
            .finish()
    }
}

struct LeafInfo {
    spiffe_id: SpiffeId,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    serial_number: String,
    public_key: Vec<u8>,
}

impl LeafInfo {
    fn parse(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::invalid_identity(format!("Failed to parse leaf certificate: {e}")))?;

        let spiffe_id = spiffe_id_from_cert(&cert)?
            .ok_or_else(|| Error::invalid_identity("Leaf certificate has no SPIFFE URI SAN"))?;

        let validity = cert.validity();
        let not_before = timestamp(validity.not_before.timestamp())?;
        let not_after = timestamp(validity.not_after.timestamp())?;

        Ok(LeafInfo {
            spiffe_id,
            not_before,
            not_after,
            serial_number: cert.raw_serial_as_string(),
            public_key: cert.public_key().raw.to_vec(),
        })
    }
}

/// Extract the SPIFFE ID from the first `spiffe://` URI SAN of a DER
/// certificate. `Ok(None)` means the certificate parsed but carries no
/// SPIFFE URI.
pub fn spiffe_id_from_der(der: &[u8]) -> Result<Option<SpiffeId>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::invalid_identity(format!("Failed to parse certificate: {e}")))?;
    spiffe_id_from_cert(&cert)
}

fn spiffe_id_from_cert(cert: &X509Certificate<'_>) -> Result<Option<SpiffeId>> {
    let san = cert
        .subject_alternative_name()
        .map_err(|e| Error::invalid_identity(format!("Malformed SAN extension: {e}")))?;

    let Some(san) = san else {
        return Ok(None);
    };

    let uri = san.value.general_names.iter().find_map(|name| match name {
        GeneralName::URI(uri) if uri.starts_with("spiffe://") => Some(*uri),
        _ => None,
    });

    uri.map(SpiffeId::parse).transpose()
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::invalid_identity(format!("Certificate time {secs} out of range")))
}

fn parse_pem_chain(pem: &str) -> Result<Vec<Vec<u8>>> {
    let mut reader = pem.as_bytes();
    rustls_pemfile::certs(&mut reader)
        .map(|cert| {
            cert.map(|c| c.to_vec())
                .map_err(|e| Error::invalid_identity(format!("Failed to parse certificate PEM: {e}")))
        })
        .collect()
}

fn parse_pem_key(pem: &str) -> Result<Zeroizing<Vec<u8>>> {
    let mut reader = pem.as_bytes();
    for item in rustls_pemfile::read_all(&mut reader) {
        let item =
            item.map_err(|e| Error::invalid_identity(format!("Failed to parse key PEM: {e}")))?;
        match item {
            rustls_pemfile::Item::Pkcs8Key(key) => {
                return Ok(Zeroizing::new(key.secret_pkcs8_der().to_vec()))
            }
            rustls_pemfile::Item::Pkcs1Key(_) | rustls_pemfile::Item::Sec1Key(_) => {
                return Err(Error::invalid_identity(
                    "Private key must be PKCS#8 encoded",
                ))
            }
            _ => continue,
        }
    }
    Err(Error::invalid_identity("No private key found in PEM"))
}

fn check_key_matches(pkcs8: &[u8], leaf_spki: &[u8]) -> Result<()> {
    let key_pair = rcgen::KeyPair::try_from(pkcs8)
        .map_err(|e| Error::invalid_identity(format!("Unsupported private key: {e}")))?;
    if key_pair.public_key_der() != leaf_spki {
        return Err(Error::invalid_identity(
            "Private key does not match the leaf certificate",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, Ia5String, KeyPair, SanType};

    fn self_signed(uri: &str) -> (Vec<u8>, Zeroizing<Vec<u8>>) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.subject_alt_names = vec![SanType::URI(Ia5String::try_from(uri).unwrap())];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::minutes(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::hours(1);
        let cert = params.self_signed(&key).unwrap();
        (cert.der().to_vec(), Zeroizing::new(key.serialize_der()))
    }

    #[test]
    fn test_from_der_parts_reads_identity_from_leaf() {
        let (cert, key) = self_signed("spiffe://example.org/svc-a");
        let svid =
            X509Svid::from_agent_parts(CertChainSource::Der(vec![cert]), KeySource::Der(key))
                .unwrap();

        assert_eq!(svid.spiffe_id().as_str(), "spiffe://example.org/svc-a");
        assert!(!svid.is_expired());
        assert!(svid.validate().is_ok());
        assert!(svid.key_matches_leaf());
        assert!(svid.validity_window() > chrono::Duration::minutes(60));
    }

    #[test]
    fn test_pem_and_der_normalize_to_same_document() {
        let (cert, key) = self_signed("spiffe://example.org/svc-a");
        let from_der = X509Svid::from_agent_parts(
            CertChainSource::Der(vec![cert.clone()]),
            KeySource::Der(key.clone()),
        )
        .unwrap();

        let chain_pem = pem::encode(&pem::Pem::new("CERTIFICATE", cert));
        let key_pem = Zeroizing::new(pem::encode(&pem::Pem::new("PRIVATE KEY", key.to_vec())));
        let from_pem =
            X509Svid::from_agent_parts(CertChainSource::Pem(chain_pem), KeySource::Pem(key_pem))
                .unwrap();

        assert_eq!(from_pem.spiffe_id(), from_der.spiffe_id());
        assert_eq!(from_pem.cert_chain(), from_der.cert_chain());
        assert_eq!(from_pem.private_key(), from_der.private_key());
        assert_eq!(from_pem.not_after(), from_der.not_after());
    }

    #[test]
    fn test_rejects_mismatched_key() {
        let (cert, _) = self_signed("spiffe://example.org/svc-a");
        let (_, other_key) = self_signed("spiffe://example.org/svc-b");

        let err = X509Svid::from_agent_parts(
            CertChainSource::Der(vec![cert]),
            KeySource::Der(other_key),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidIdentity(_)));
    }

    #[test]
    fn test_rejects_leaf_without_spiffe_uri() {
        let (cert, key) = self_signed("https://example.org/not-spiffe");
        let err = X509Svid::from_agent_parts(CertChainSource::Der(vec![cert]), KeySource::Der(key))
            .unwrap_err();
        assert!(err.to_string().contains("no SPIFFE URI SAN"));
    }

    #[test]
    fn test_rejects_empty_chain() {
        let (_, key) = self_signed("spiffe://example.org/svc-a");
        let err = X509Svid::from_agent_parts(CertChainSource::Der(vec![]), KeySource::Der(key))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidIdentity(_)));

        let (_, key) = self_signed("spiffe://example.org/svc-a");
        assert!(X509Svid::from_agent_parts(
            CertChainSource::Pem(String::new()),
            KeySource::Der(key)
        )
        .is_err());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let (cert, key) = self_signed("spiffe://example.org/svc-a");
        let svid =
            X509Svid::from_agent_parts(CertChainSource::Der(vec![cert]), KeySource::Der(key))
                .unwrap();
        let debug = format!("{:?}", svid);
        assert!(debug.contains("<redacted>"));
        assert!(debug.contains("spiffe://example.org/svc-a"));
    }

    #[test]
    fn test_spiffe_id_from_der() {
        let (cert, _) = self_signed("spiffe://example.org/svc-a");
        let id = spiffe_id_from_der(&cert).unwrap().unwrap();
        assert!(id.is_member_of("example.org"));

        let (cert, _) = self_signed("https://example.org/x");
        assert!(spiffe_id_from_der(&cert).unwrap().is_none());

        assert!(spiffe_id_from_der(b"garbage").is_err());
    }
}
