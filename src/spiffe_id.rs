//! SPIFFE ID types and validation

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

const SCHEME_PREFIX: &str = "spiffe://";

/// A SPIFFE ID uniquely identifies a workload
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpiffeId {
    trust_domain: String,
    path: String,
    raw_url: Url,
}

impl SpiffeId {
    /// Create a new SPIFFE ID from trust domain and path
    ///
    /// # Examples
    /// ```
    /// use spiffe_mesh::SpiffeId;
    ///
    /// let id = SpiffeId::new("example.org", "/svc-a").unwrap();
    /// assert_eq!(id.to_string(), "spiffe://example.org/svc-a");
    /// ```
    pub fn new(trust_domain: impl AsRef<str>, path: impl AsRef<str>) -> Result<Self> {
        let path = path.as_ref();
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Self::parse(format!("{}{}{}", SCHEME_PREFIX, trust_domain.as_ref(), path))
    }

    /// Parse a SPIFFE ID from a string
    ///
    /// Validation runs on the raw text before URL normalization, so
    /// `spiffe://example.org/a/../b` is rejected rather than silently
    /// collapsed to `/b`.
    ///
    /// # Examples
    /// ```
    /// use spiffe_mesh::SpiffeId;
    ///
    /// let id = SpiffeId::parse("spiffe://example.org/ns/prod/svc-a").unwrap();
    /// assert_eq!(id.trust_domain(), "example.org");
    /// assert_eq!(id.path(), "/ns/prod/svc-a");
    /// ```
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let s = s.as_ref();
        let rest = s.strip_prefix(SCHEME_PREFIX).ok_or_else(|| {
            Error::invalid_spiffe_id(format!("'{}' does not start with '{}'", s, SCHEME_PREFIX))
        })?;

        let (trust_domain, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };

        validate_trust_domain(trust_domain)?;
        validate_path(path)?;

        let raw_url = Url::parse(s)?;
        if raw_url.host_str() != Some(trust_domain) || raw_url.path() != path {
            return Err(Error::invalid_spiffe_id(format!(
                "'{}' is not in canonical form",
                s
            )));
        }

        Ok(SpiffeId {
            trust_domain: trust_domain.to_string(),
            path: path.to_string(),
            raw_url,
        })
    }

    /// Get the trust domain
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Get the path component
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get the full SPIFFE ID as a string slice
    pub fn as_str(&self) -> &str {
        self.raw_url.as_str()
    }

    /// Check if this ID belongs to the specified trust domain
    pub fn is_member_of(&self, trust_domain: &str) -> bool {
        self.trust_domain == trust_domain
    }
}

fn validate_trust_domain(td: &str) -> Result<()> {
    if td.is_empty() {
        return Err(Error::invalid_spiffe_id("Trust domain cannot be empty"));
    }
    if let Some(c) = td
        .chars()
        .find(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.' | '-' | '_'))
    {
        return Err(Error::invalid_spiffe_id(format!(
            "Trust domain '{}' contains invalid character '{}'",
            td, c
        )));
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path == "/" {
        return Err(Error::invalid_spiffe_id(
            "SPIFFE ID must have a non-empty path",
        ));
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return Err(Error::invalid_spiffe_id("Path cannot contain empty segments")),
            "." | ".." => {
                return Err(Error::invalid_spiffe_id(
                    "Path cannot contain '.' or '..' segments",
                ))
            }
            _ => {}
        }
        if let Some(c) = segment
            .chars()
            .find(|c| !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_'))
        {
            return Err(Error::invalid_spiffe_id(format!(
                "Path segment '{}' contains invalid character '{}'",
                segment, c
            )));
        }
    }
    Ok(())
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpiffeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SpiffeId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<SpiffeId> for String {
    fn from(id: SpiffeId) -> Self {
        id.raw_url.into()
    }
}

impl PartialEq<str> for SpiffeId {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spiffe_id_creation() {
        let id = SpiffeId::new("example.org", "/svc-a").unwrap();
        assert_eq!(id.trust_domain(), "example.org");
        assert_eq!(id.path(), "/svc-a");
        assert_eq!(id.to_string(), "spiffe://example.org/svc-a");

        let id = SpiffeId::new("example.org", "ns/prod/svc-b").unwrap();
        assert_eq!(id.path(), "/ns/prod/svc-b");
    }

    #[test]
    fn test_spiffe_id_parsing() {
        let id = SpiffeId::parse("spiffe://security-training.example.org/risk-scorer").unwrap();
        assert_eq!(id.trust_domain(), "security-training.example.org");
        assert_eq!(id.path(), "/risk-scorer");
        assert_eq!(&id, "spiffe://security-training.example.org/risk-scorer");
    }

    #[test]
    fn test_invalid_spiffe_id() {
        assert!(SpiffeId::parse("http://example.org/service").is_err());
        assert!(SpiffeId::parse("spiffe://").is_err());
        assert!(SpiffeId::parse("spiffe://example.org").is_err());
        assert!(SpiffeId::parse("spiffe://example.org/").is_err());
        assert!(SpiffeId::new("", "/service").is_err());
        assert!(SpiffeId::new("example.org", "").is_err());
    }

    #[test]
    fn test_rejects_dot_segments_before_normalization() {
        assert!(SpiffeId::parse("spiffe://example.org/../etc/passwd").is_err());
        assert!(SpiffeId::parse("spiffe://example.org/a/./b").is_err());
        assert!(SpiffeId::parse("spiffe://example.org/a//b").is_err());
    }

    #[test]
    fn test_rejects_non_canonical_authority() {
        assert!(SpiffeId::parse("spiffe://Example.org/svc").is_err());
        assert!(SpiffeId::parse("spiffe://example.org:8443/svc").is_err());
        assert!(SpiffeId::parse("spiffe://user@example.org/svc").is_err());
        assert!(SpiffeId::parse("spiffe://example.org/svc?x=1").is_err());
        assert!(SpiffeId::parse("spiffe://example.org/svc#frag").is_err());
    }

    #[test]
    fn test_trust_domain_membership() {
        let id = SpiffeId::new("example.org", "/svc-a").unwrap();
        assert!(id.is_member_of("example.org"));
        assert!(!id.is_member_of("other.org"));
    }

    #[test]
    fn test_serde_as_string() {
        let id = SpiffeId::parse("spiffe://example.org/svc-a").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"spiffe://example.org/svc-a\"");

        let back: SpiffeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<SpiffeId>("\"https://example.org\"").is_err());
    }
}
