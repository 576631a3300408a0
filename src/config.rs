//! Service configuration

use crate::authz::AllowList;
use crate::error::{Error, Result};
use crate::mtls::FallbackPolicy;
use crate::refresh::{RetryPolicy, DEFAULT_REFRESH_INTERVAL};
use crate::workload::DEFAULT_SOCKET_PATH;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Default trust domain
pub const DEFAULT_TRUST_DOMAIN: &str = "security-training.example.org";

/// Default listen port
pub const DEFAULT_PORT: u16 = 8443;

/// Default deadline for outbound calls
pub const DEFAULT_OUTBOUND_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only inputs for one service instance
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Name reported by the health endpoint and in logs
    pub service_name: String,
    /// Listen address
    pub bind_addr: IpAddr,
    /// Listen port
    pub port: u16,
    /// Trust domain whose bundle verifies peers
    pub trust_domain: String,
    /// Permitted callers; empty means unrestricted
    pub allowed_callers: Vec<String>,
    /// Let requests without a verified peer identity through a populated allow-list
    pub dev_mode: bool,
    /// Behaviour before the first successful refresh
    pub fallback: FallbackPolicy,
    /// Serve TLS at all; when false the runtime speaks plain HTTP
    pub tls_enabled: bool,
    /// Identity agent socket
    pub socket_path: PathBuf,
    /// Background refresh period
    pub refresh_interval: Duration,
    /// Default deadline for outbound calls
    pub outbound_timeout: Duration,
    /// Synchronous refresh retry policy
    pub retry: RetryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            service_name: "service".to_string(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            trust_domain: DEFAULT_TRUST_DOMAIN.to_string(),
            allowed_callers: Vec::new(),
            dev_mode: false,
            fallback: FallbackPolicy::default(),
            tls_enabled: true,
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            outbound_timeout: DEFAULT_OUTBOUND_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl ServiceConfig {
    /// Defaults with the given service name
    pub fn new(service_name: impl Into<String>) -> Self {
        ServiceConfig {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Overlay environment variables on the defaults
    pub fn from_env(service_name: impl Into<String>) -> Result<Self> {
        Self::from_lookup(service_name, |key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup` on the defaults
    pub fn from_lookup(
        service_name: impl Into<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = Self::new(service_name);

        if let Some(v) = lookup("DEV_MODE") {
            config.dev_mode = is_true(&v);
        }
        if let Some(v) = lookup("TRUST_DOMAIN") {
            config.trust_domain = v;
        }
        if let Some(v) = lookup("SPIFFE_ENDPOINT_SOCKET") {
            config.socket_path = PathBuf::from(v.strip_prefix("unix://").unwrap_or(&v));
        }
        if let Some(v) = lookup("SERVICE_PORT") {
            config.port = v
                .parse()
                .map_err(|e| Error::Config(format!("SERVICE_PORT '{v}': {e}")))?;
        }
        if let Some(v) = lookup("ALLOWED_CALLERS") {
            config.allowed_callers = split_list(&v);
        }
        if let Some(v) = lookup("FAIL_CLOSED") {
            if is_true(&v) {
                config.fallback = FallbackPolicy::FailClosed;
            }
        }

        debug!(?config, "Loaded service configuration");
        Ok(config)
    }

    /// Reject unusable values
    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return Err(Error::Config("service name cannot be empty".into()));
        }
        if self.trust_domain.is_empty() {
            return Err(Error::Config("trust domain cannot be empty".into()));
        }
        if self.refresh_interval.is_zero() {
            return Err(Error::Config("refresh interval must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry policy needs at least one attempt".into()));
        }
        self.allow_list()?;
        Ok(())
    }

    /// Parsed allow-list
    pub fn allow_list(&self) -> Result<AllowList> {
        AllowList::parse(&self.allowed_callers)
            .map_err(|e| Error::Config(format!("allowed caller rejected: {e}")))
    }

    /// Socket address to listen on
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

fn is_true(v: &str) -> bool {
    v.trim().eq_ignore_ascii_case("true")
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
