//! SPIFFE-authenticated service mesh core
//!
//! Keeps a workload's X.509-SVID fresh from the local identity agent, serves
//! a JSON-over-HTTPS surface under mutual TLS with allow-list authorization,
//! and makes authenticated calls to peer services.
//!
//! Each service builds one [`MeshContext`] and hands it to a
//! [`ServiceRuntime`] together with its [`RequestHandler`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod authz;
pub mod client;
pub mod config;
pub mod context;
pub mod dev;
pub mod error;
pub mod mtls;
pub mod refresh;
pub mod runtime;
pub mod spiffe_id;
pub mod store;
pub mod svid;
pub mod trust_bundle;
pub mod workload;

pub use authz::{AllowList, Decision, PeerAuthorizer};
pub use client::{OutboundClient, Response, ServiceDirectory};
pub use config::ServiceConfig;
pub use context::MeshContext;
pub use dev::{DevAuthority, DevIdentityAgent};
pub use error::{Error, Result, TransportErrorKind};
pub use mtls::{FallbackPolicy, ServerContext, TransportFactory};
pub use refresh::{IdentityRefresher, RetryPolicy};
pub use runtime::{HealthReport, RequestHandler, RuntimeState, ServiceRuntime, TransportMode};
pub use spiffe_id::SpiffeId;
pub use store::{CredentialStore, Credentials};
pub use svid::X509Svid;
pub use trust_bundle::{BundleSet, TrustBundle};
pub use workload::{IdentityAgent, WorkloadApiClient, WorkloadApiConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = std::mem::size_of::<SpiffeId>();
        let _ = std::mem::size_of::<X509Svid>();
        let _ = std::mem::size_of::<TrustBundle>();
        let _ = std::mem::size_of::<MeshContext>();
    }
}
