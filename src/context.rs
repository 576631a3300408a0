//! The per-service context object
//!
//! Everything a service needs (credential store, refresher, TLS factory,
//! authorizer and outbound client) is built here once and passed around
//! explicitly. There is no process-wide state.

use crate::authz::PeerAuthorizer;
use crate::client::{OutboundClient, ServiceDirectory};
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::mtls::TransportFactory;
use crate::refresh::IdentityRefresher;
use crate::store::CredentialStore;
use crate::workload::IdentityAgent;
use std::sync::Arc;
use tracing::{error, info};

/// Shared state of one service instance
#[derive(Clone, Debug)]
pub struct MeshContext {
    config: Arc<ServiceConfig>,
    store: CredentialStore,
    refresher: Arc<IdentityRefresher>,
    factory: TransportFactory,
    authorizer: Arc<PeerAuthorizer>,
    outbound: OutboundClient,
}

impl MeshContext {
    /// Wire up a context around `agent`. Does not contact the agent.
    pub fn new(config: ServiceConfig, agent: Arc<dyn IdentityAgent>) -> Result<Self> {
        Self::with_directory(config, agent, ServiceDirectory::from_env())
    }

    /// Like [`MeshContext::new`] with an explicit service directory
    pub fn with_directory(
        config: ServiceConfig,
        agent: Arc<dyn IdentityAgent>,
        directory: ServiceDirectory,
    ) -> Result<Self> {
        config.validate()?;

        let store = CredentialStore::new();
        let refresher = Arc::new(IdentityRefresher::new(
            agent,
            store.clone(),
            config.trust_domain.clone(),
            config.retry.clone(),
            config.refresh_interval,
        )?);
        let factory = TransportFactory::new(store.clone(), config.fallback);
        let authorizer = Arc::new(PeerAuthorizer::new(config.allow_list()?, config.dev_mode));
        let outbound = OutboundClient::new(factory.clone(), directory, config.outbound_timeout);

        Ok(MeshContext {
            config: Arc::new(config),
            store,
            refresher,
            factory,
            authorizer,
            outbound,
        })
    }

    /// Run the startup refresh.
    ///
    /// Returns whether credentials are ready. A failure is logged and the
    /// service carries on degraded; the background schedule keeps trying.
    pub async fn bootstrap(&self) -> bool {
        match self.refresher.refresh().await {
            Ok(()) => {
                info!(service = %self.config.service_name, "Workload credentials loaded");
                true
            }
            Err(e) => {
                error!(
                    service = %self.config.service_name,
                    error = %e,
                    "Initial credential refresh failed; continuing in degraded mode"
                );
                false
            }
        }
    }

    /// Service configuration
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Credential store
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Identity refresher
    pub fn refresher(&self) -> &Arc<IdentityRefresher> {
        &self.refresher
    }

    /// TLS context factory
    pub fn transport(&self) -> &TransportFactory {
        &self.factory
    }

    /// Inbound authorizer
    pub fn authorizer(&self) -> &PeerAuthorizer {
        &self.authorizer
    }

    /// Outbound client
    pub fn outbound(&self) -> &OutboundClient {
        &self.outbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::DevIdentityAgent;
    use crate::spiffe_id::SpiffeId;

    fn agent() -> Arc<DevIdentityAgent> {
        Arc::new(
            DevIdentityAgent::standalone(
                SpiffeId::parse("spiffe://example.org/svc-a").unwrap(),
            )
            .unwrap(),
        )
    }

    fn config() -> ServiceConfig {
        let mut config = ServiceConfig::new("svc-a");
        config.trust_domain = "example.org".into();
        config
    }

    #[tokio::test]
    async fn test_bootstrap_loads_credentials() {
        let ctx = MeshContext::with_directory(config(), agent(), ServiceDirectory::default()).unwrap();
        assert!(!ctx.store().is_ready());

        assert!(ctx.bootstrap().await);
        assert!(ctx.store().is_ready());
        assert!(ctx.transport().server_context().unwrap().is_mutual());
        assert!(ctx.transport().client_context().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_failure_degrades() {
        let agent = agent();
        agent.set_unreachable(true);
        let ctx = MeshContext::with_directory(config(), agent, ServiceDirectory::default()).unwrap();

        assert!(!ctx.bootstrap().await);
        assert!(!ctx.transport().server_context().unwrap().is_mutual());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config();
        config.allowed_callers = vec!["nope".into()];
        assert!(MeshContext::with_directory(config, agent(), ServiceDirectory::default()).is_err());
    }
}
