//! Credential refresh and rotation
//!
//! [`IdentityRefresher::refresh`] is the synchronous path (used at startup
//! and on demand). [`IdentityRefresher::spawn`] runs the same operation on a
//! fixed period until cancelled. A single async mutex guarantees at most one
//! refresh in flight; scheduled ticks that find it held are skipped.

use crate::error::{Error, Result};
use crate::store::CredentialStore;
use crate::workload::IdentityAgent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default background refresh period
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Retry policy for one synchronous refresh
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles after each further one
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// All delays slept during a fully failing refresh
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|a| self.delay_after(a)).collect()
    }
}

/// Keeps the credential store populated from an identity agent
pub struct IdentityRefresher {
    agent: Arc<dyn IdentityAgent>,
    store: CredentialStore,
    trust_domain: String,
    policy: RetryPolicy,
    interval: Duration,
    in_flight: Mutex<()>,
}

impl IdentityRefresher {
    /// Create a refresher writing into `store`. `interval` must be non-zero.
    pub fn new(
        agent: Arc<dyn IdentityAgent>,
        store: CredentialStore,
        trust_domain: impl Into<String>,
        policy: RetryPolicy,
        interval: Duration,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::Config("refresh interval must be positive".into()));
        }
        Ok(IdentityRefresher {
            agent,
            store,
            trust_domain: trust_domain.into(),
            policy,
            interval,
            in_flight: Mutex::new(()),
        })
    }

    /// The store this refresher writes
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Background period
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True when refreshing every `interval` leaves no gap for credentials
    /// valid for `window`.
    pub fn interval_covers(&self, window: chrono::Duration) -> bool {
        chrono::Duration::from_std(self.interval)
            .map(|interval| interval < window)
            .unwrap_or(false)
    }

    /// Fetch and install fresh credentials, retrying per policy.
    ///
    /// Waits for any refresh already in flight. On failure the store keeps
    /// whatever it held before.
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self.in_flight.lock().await;
        self.refresh_locked().await
    }

    /// Scheduled variant: returns `None` without doing anything when another
    /// refresh holds the lock.
    pub(crate) async fn try_refresh(&self) -> Option<Result<()>> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Refresh already in flight; skipping scheduled tick");
            return None;
        };
        Some(self.refresh_locked().await)
    }

    async fn refresh_locked(&self) -> Result<()> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.fetch_and_install().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    error!(attempt, max_attempts, error = %e, "Credential refresh attempt failed");

                    if attempt >= max_attempts || !e.is_retryable() {
                        error!(
                            attempts = attempt,
                            "Credential refresh gave up; keeping existing credentials"
                        );
                        return Err(e);
                    }

                    let delay = self.policy.delay_after(attempt);
                    debug!(delay_secs = delay.as_secs(), "Retrying credential refresh");
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn fetch_and_install(&self) -> Result<()> {
        let document = self.agent.fetch_identity().await?;
        let bundles = self.agent.fetch_trust_bundle().await?;
        let bundle = bundles.select(&self.trust_domain, document.spiffe_id().trust_domain())?;

        if !document.spiffe_id().is_member_of(&self.trust_domain) {
            warn!(
                spiffe_id = %document.spiffe_id(),
                configured = %self.trust_domain,
                "Identity is outside the configured trust domain"
            );
        }

        let window = document.validity_window();
        if !self.interval_covers(window) {
            warn!(
                interval_secs = self.interval.as_secs(),
                window_secs = window.num_seconds(),
                "Refresh interval is not shorter than the credential validity window; credentials may expire between refreshes"
            );
        }

        self.store.replace(document, bundle)?;
        Ok(())
    }

    /// Run the background schedule until `shutdown` fires.
    ///
    /// The first tick comes one full interval after spawning; failures are
    /// logged and the schedule carries on.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + this.interval, this.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = this.interval.as_secs(), "Background credential refresh started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    outcome = this.try_refresh() => match outcome {
                        Some(Ok(())) => debug!("Scheduled credential refresh succeeded"),
                        Some(Err(e)) => error!(error = %e, "Scheduled credential refresh failed; will retry next interval"),
                        None => {}
                    },
                }
            }

            info!("Background credential refresh stopped");
        })
    }
}

impl std::fmt::Debug for IdentityRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRefresher")
            .field("trust_domain", &self.trust_domain)
            .field("policy", &self.policy)
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::DevIdentityAgent;
    use crate::spiffe_id::SpiffeId;
    use crate::svid::X509Svid;
    use crate::trust_bundle::BundleSet;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn dev_agent() -> Arc<DevIdentityAgent> {
        Arc::new(
            DevIdentityAgent::standalone(SpiffeId::parse("spiffe://example.org/svc-a").unwrap())
                .unwrap(),
        )
    }

    fn refresher(agent: Arc<dyn IdentityAgent>) -> Arc<IdentityRefresher> {
        Arc::new(
            IdentityRefresher::new(
                agent,
                CredentialStore::new(),
                "example.org",
                RetryPolicy::default(),
                DEFAULT_REFRESH_INTERVAL,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_retry_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.schedule(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ]
        );
        assert_eq!(policy.delay_after(5), Duration::from_secs(32));
    }

    #[test]
    fn test_interval_covers_window() {
        let r = refresher(dev_agent());
        assert!(r.interval_covers(chrono::Duration::hours(1)));
        assert!(!r.interval_covers(chrono::Duration::minutes(30)));
        assert!(!r.interval_covers(chrono::Duration::minutes(10)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = IdentityRefresher::new(
            dev_agent(),
            CredentialStore::new(),
            "example.org",
            RetryPolicy::default(),
            Duration::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_short_lived_credentials_still_install() {
        // Ten minutes plus the minute of backdating: shorter than the
        // thirty minute schedule, so the coverage warning fires.
        let agent = Arc::new(
            DevIdentityAgent::standalone(SpiffeId::parse("spiffe://example.org/svc-a").unwrap())
                .unwrap()
                .with_ttl(Duration::from_secs(10 * 60)),
        );
        let r = refresher(agent.clone());

        r.refresh().await.unwrap();

        let creds = r.store().require().unwrap();
        let window = creds.document().validity_window();
        assert_eq!(window, chrono::Duration::minutes(11));
        assert!(!r.interval_covers(window));
        assert_eq!(creds.generation(), 1);
        assert_eq!(agent.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_populates_store() {
        let agent = dev_agent();
        let r = refresher(agent.clone());

        r.refresh().await.unwrap();

        let creds = r.store().require().unwrap();
        assert_eq!(creds.document().spiffe_id().as_str(), "spiffe://example.org/svc-a");
        assert_eq!(agent.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_agent_exhausts_five_attempts() {
        let agent = dev_agent();
        agent.set_unreachable(true);
        let r = refresher(agent.clone());

        let started = Instant::now();
        let err = r.refresh().await.unwrap_err();

        assert!(matches!(err, Error::IdentityAgentUnreachable(_)));
        assert_eq!(agent.fetch_count(), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(2 + 4 + 8 + 16));
        assert!(!r.store().is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_existing_credentials() {
        let agent = dev_agent();
        let r = refresher(agent.clone());
        r.refresh().await.unwrap();
        let before = r.store().require().unwrap().generation();

        agent.set_unreachable(true);
        assert!(r.refresh().await.is_err());

        assert_eq!(r.store().require().unwrap().generation(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_schedule_outlives_startup_failure() {
        let agent = dev_agent();
        agent.set_unreachable(true);
        let r = refresher(agent.clone());
        assert!(r.refresh().await.is_err());

        let shutdown = CancellationToken::new();
        let handle = r.spawn(shutdown.clone());

        // Two scheduled ticks, each exhausting its own retry budget.
        sleep(Duration::from_secs(61 * 60)).await;
        assert_eq!(agent.fetch_count(), 15);
        assert!(!r.store().is_ready());

        agent.set_unreachable(false);
        sleep(Duration::from_secs(30 * 60)).await;
        assert!(r.store().is_ready());

        shutdown.cancel();
        handle.await.unwrap();
    }

    /// Blocks inside `fetch_identity` until released.
    struct GatedAgent {
        inner: Arc<DevIdentityAgent>,
        entered: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IdentityAgent for GatedAgent {
        async fn fetch_identity(&self) -> Result<X509Svid> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.fetch_identity().await
        }

        async fn fetch_trust_bundle(&self) -> Result<BundleSet> {
            self.inner.fetch_trust_bundle().await
        }
    }

    #[tokio::test]
    async fn test_scheduled_tick_skips_while_refresh_in_flight() {
        let agent = Arc::new(GatedAgent {
            inner: dev_agent(),
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let r = refresher(agent.clone());

        let explicit = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.refresh().await }
        });
        agent.entered.notified().await;

        assert!(r.try_refresh().await.is_none());
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);

        agent.release.notify_one();
        explicit.await.unwrap().unwrap();
        assert!(r.store().is_ready());
    }

    #[tokio::test]
    async fn test_spawn_stops_on_cancel() {
        let r = refresher(dev_agent());
        let shutdown = CancellationToken::new();
        let handle = r.spawn(shutdown.clone());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
