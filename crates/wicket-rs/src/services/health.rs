//! Background health probing for registry instances.
//!
//! Runs independently of the request path: every interval each known
//! instance gets a GET to the configured health path with a short timeout.
//! Results feed the instance cache's threshold counters; the resolver only
//! ever reads published state and never waits on a probe.

use crate::models::settings::HealthCheckSettings;
use crate::services::registry::InstanceCache;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

pub struct HealthChecker {
    cache: Arc<InstanceCache>,
    client: reqwest::Client,
    settings: HealthCheckSettings,
}

impl HealthChecker {
    pub fn new(cache: Arc<InstanceCache>, settings: HealthCheckSettings) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.timeout_seconds))
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .expect("failed to create health check client");

        Self {
            cache,
            client,
            settings,
        }
    }

    /// One probe round over every known instance.
    pub async fn probe_all(&self) {
        for instance in self.cache.all_instances() {
            let url = format!(
                "{}://{}:{}{}",
                instance.scheme, instance.host, instance.port, self.settings.path
            );

            let success = match self.client.get(&url).send().await {
                Ok(resp) => resp.status().as_u16() == self.settings.expected_status,
                Err(e) => {
                    debug!("health probe for {} failed: {}", instance.instance_id, e);
                    false
                }
            };

            self.cache.record_probe(
                &instance.instance_id,
                success,
                self.settings.healthy_threshold,
                self.settings.unhealthy_threshold,
            );
        }
    }

    /// Spawns the probe loop at the configured interval.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.settings.interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.probe_all().await;
            }
        })
    }
}
