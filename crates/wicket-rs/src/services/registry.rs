//! Service discovery seam and the healthy-instance cache.
//!
//! The gateway does not implement its own discovery protocol; it consumes a
//! [`ServiceRegistry`] capability and keeps the last known instance set in an
//! [`InstanceCache`]. Snapshots are swapped atomically so the resolver sees
//! either the old set or the new one, never a partial view. Health state is
//! maintained separately by the probe loop and consulted at read time.

use async_trait::async_trait;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::services::counter_store::StoreError;

/// A backend service instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInstance {
    pub service: String,
    pub instance_id: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl ServiceInstance {
    pub fn new(service: &str, scheme: &str, host: &str, port: u16, weight: u32) -> Self {
        Self {
            service: service.to_string(),
            instance_id: format!("{}/{}:{}", service, host, port),
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            weight,
        }
    }
}

/// Discovery capability. The shipped implementation serves a static set from
/// configuration; a real registry client plugs in behind the same trait.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn discover(&self, service: &str) -> Result<Vec<ServiceInstance>, StoreError>;

    async fn service_names(&self) -> Result<Vec<String>, StoreError>;
}

/// Config-declared instance sets.
pub struct StaticRegistry {
    services: HashMap<String, Vec<ServiceInstance>>,
}

impl StaticRegistry {
    pub fn new(services: HashMap<String, Vec<ServiceInstance>>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn discover(&self, service: &str) -> Result<Vec<ServiceInstance>, StoreError> {
        Ok(self.services.get(service).cloned().unwrap_or_default())
    }

    async fn service_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.services.keys().cloned().collect())
    }
}

#[derive(Debug)]
struct InstanceHealth {
    healthy: std::sync::atomic::AtomicBool,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    last_healthy_at: ArcSwap<Option<DateTime<Utc>>>,
}

impl InstanceHealth {
    fn new() -> Self {
        Self {
            healthy: std::sync::atomic::AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            last_healthy_at: ArcSwap::from_pointee(None),
        }
    }
}

/// Last-known instance sets plus per-instance health, read by the resolver.
///
/// Reads never block on discovery or probing. If the registry has been
/// unreachable past the staleness threshold the cache reports empty sets and
/// the resolver surfaces `NoHealthyInstance`.
pub struct InstanceCache {
    instances: ArcSwap<HashMap<String, Arc<Vec<ServiceInstance>>>>,
    health: DashMap<String, InstanceHealth>,
    /// Millis since process start of the last successful refresh.
    last_refresh_ms: AtomicU64,
    epoch: Instant,
    stale_after: Duration,
}

impl InstanceCache {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            instances: ArcSwap::from_pointee(HashMap::new()),
            health: DashMap::new(),
            last_refresh_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            stale_after,
        }
    }

    /// Pulls every service's instance set from the registry and publishes the
    /// result atomically. On failure the previous snapshot stays in place.
    pub async fn refresh(&self, registry: &dyn ServiceRegistry) -> Result<(), StoreError> {
        let names = registry.service_names().await?;
        let mut next: HashMap<String, Arc<Vec<ServiceInstance>>> = HashMap::new();

        for name in names {
            let instances = registry.discover(&name).await?;
            for instance in &instances {
                self.health
                    .entry(instance.instance_id.clone())
                    .or_insert_with(InstanceHealth::new);
            }
            next.insert(name, Arc::new(instances));
        }

        self.instances.store(Arc::new(next));
        self.last_refresh_ms.store(
            self.epoch.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );
        Ok(())
    }

    fn is_stale(&self) -> bool {
        let last = self.last_refresh_ms.load(Ordering::Relaxed);
        if last == 0 {
            return false; // never refreshed: initial set may still be loading
        }
        self.epoch.elapsed().as_millis() as u64 - last > self.stale_after.as_millis() as u64
    }

    /// Healthy instances of a service from the last published snapshot.
    pub fn healthy_instances(&self, service: &str) -> Vec<ServiceInstance> {
        if self.is_stale() {
            warn!("instance cache for {} is stale, reporting no instances", service);
            return Vec::new();
        }

        let snapshot = self.instances.load();
        let Some(instances) = snapshot.get(service) else {
            return Vec::new();
        };

        instances
            .iter()
            .filter(|i| {
                self.health
                    .get(&i.instance_id)
                    .map(|h| h.healthy.load(Ordering::Relaxed))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Every known instance, healthy or not, for the probe loop.
    pub fn all_instances(&self) -> Vec<ServiceInstance> {
        let snapshot = self.instances.load();
        snapshot.values().flat_map(|v| v.iter().cloned()).collect()
    }

    /// Feeds one probe result into the threshold counters.
    ///
    /// An instance flips Healthy after `healthy_threshold` consecutive
    /// successes and Unhealthy after `unhealthy_threshold` consecutive
    /// failures; anything in between keeps the current status.
    pub fn record_probe(
        &self,
        instance_id: &str,
        success: bool,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
    ) {
        let health = self
            .health
            .entry(instance_id.to_string())
            .or_insert_with(InstanceHealth::new);

        if success {
            health.consecutive_failures.store(0, Ordering::Relaxed);
            let successes = health.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
            if successes >= healthy_threshold
                && !health.healthy.swap(true, Ordering::Relaxed)
            {
                health.last_healthy_at.store(Arc::new(Some(Utc::now())));
                info!("instance {} is healthy again", instance_id);
            } else if health.healthy.load(Ordering::Relaxed) {
                health.last_healthy_at.store(Arc::new(Some(Utc::now())));
            }
        } else {
            health.consecutive_successes.store(0, Ordering::Relaxed);
            let failures = health.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= unhealthy_threshold && health.healthy.swap(false, Ordering::Relaxed) {
                warn!(
                    "instance {} marked unhealthy after {} consecutive probe failures",
                    instance_id, failures
                );
            }
        }
    }

    /// Background discovery refresh on a fixed cadence. Failures keep the
    /// last known set and only age the staleness clock.
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        registry: Arc<dyn ServiceRegistry>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh(registry.as_ref()).await {
                    warn!("registry refresh failed: {}", e);
                }
            }
        })
    }

    pub fn is_healthy(&self, instance_id: &str) -> bool {
        self.health
            .get(instance_id)
            .map(|h| h.healthy.load(Ordering::Relaxed))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_service() -> (InstanceCache, StaticRegistry) {
        let mut services = HashMap::new();
        services.insert(
            "users".to_string(),
            vec![
                ServiceInstance::new("users", "http", "10.0.0.1", 8080, 1),
                ServiceInstance::new("users", "http", "10.0.0.2", 8080, 1),
            ],
        );
        (
            InstanceCache::new(Duration::from_secs(300)),
            StaticRegistry::new(services),
        )
    }

    #[tokio::test]
    async fn refresh_publishes_instances() {
        let (cache, registry) = cache_with_service();
        cache.refresh(&registry).await.unwrap();

        assert_eq!(cache.healthy_instances("users").len(), 2);
        assert_eq!(cache.healthy_instances("unknown").len(), 0);
    }

    #[tokio::test]
    async fn unhealthy_instances_are_filtered_after_threshold() {
        let (cache, registry) = cache_with_service();
        cache.refresh(&registry).await.unwrap();

        let id = "users/10.0.0.1:8080";
        cache.record_probe(id, false, 2, 3);
        cache.record_probe(id, false, 2, 3);
        assert!(cache.is_healthy(id), "below threshold keeps status");

        cache.record_probe(id, false, 2, 3);
        assert!(!cache.is_healthy(id));
        assert_eq!(cache.healthy_instances("users").len(), 1);
    }

    #[tokio::test]
    async fn recovery_requires_consecutive_successes() {
        let (cache, registry) = cache_with_service();
        cache.refresh(&registry).await.unwrap();

        let id = "users/10.0.0.1:8080";
        for _ in 0..3 {
            cache.record_probe(id, false, 2, 3);
        }
        assert!(!cache.is_healthy(id));

        cache.record_probe(id, true, 2, 3);
        assert!(!cache.is_healthy(id));
        cache.record_probe(id, true, 2, 3);
        assert!(cache.is_healthy(id));
    }
}
