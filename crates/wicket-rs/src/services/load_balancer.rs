//! Load balancing strategies for distributing requests across healthy
//! service instances.
//!
//! Strategy state is keyed per service (round-robin counters) or per
//! instance (connection gauges, response-time EWMAs) so unrelated services
//! never interfere with each other.

use crate::models::settings::LoadBalancerKind;
use crate::services::registry::ServiceInstance;
use dashmap::DashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Instance selection strategy.
///
/// `select` picks the instance for one dispatch; `on_dispatch` and
/// `on_complete` feed back connection and latency signals for the stateful
/// strategies.
pub trait LoadBalancer: Send + Sync {
    fn select(&self, service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance>;

    /// Called when a request is sent to the instance.
    fn on_dispatch(&self, _instance: &ServiceInstance) {}

    /// Called when the request completes, successfully or not.
    fn on_complete(&self, _instance: &ServiceInstance, _duration: Duration, _success: bool) {}
}

/// Round-robin: per-service atomic counter mod instance count.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counters: DashMap<String, AtomicUsize>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(&self, service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }

        let counter = self
            .counters
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        let index = counter.fetch_add(1, Ordering::Relaxed) % instances.len();
        Some(instances[index].clone())
    }
}

/// Uniform random selection. Stateless.
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for RandomBalancer {
    fn select(&self, _service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }

        use rand::Rng;
        let index = rand::thread_rng().gen_range(0..instances.len());
        Some(instances[index].clone())
    }
}

/// Least-connections: routes to the instance with the lowest active
/// connection gauge, ties broken round-robin.
#[derive(Debug, Default)]
pub struct LeastConnectionsBalancer {
    active: DashMap<String, AtomicU64>,
    tie_breaker: AtomicUsize,
}

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn active_connections(&self, instance: &ServiceInstance) -> u64 {
        self.active
            .get(&instance.instance_id)
            .map(|gauge| gauge.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn select(&self, _service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }

        let min = instances
            .iter()
            .map(|i| self.active_connections(i))
            .min()
            .unwrap_or(0);

        let candidates: Vec<&ServiceInstance> = instances
            .iter()
            .filter(|i| self.active_connections(i) == min)
            .collect();

        let index = self.tie_breaker.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].clone())
    }

    fn on_dispatch(&self, instance: &ServiceInstance) {
        self.active
            .entry(instance.instance_id.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_complete(&self, instance: &ServiceInstance, _duration: Duration, _success: bool) {
        if let Some(gauge) = self.active.get(&instance.instance_id) {
            // Saturating decrement; a gauge can see a completion for a
            // dispatch recorded before a restart.
            let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
        }
    }
}

/// Weighted-response-time: weight inversely proportional to an EWMA of
/// observed response times, sampled by weighted random draw.
///
/// Instances without an observation yet use the cold-start latency so new
/// instances receive traffic and build up a real average.
#[derive(Debug, Default)]
pub struct ResponseTimeBalancer {
    /// EWMA of response time per instance, in microseconds.
    ewma_micros: DashMap<String, AtomicU64>,
}

const EWMA_ALPHA: f64 = 0.3;
const COLD_START_MICROS: u64 = 50_000;

impl ResponseTimeBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn ewma(&self, instance: &ServiceInstance) -> u64 {
        self.ewma_micros
            .get(&instance.instance_id)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(COLD_START_MICROS)
    }
}

impl LoadBalancer for ResponseTimeBalancer {
    fn select(&self, _service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }

        let weights: Vec<f64> = instances
            .iter()
            .map(|i| 1.0 / (self.ewma(i).max(1) as f64))
            .collect();
        let total: f64 = weights.iter().sum();

        use rand::Rng;
        let mut draw = rand::thread_rng().gen::<f64>() * total;
        for (instance, weight) in instances.iter().zip(weights.iter()) {
            draw -= weight;
            if draw <= 0.0 {
                return Some(instance.clone());
            }
        }

        instances.last().cloned()
    }

    fn on_complete(&self, instance: &ServiceInstance, duration: Duration, _success: bool) {
        let observed = duration.as_micros() as u64;
        let gauge = self
            .ewma_micros
            .entry(instance.instance_id.clone())
            .or_insert_with(|| AtomicU64::new(observed));

        let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
            let next = EWMA_ALPHA * observed as f64 + (1.0 - EWMA_ALPHA) * old as f64;
            Some(next as u64)
        });
    }
}

/// Sticky-session selection: hashes the session key onto the instance set.
///
/// Resharding on instance set change is implicit in the modulo; clients keep
/// their instance as long as the set is stable.
pub fn sticky_select(
    session_key: &str,
    instances: &[ServiceInstance],
) -> Option<ServiceInstance> {
    if instances.is_empty() {
        return None;
    }

    let mut hasher = ahash::AHasher::default();
    session_key.hash(&mut hasher);
    let index = (hasher.finish() as usize) % instances.len();
    Some(instances[index].clone())
}

/// Factory for creating load balancers from the configured algorithm.
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    pub fn create(kind: LoadBalancerKind) -> Arc<dyn LoadBalancer> {
        match kind {
            LoadBalancerKind::RoundRobin => Arc::new(RoundRobinBalancer::new()),
            LoadBalancerKind::Random => Arc::new(RandomBalancer::new()),
            LoadBalancerKind::LeastConnections => Arc::new(LeastConnectionsBalancer::new()),
            LoadBalancerKind::WeightedResponseTime => Arc::new(ResponseTimeBalancer::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instances(n: usize) -> Vec<ServiceInstance> {
        (0..n)
            .map(|i| ServiceInstance::new("users", "http", &format!("10.0.0.{}", i + 1), 8080, 1))
            .collect()
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let balancer = RoundRobinBalancer::new();
        let set = instances(3);

        let picks: Vec<String> = (0..6)
            .map(|_| balancer.select("users", &set).unwrap().host)
            .collect();
        assert_eq!(picks[0], picks[3]);
        assert_eq!(picks[1], picks[4]);
        assert_eq!(picks[2], picks[5]);
        assert_ne!(picks[0], picks[1]);
    }

    #[test]
    fn round_robin_counters_are_per_service() {
        let balancer = RoundRobinBalancer::new();
        let set = instances(2);

        let first_users = balancer.select("users", &set).unwrap();
        let first_orders = balancer.select("orders", &set).unwrap();
        // Each service starts its own rotation.
        assert_eq!(first_users.host, first_orders.host);
    }

    #[test]
    fn least_connections_prefers_idle_instance() {
        let balancer = LeastConnectionsBalancer::new();
        let set = instances(2);

        balancer.on_dispatch(&set[0]);
        balancer.on_dispatch(&set[0]);
        balancer.on_dispatch(&set[1]);

        let picked = balancer.select("users", &set).unwrap();
        assert_eq!(picked.host, set[1].host);
    }

    #[test]
    fn response_time_balancer_favors_fast_instances() {
        let balancer = ResponseTimeBalancer::new();
        let set = instances(2);

        for _ in 0..10 {
            balancer.on_complete(&set[0], Duration::from_millis(5), true);
            balancer.on_complete(&set[1], Duration::from_millis(500), true);
        }

        let mut fast = 0;
        for _ in 0..200 {
            if balancer.select("users", &set).unwrap().host == set[0].host {
                fast += 1;
            }
        }
        // ~99% expected; anything above 150/200 shows the bias held.
        assert!(fast > 150, "fast instance picked only {}/200 times", fast);
    }

    #[test]
    fn sticky_select_is_deterministic() {
        let set = instances(4);
        let a = sticky_select("session-abc", &set).unwrap();
        let b = sticky_select("session-abc", &set).unwrap();
        assert_eq!(a.host, b.host);
    }

    #[test]
    fn empty_instance_set_yields_none() {
        let balancer = RoundRobinBalancer::new();
        assert!(balancer.select("users", &[]).is_none());
        assert!(RandomBalancer::new().select("users", &[]).is_none());
        assert!(sticky_select("s", &[]).is_none());
    }
}
