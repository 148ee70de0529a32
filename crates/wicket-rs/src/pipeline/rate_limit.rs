//! Multi-dimension admission control.
//!
//! Dimensions are evaluated in fixed order (IP, User, API, Tenant, Global),
//! short-circuiting on the first denial. Anonymous requests skip the User
//! dimension; requests without a tenant skip Tenant. Every verdict is pushed
//! into the context so the response can carry the `X-RateLimit-*` headers.
//!
//! The engine fails open: when the counter store is unreachable the request
//! is admitted, the `rate-limit-store-unavailable` counter is bumped and no
//! decision is recorded. An internal outage never blocks traffic.

use crate::context::{DeviceKind, RateLimitDecision, RateLimitDimension, RequestContext};
use crate::models::error::GatewayError;
use crate::models::settings::{DimensionSettings, RateLimitAlgorithm, RateLimitSettings};
use crate::services::counter_store::{CounterStore, CounterVerdict, StoreError};
use crate::services::trace::TraceRecorder;
use chrono::Utc;
use log::{debug, warn};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

use crate::utils::path::compile_glob;

pub const STORE_UNAVAILABLE_COUNTER: &str = "rate-limit-store-unavailable";

pub struct RateLimitEngine {
    store: Arc<dyn CounterStore>,
    settings: RateLimitSettings,
    tracer: Arc<TraceRecorder>,
    whitelist: Vec<Regex>,
    route_overrides: Vec<(Regex, u64)>,
}

impl RateLimitEngine {
    pub fn new(
        store: Arc<dyn CounterStore>,
        settings: RateLimitSettings,
        tracer: Arc<TraceRecorder>,
    ) -> Self {
        let whitelist = settings
            .whitelist_paths
            .iter()
            .filter_map(|p| compile_glob(p).ok())
            .collect();
        let route_overrides = settings
            .route_overrides
            .iter()
            .filter_map(|o| compile_glob(&o.path).ok().map(|re| (re, o.limit)))
            .collect();

        Self {
            store,
            settings,
            tracer,
            whitelist,
            route_overrides,
        }
    }

    /// Runs every enabled dimension against the request.
    ///
    /// Returns `Ok(())` when admitted; a denial carries everything the error
    /// envelope needs (limit, remaining, reset, retry-after).
    pub async fn check(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        if self.is_whitelisted(&ctx.path) {
            debug!("path {} bypasses rate limiting", ctx.path);
            return Ok(());
        }

        for dimension in [
            RateLimitDimension::Ip,
            RateLimitDimension::User,
            RateLimitDimension::Api,
            RateLimitDimension::Tenant,
            RateLimitDimension::Global,
        ] {
            let settings = self.dimension_settings(dimension);
            if !settings.enabled {
                continue;
            }

            let Some((key, limit)) = self.key_and_limit(dimension, settings, ctx) else {
                continue;
            };

            let verdict = self.consult_store(&key, limit, settings).await;
            let verdict = match verdict {
                Ok(v) => v,
                Err(StoreError::Unavailable(reason)) => {
                    // Fail open; never block traffic on an internal outage.
                    warn!(
                        "counter store unavailable for {} ({}), admitting request",
                        key, reason
                    );
                    self.tracer.increment_counter(STORE_UNAVAILABLE_COUNTER);
                    continue;
                }
            };

            let decision = RateLimitDecision {
                dimension,
                algorithm: settings.algorithm.as_str(),
                limit,
                remaining: verdict.remaining,
                reset_epoch_secs: verdict.reset_epoch_secs,
                allowed: verdict.allowed,
            };
            ctx.with_rate_decision(decision);

            if !verdict.allowed {
                let retry_after_secs = (verdict.reset_epoch_secs - Utc::now().timestamp()).max(0) as u64;
                return Err(GatewayError::RateLimited {
                    limit_type: dimension.as_str().to_string(),
                    algorithm: settings.algorithm.as_str().to_string(),
                    limit,
                    remaining: verdict.remaining,
                    reset_epoch_secs: verdict.reset_epoch_secs,
                    retry_after_secs,
                });
            }
        }

        Ok(())
    }

    fn is_whitelisted(&self, path: &str) -> bool {
        self.whitelist.iter().any(|re| re.is_match(path))
    }

    fn dimension_settings(&self, dimension: RateLimitDimension) -> &DimensionSettings {
        match dimension {
            RateLimitDimension::Ip => &self.settings.ip,
            RateLimitDimension::User => &self.settings.user,
            RateLimitDimension::Api => &self.settings.api,
            RateLimitDimension::Tenant => &self.settings.tenant,
            RateLimitDimension::Global => &self.settings.global,
        }
    }

    /// Key and effective limit for one dimension, or `None` to skip it.
    fn key_and_limit(
        &self,
        dimension: RateLimitDimension,
        settings: &DimensionSettings,
        ctx: &RequestContext,
    ) -> Option<(String, u64)> {
        match dimension {
            RateLimitDimension::Ip => {
                let client = ctx.client.as_ref()?;
                let mut limit = settings.limit;
                if client.trusted {
                    limit *= 5;
                }
                if client.device == DeviceKind::Mobile {
                    limit *= 2;
                }
                Some((format!("ip:{}", client.ip), limit))
            }
            RateLimitDimension::User => {
                let identity = ctx.identity.as_ref()?;
                let mut limit = settings.limit;
                if identity.has_role("premium") {
                    limit *= 3;
                }
                Some((format!("user:{}", identity.user_id), limit))
            }
            RateLimitDimension::Api => {
                let limit = self
                    .route_overrides
                    .iter()
                    .find(|(re, _)| re.is_match(&ctx.path))
                    .map(|(_, limit)| *limit)
                    .unwrap_or(settings.limit);
                Some((format!("api:{}:{}", ctx.method, ctx.path), limit))
            }
            RateLimitDimension::Tenant => {
                let tenant = ctx.identity.as_ref()?.tenant_id.as_ref()?;
                Some((format!("tenant:{}", tenant), settings.limit))
            }
            RateLimitDimension::Global => Some(("global".to_string(), settings.limit)),
        }
    }

    async fn consult_store(
        &self,
        key: &str,
        limit: u64,
        settings: &DimensionSettings,
    ) -> Result<CounterVerdict, StoreError> {
        let window = Duration::from_secs(settings.window_seconds);
        match settings.algorithm {
            RateLimitAlgorithm::SlidingWindow => {
                self.store.check_sliding_window(key, window, limit).await
            }
            RateLimitAlgorithm::TokenBucket => {
                let refill = limit as f64 / settings.window_seconds.max(1) as f64;
                self.store.check_token_bucket(key, limit as f64, refill).await
            }
            RateLimitAlgorithm::FixedWindow => {
                self.store.check_fixed_window(key, window, limit).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Identity;
    use crate::services::counter_store::MemoryCounterStore;
    use crate::services::trace::{LogSink, TraceRecorder};
    use actix_web::test::TestRequest;
    use async_trait::async_trait;

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn check_sliding_window(
            &self,
            _key: &str,
            _window: Duration,
            _limit: u64,
        ) -> Result<CounterVerdict, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn check_token_bucket(
            &self,
            _key: &str,
            _capacity: f64,
            _refill: f64,
        ) -> Result<CounterVerdict, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn check_fixed_window(
            &self,
            _key: &str,
            _window: Duration,
            _limit: u64,
        ) -> Result<CounterVerdict, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn tracer() -> Arc<TraceRecorder> {
        Arc::new(TraceRecorder::new(
            100,
            Duration::from_secs(60),
            Arc::new(LogSink),
        ))
    }

    fn ctx_with_ip(ip: &str) -> RequestContext {
        let req = TestRequest::get().uri("/api/public/x").to_http_request();
        let mut ctx = RequestContext::new(&req);
        ctx.client = Some(crate::context::ClientDescriptor {
            ip: ip.to_string(),
            user_agent: None,
            device: DeviceKind::Desktop,
            bot: false,
            trusted: false,
        });
        ctx
    }

    fn ip_only_settings(limit: u64) -> RateLimitSettings {
        let mut settings = RateLimitSettings::default();
        settings.ip = DimensionSettings {
            enabled: true,
            limit,
            window_seconds: 60,
            algorithm: RateLimitAlgorithm::SlidingWindow,
        };
        settings
    }

    #[tokio::test]
    async fn denies_past_the_ip_limit() {
        let engine = RateLimitEngine::new(
            Arc::new(MemoryCounterStore::new()),
            ip_only_settings(3),
            tracer(),
        );

        for _ in 0..3 {
            let mut ctx = ctx_with_ip("203.0.113.7");
            assert!(engine.check(&mut ctx).await.is_ok());
        }

        let mut ctx = ctx_with_ip("203.0.113.7");
        let err = engine.check(&mut ctx).await.unwrap_err();
        match err {
            GatewayError::RateLimited {
                limit_type,
                remaining,
                ..
            } => {
                assert_eq!(limit_type, "ip");
                assert_eq!(remaining, 0);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn trusted_clients_get_a_larger_ip_budget() {
        let engine = RateLimitEngine::new(
            Arc::new(MemoryCounterStore::new()),
            ip_only_settings(1),
            tracer(),
        );

        // Trusted multiplier (5x) admits five requests where one would pass.
        for i in 0..5 {
            let mut ctx = ctx_with_ip("10.1.2.3");
            ctx.client.as_mut().unwrap().trusted = true;
            assert!(engine.check(&mut ctx).await.is_ok(), "request {} denied", i);
        }

        let mut ctx = ctx_with_ip("10.1.2.3");
        ctx.client.as_mut().unwrap().trusted = true;
        assert!(engine.check(&mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn premium_users_get_a_larger_user_budget() {
        let mut settings = RateLimitSettings::default();
        settings.ip.enabled = false;
        settings.user = DimensionSettings {
            enabled: true,
            limit: 1,
            window_seconds: 60,
            algorithm: RateLimitAlgorithm::SlidingWindow,
        };

        let engine =
            RateLimitEngine::new(Arc::new(MemoryCounterStore::new()), settings, tracer());

        for _ in 0..3 {
            let mut ctx = ctx_with_ip("203.0.113.7");
            ctx.with_identity(Identity {
                user_id: "u1".into(),
                tenant_id: None,
                roles: vec!["premium".into()],
                client_id: None,
            });
            assert!(engine.check(&mut ctx).await.is_ok());
        }

        let mut ctx = ctx_with_ip("203.0.113.7");
        ctx.with_identity(Identity {
            user_id: "u1".into(),
            tenant_id: None,
            roles: vec!["premium".into()],
            client_id: None,
        });
        assert!(engine.check(&mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn anonymous_requests_skip_the_user_dimension() {
        let mut settings = RateLimitSettings::default();
        settings.ip.enabled = false;
        settings.user = DimensionSettings {
            enabled: true,
            limit: 0,
            window_seconds: 60,
            algorithm: RateLimitAlgorithm::SlidingWindow,
        };

        let engine =
            RateLimitEngine::new(Arc::new(MemoryCounterStore::new()), settings, tracer());

        // limit 0 would deny everything, but no identity means no check.
        let mut ctx = ctx_with_ip("203.0.113.7");
        assert!(engine.check(&mut ctx).await.is_ok());
        assert!(ctx.rate_decisions.is_empty());
    }

    #[tokio::test]
    async fn whitelisted_paths_bypass_the_engine() {
        let mut settings = ip_only_settings(0);
        settings.whitelist_paths = vec!["/actuator/**".to_string()];

        let engine =
            RateLimitEngine::new(Arc::new(MemoryCounterStore::new()), settings, tracer());

        let req = TestRequest::get().uri("/actuator/health").to_http_request();
        let mut ctx = RequestContext::new(&req);
        ctx.client = Some(crate::context::ClientDescriptor {
            ip: "203.0.113.7".into(),
            user_agent: None,
            device: DeviceKind::Desktop,
            bot: false,
            trusted: false,
        });
        assert!(engine.check(&mut ctx).await.is_ok());
    }

    #[tokio::test]
    async fn store_outage_fails_open_and_counts() {
        let tracer = tracer();
        let engine = RateLimitEngine::new(Arc::new(DownStore), ip_only_settings(1), tracer.clone());

        for _ in 0..5 {
            let mut ctx = ctx_with_ip("203.0.113.7");
            assert!(engine.check(&mut ctx).await.is_ok());
            // Fail-open admissions record no decision, so responses omit the
            // X-RateLimit-* headers.
            assert!(ctx.rate_decisions.is_empty());
        }

        assert_eq!(tracer.counter(STORE_UNAVAILABLE_COUNTER), 5);
    }

    #[tokio::test]
    async fn route_override_tightens_the_api_limit() {
        let mut settings = RateLimitSettings::default();
        settings.ip.enabled = false;
        settings.api = DimensionSettings {
            enabled: true,
            limit: 100,
            window_seconds: 60,
            algorithm: RateLimitAlgorithm::SlidingWindow,
        };
        settings.route_overrides = vec![crate::models::settings::RouteLimitOverride {
            path: "/api/public/**".to_string(),
            limit: 1,
        }];

        let engine =
            RateLimitEngine::new(Arc::new(MemoryCounterStore::new()), settings, tracer());

        let mut ctx = ctx_with_ip("203.0.113.7");
        assert!(engine.check(&mut ctx).await.is_ok());
        let mut ctx = ctx_with_ip("203.0.113.7");
        assert!(engine.check(&mut ctx).await.is_err());
    }
}
