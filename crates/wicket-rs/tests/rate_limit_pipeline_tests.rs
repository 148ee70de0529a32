//! Rate limiting through the full pipeline: denial headers and the
//! fail-open behavior when the counter store is down.

mod support;

use actix_web::{test, App};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use support::{build_gateway, uri_route, GatewayOptions, ScriptedUpstream};
use wicket_rs::models::settings::{DimensionSettings, RateLimitAlgorithm};
use wicket_rs::pipeline::configure_proxy;
use wicket_rs::pipeline::rate_limit::STORE_UNAVAILABLE_COUNTER;
use wicket_rs::services::counter_store::{CounterStore, CounterVerdict, StoreError};

macro_rules! init_app {
    ($gw:expr) => {{
        let pipeline = $gw.pipeline.clone();
        test::init_service(
            App::new().configure(move |cfg| configure_proxy(cfg, pipeline, 10 * 1024 * 1024)),
        )
        .await
    }};
}

fn request_from(ip: &'static str, uri: &'static str) -> actix_web::test::TestRequest {
    test::TestRequest::get()
        .uri(uri)
        .insert_header(("X-Forwarded-For", ip))
}

#[actix_web::test]
async fn ip_limit_denies_with_rate_limit_headers() {
    let upstream = ScriptedUpstream::spawn(vec![(200, "ok")]).await;

    let mut options = GatewayOptions::default();
    options.routes = vec![uri_route("public", "/api/public/**", &upstream.base_url)];
    options.rate_limit.ip = DimensionSettings {
        enabled: true,
        limit: 5,
        window_seconds: 60,
        algorithm: RateLimitAlgorithm::SlidingWindow,
    };
    let gw = build_gateway(options).await;
    let app = init_app!(gw);

    // The first five requests inside the window forward.
    for i in 0..5 {
        let resp = test::call_service(
            &app,
            request_from("203.0.113.7", "/api/public/x").to_request(),
        )
        .await;
        assert_eq!(resp.status().as_u16(), 200, "request {} denied early", i);
    }

    // The sixth is denied with the full header set.
    let resp = test::call_service(
        &app,
        request_from("203.0.113.7", "/api/public/x").to_request(),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 429);
    assert_eq!(
        resp.headers()
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok()),
        Some("0")
    );
    assert_eq!(
        resp.headers()
            .get("X-RateLimit-Type")
            .and_then(|v| v.to_str().ok()),
        Some("ip")
    );
    let retry_after: u64 = resp
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .expect("Retry-After header");
    assert!(retry_after <= 60);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], 429);
    assert_eq!(body["limitType"], "ip");

    // A different client IP is unaffected.
    let resp = test::call_service(
        &app,
        request_from("198.51.100.9", "/api/public/x").to_request(),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 200);

    assert_eq!(upstream.request_count(), 6);
}

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

#[actix_web::test]
async fn counter_store_outage_fails_open() {
    let upstream = ScriptedUpstream::spawn(vec![(200, "ok")]).await;

    let mut options = GatewayOptions::default();
    options.routes = vec![uri_route("public", "/api/public/**", &upstream.base_url)];
    options.rate_limit.ip = DimensionSettings {
        enabled: true,
        limit: 1,
        window_seconds: 60,
        algorithm: RateLimitAlgorithm::SlidingWindow,
    };
    options.counter_store = Arc::new(DownStore);
    let gw = build_gateway(options).await;
    let app = init_app!(gw);

    // Far more requests than the limit; every one is admitted.
    for _ in 0..20 {
        let resp = test::call_service(
            &app,
            request_from("203.0.113.7", "/api/public/x").to_request(),
        )
        .await;
        assert_eq!(resp.status().as_u16(), 200);
        // Fail-open admissions carry no rate-limit headers.
        assert!(resp.headers().get("X-RateLimit-Remaining").is_none());
    }

    assert_eq!(gw.tracer.counter(STORE_UNAVAILABLE_COUNTER), 20);
    assert_eq!(upstream.request_count(), 20);
}
