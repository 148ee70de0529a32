//! Instance failover: health-loop exclusion of unhealthy instances and
//! retry-driven failover onto live instances.

mod support;

use actix_web::{test, App};
use std::collections::HashMap;
use support::{build_gateway, instance_from, service_route, GatewayOptions, ScriptedUpstream};
use wicket_rs::pipeline::configure_proxy;

macro_rules! init_app {
    ($gw:expr) => {{
        let pipeline = $gw.pipeline.clone();
        test::init_service(
            App::new().configure(move |cfg| configure_proxy(cfg, pipeline, 10 * 1024 * 1024)),
        )
        .await
    }};
}

#[actix_web::test]
async fn unhealthy_instances_receive_no_traffic() {
    let upstream_a = ScriptedUpstream::spawn(vec![(200, "a")]).await;
    let upstream_b = ScriptedUpstream::spawn(vec![(200, "b")]).await;

    let instance_a = instance_from("users", &upstream_a.base_url);
    let instance_b = instance_from("users", &upstream_b.base_url);
    let unhealthy_id = instance_a.instance_id.clone();

    let mut services = HashMap::new();
    services.insert("users".to_string(), vec![instance_a, instance_b]);

    let mut options = GatewayOptions::default();
    options.routes = vec![service_route("users", "/api/public/users/**", "users")];
    options.services = services;
    let gw = build_gateway(options).await;
    let app = init_app!(gw);

    // Three consecutive probe failures mark instance A unhealthy.
    for _ in 0..3 {
        gw.cache.record_probe(&unhealthy_id, false, 2, 3);
    }
    assert!(!gw.cache.is_healthy(&unhealthy_id));

    // Every subsequent request lands on instance B.
    for _ in 0..10 {
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/public/users/1")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status().as_u16(), 200);
    }

    assert_eq!(upstream_a.request_count(), 0);
    assert_eq!(upstream_b.request_count(), 10);
}

#[actix_web::test]
async fn connection_errors_retry_onto_a_live_instance() {
    let live = ScriptedUpstream::spawn(vec![(200, "ok")]).await;

    // A bound-then-dropped listener gives a port that refuses connections.
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    };
    let dead = wicket_rs::services::registry::ServiceInstance::new(
        "users", "http", "127.0.0.1", dead_port, 1,
    );

    let mut services = HashMap::new();
    services.insert(
        "users".to_string(),
        vec![dead, instance_from("users", &live.base_url)],
    );

    let mut options = GatewayOptions::default();
    options.routes = vec![service_route("users", "/api/public/users/**", "users")];
    options.services = services;
    let gw = build_gateway(options).await;
    let app = init_app!(gw);

    // Round-robin alternates over both instances; connection errors retry
    // with a fresh selection, so every request still succeeds.
    for i in 0..4 {
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/public/users/1")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status().as_u16(), 200, "request {} failed over", i);
    }

    assert_eq!(live.request_count(), 4);
}
