//! Shared harness for pipeline integration tests: a minimal scripted
//! upstream server plus explicit gateway wiring with fakes where needed.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use wicket_rs::models::route::{
    BreakerSettings, RetryConfig, Route, RoutePolicy, RouteStatus, RouteTarget,
};
use wicket_rs::models::settings::{
    DimensionSettings, JwtSettings, LoadBalancerKind, RateLimitSettings, TimeoutSettings,
};
use wicket_rs::pipeline::auth::{
    AuthVerifier, JwtTokenValidator, MemoryRevocationSet, MemorySessionStore,
};
use wicket_rs::pipeline::client_info::ClientIdentifier;
use wicket_rs::pipeline::rate_limit::RateLimitEngine;
use wicket_rs::pipeline::Pipeline;
use wicket_rs::services::circuit_breaker::BreakerRegistry;
use wicket_rs::services::counter_store::{CounterStore, MemoryCounterStore};
use wicket_rs::services::forwarder::Forwarder;
use wicket_rs::services::load_balancer::LoadBalancerFactory;
use wicket_rs::services::registry::{InstanceCache, ServiceInstance, StaticRegistry};
use wicket_rs::services::route_resolver::{RouteResolver, RouteStore};
use wicket_rs::services::trace::{LogSink, TraceRecorder};
use wicket_rs::services::counter_store::StoreError;

pub const TEST_SECRET: &str = "integration-test-secret-0123456789abcdef";

/// A scripted HTTP/1.1 upstream. Each accepted connection receives the next
/// `(status, body)` from the script (the last entry repeats); every raw
/// request is captured for assertions.
pub struct ScriptedUpstream {
    pub base_url: String,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl ScriptedUpstream {
    pub async fn spawn(script: Vec<(u16, &'static str)>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream listener");
        let addr = listener.local_addr().expect("upstream addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let captured = requests.clone();

        tokio::spawn(async move {
            let mut served = 0usize;
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };

                let mut buf = vec![0u8; 16384];
                let mut total = 0;
                loop {
                    match socket.read(&mut buf[total..]).await {
                        Ok(0) => break,
                        Ok(n) => {
                            total += n;
                            if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                            if total == buf.len() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }

                captured
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&buf[..total]).to_string());

                let (status, body) = script[served.min(script.len() - 1)];
                served += 1;
                let response = format!(
                    "HTTP/1.1 {} Scripted\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            requests,
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// True when any captured request carries `header: value`.
    pub fn saw_header(&self, header: &str, value: &str) -> bool {
        let needle = format!("{}: {}", header.to_ascii_lowercase(), value);
        self.requests
            .lock()
            .unwrap()
            .iter()
            .any(|raw| raw.to_ascii_lowercase().contains(&needle.to_ascii_lowercase()))
    }
}

struct VecRouteStore(Vec<Route>);

#[async_trait]
impl RouteStore for VecRouteStore {
    async fn load(&self) -> Result<Vec<Route>, StoreError> {
        Ok(self.0.clone())
    }
}

pub struct TestGateway {
    pub pipeline: Arc<Pipeline>,
    pub tracer: Arc<TraceRecorder>,
    pub breakers: Arc<BreakerRegistry>,
    pub cache: Arc<InstanceCache>,
}

pub struct GatewayOptions {
    pub routes: Vec<Route>,
    pub rate_limit: RateLimitSettings,
    pub counter_store: Arc<dyn CounterStore>,
    pub services: HashMap<String, Vec<ServiceInstance>>,
    pub breaker: BreakerSettings,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        // Rate limiting off by default; tests opt in per dimension.
        let mut rate_limit = RateLimitSettings::default();
        rate_limit.ip = DimensionSettings::disabled();

        Self {
            routes: Vec::new(),
            rate_limit,
            counter_store: Arc::new(MemoryCounterStore::new()),
            services: HashMap::new(),
            breaker: BreakerSettings::default(),
        }
    }
}

pub fn jwt_settings() -> JwtSettings {
    JwtSettings {
        secret: TEST_SECRET.to_string(),
        ..JwtSettings::default()
    }
}

pub async fn build_gateway(options: GatewayOptions) -> TestGateway {
    let cache = Arc::new(InstanceCache::new(Duration::from_secs(300)));
    let registry = StaticRegistry::new(options.services);
    cache.refresh(&registry).await.expect("registry refresh");

    let resolver = Arc::new(
        RouteResolver::new(Arc::new(VecRouteStore(options.routes)), Vec::new())
            .expect("route resolver"),
    );
    // The builder hands routes to the store; pull the initial snapshot.
    resolver.refresh().await.expect("route snapshot");

    let tracer = Arc::new(TraceRecorder::new(
        10_000,
        Duration::from_secs(300),
        Arc::new(LogSink),
    ));

    let forwarder = Arc::new(Forwarder::new(
        cache.clone(),
        LoadBalancerFactory::create(LoadBalancerKind::RoundRobin),
        TimeoutSettings::default(),
        RetryConfig::default(),
        Duration::from_secs(10),
    ));

    let breakers = Arc::new(BreakerRegistry::new(options.breaker));

    let rate_limiter =
        RateLimitEngine::new(options.counter_store, options.rate_limit, tracer.clone());

    let authenticator = AuthVerifier::new(
        Arc::new(JwtTokenValidator::new(&jwt_settings())),
        Arc::new(MemoryRevocationSet::new()),
        Arc::new(MemorySessionStore::new()),
        &[],
        &jwt_settings(),
    );

    let pipeline = Arc::new(Pipeline::new(
        ClientIdentifier::new(&[], &[]),
        rate_limiter,
        authenticator,
        breakers.clone(),
        resolver,
        forwarder,
        tracer.clone(),
    ));

    TestGateway {
        pipeline,
        tracer,
        breakers,
        cache,
    }
}

/// Builds a registry instance from a scripted upstream's base URL.
pub fn instance_from(service: &str, base_url: &str) -> ServiceInstance {
    let authority = base_url.strip_prefix("http://").expect("http base url");
    let (host, port) = authority.split_once(':').expect("host:port");
    ServiceInstance::new(service, "http", host, port.parse().expect("port"), 1)
}

pub fn uri_route(id: &str, path: &str, base_url: &str) -> Route {
    Route {
        id: id.to_string(),
        priority: 10,
        status: RouteStatus::Active,
        path: path.to_string(),
        methods: Vec::new(),
        headers: Vec::new(),
        target: RouteTarget::Uri(base_url.to_string()),
        strip_prefix: 0,
        add_headers: HashMap::new(),
        remove_headers: Vec::new(),
        preserve_host: false,
        policy: RoutePolicy::default(),
        tags: Vec::new(),
        metadata: HashMap::new(),
    }
}

pub fn service_route(id: &str, path: &str, service: &str) -> Route {
    let mut route = uri_route(id, path, "http://placeholder:1");
    route.target = RouteTarget::Service(service.to_string());
    route
}
