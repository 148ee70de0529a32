//! Wicket API Gateway Server
//!
//! Server entry point: loads and validates configuration, wires the pipeline
//! subsystems explicitly, spawns the background loops (route refresh, health
//! probes, trace sweeper) and runs the HTTP server with a catch-all proxy
//! route. Shutdown is graceful: inflight requests drain before exit.

use wicket_rs::config::settings::load_settings;
use wicket_rs::config::validation::ConfigValidator;
use wicket_rs::logs::logger::configure_logger;
use wicket_rs::models::settings::Settings;
use wicket_rs::pipeline::auth::{
    AuthVerifier, JwtTokenValidator, MemoryRevocationSet, MemorySessionStore,
};
use wicket_rs::pipeline::client_info::ClientIdentifier;
use wicket_rs::pipeline::rate_limit::RateLimitEngine;
use wicket_rs::pipeline::{configure_proxy, Pipeline};
use wicket_rs::services::circuit_breaker::BreakerRegistry;
use wicket_rs::services::counter_store::MemoryCounterStore;
use wicket_rs::services::forwarder::Forwarder;
use wicket_rs::services::health::HealthChecker;
use wicket_rs::services::load_balancer::LoadBalancerFactory;
use wicket_rs::services::registry::{InstanceCache, ServiceInstance, ServiceRegistry, StaticRegistry};
use wicket_rs::services::route_resolver::{FileRouteStore, RouteResolver, RouteStore};
use wicket_rs::services::trace::{LogSink, TraceRecorder};

use actix_web::{middleware::Logger, App, HttpServer};
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    configure_logger();

    let config: Settings = match load_settings() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load settings: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "starting wicket gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    let validation = ConfigValidator::validate_comprehensive(&config);
    for warning in &validation.warnings {
        warn!("config: {}", warning);
    }
    if !validation.is_valid() {
        error!("configuration validation failed:");
        for e in &validation.errors {
            error!("  - {}", e);
        }
        std::process::exit(1);
    }
    info!(
        "configuration validated with {} warnings",
        validation.warnings.len()
    );

    // Registry: static instance sets from config, cached with health state.
    let mut services = HashMap::new();
    for service in &config.services {
        let instances: Vec<ServiceInstance> = service
            .instances
            .iter()
            .map(|i| ServiceInstance::new(&service.name, &i.scheme, &i.host, i.port, i.weight))
            .collect();
        services.insert(service.name.clone(), instances);
    }
    let registry: Arc<dyn ServiceRegistry> = Arc::new(StaticRegistry::new(services));
    let instance_cache = Arc::new(InstanceCache::new(Duration::from_secs(
        config.registry_stale_after_seconds,
    )));
    if let Err(e) = instance_cache.refresh(registry.as_ref()).await {
        warn!("initial registry refresh failed: {}", e);
    }
    let _registry_refresh = instance_cache.clone().spawn_refresh_loop(
        registry,
        Duration::from_secs(config.route_refresh_interval_seconds.max(1)),
    );

    // Routes: initial snapshot must load; later refreshes tolerate outages.
    let route_store: Arc<dyn RouteStore> = Arc::new(FileRouteStore::new(config.routes_path.clone()));
    let initial_routes = match route_store.load().await {
        Ok(routes) => routes,
        Err(e) => {
            error!("failed to load routes from {}: {}", config.routes_path, e);
            std::process::exit(1);
        }
    };
    let resolver = match RouteResolver::new(route_store, initial_routes) {
        Ok(resolver) => Arc::new(resolver),
        Err(e) => {
            error!("invalid route definitions: {}", e);
            std::process::exit(1);
        }
    };
    let _route_refresh = resolver.clone().spawn_refresh_loop(Duration::from_secs(
        config.route_refresh_interval_seconds.max(1),
    ));

    // Trace recorder with background sweeper.
    let tracer = Arc::new(TraceRecorder::new(
        config.trace.capacity,
        Duration::from_secs(config.trace.ttl_seconds),
        Arc::new(LogSink),
    ));
    let _trace_sweeper = tracer.clone().spawn_sweeper(Duration::from_secs(30));

    // Health loop feeding the instance cache.
    let health_checker = Arc::new(HealthChecker::new(
        instance_cache.clone(),
        config.health_check.clone(),
    ));
    let _health_loop = health_checker.spawn();

    // Pipeline wiring.
    let balancer = LoadBalancerFactory::create(config.load_balancer.algorithm);
    let forwarder = Arc::new(Forwarder::new(
        instance_cache,
        balancer,
        config.timeouts.clone(),
        config.retry.clone(),
        Duration::from_secs(config.request_timeout_seconds),
    ));
    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
    let counter_store = Arc::new(MemoryCounterStore::new());
    let rate_limiter = RateLimitEngine::new(
        counter_store,
        config.rate_limit.clone(),
        tracer.clone(),
    );
    let authenticator = AuthVerifier::new(
        Arc::new(JwtTokenValidator::new(&config.security.jwt)),
        Arc::new(MemoryRevocationSet::new()),
        Arc::new(MemorySessionStore::new()),
        &config.security.whitelist.skip_paths,
        &config.security.jwt,
    );
    let client_identifier = ClientIdentifier::new(
        &config.security.whitelist.cidr,
        &config.security.whitelist.ip,
    );

    let pipeline = Arc::new(Pipeline::new(
        client_identifier,
        rate_limiter,
        authenticator,
        breakers,
        resolver,
        forwarder,
        tracer,
    ));

    let bind_addr = (config.server.host.clone(), config.server.port);
    let body_limit = config.server.body_limit_bytes;
    info!("gateway listening on {}:{}", bind_addr.0, bind_addr.1);

    HttpServer::new(move || {
        let pipeline = pipeline.clone();
        App::new()
            .wrap(Logger::default())
            .configure(move |cfg| configure_proxy(cfg, pipeline, body_limit))
    })
    .bind(bind_addr)?
    .run()
    .await
}
