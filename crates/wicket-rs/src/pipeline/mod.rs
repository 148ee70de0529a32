//! The request processing pipeline.
//!
//! [`Pipeline::handle`] drives every inbound request through the ordered
//! filter chain: trace start, client identification, rate limiting,
//! authentication, route matching, breaker reservation, instance selection
//! and forwarding, breaker recording, trace completion. Filters communicate
//! through [`FilterOutcome`]; the coordinator pattern-matches and never uses
//! panics for control flow.
//!
//! Error mapping, response shaping (trace, timing, rate-limit and security
//! headers, cache-control families) and breaker fallbacks all live here so
//! the subsystems stay single-purpose.

pub mod auth;
pub mod client_info;
pub mod rate_limit;

use crate::context::{RequestContext, RequestOutcome};
use crate::models::error::GatewayError;
use crate::services::circuit_breaker::{Admission, BreakerRegistry, CallOutcome, CircuitBreaker};
use crate::services::forwarder::{Forwarder, UpstreamReply};
use crate::services::route_resolver::{CompiledRoute, RouteResolver};
use crate::services::trace::TraceRecorder;
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use log::{debug, error, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use auth::AuthVerifier;
use client_info::ClientIdentifier;
use rate_limit::RateLimitEngine;

/// What a filter decided about the request.
pub enum FilterOutcome {
    /// Pass control to the next filter.
    Continue,
    /// Stop the chain and return this response as-is (plus shaping).
    ShortCircuit(HttpResponse),
    /// Stop the chain and render the error envelope.
    Error(GatewayError),
}

impl FilterOutcome {
    fn from_result(result: Result<(), GatewayError>) -> Self {
        match result {
            Ok(()) => FilterOutcome::Continue,
            Err(e) => FilterOutcome::Error(e),
        }
    }
}

/// Endpoints answered by the gateway itself, never forwarded.
const GATEWAY_HEALTH_PATHS: &[&str] = &["/actuator/health", "/api/health"];

/// Upstream response headers never copied downstream.
const SKIP_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "content-length",
];

/// The pipeline coordinator.
///
/// Explicit constructor wiring; every collaborator seam has a production
/// implementation and accepts a test fake.
pub struct Pipeline {
    client_identifier: ClientIdentifier,
    rate_limiter: RateLimitEngine,
    authenticator: AuthVerifier,
    breakers: Arc<BreakerRegistry>,
    resolver: Arc<RouteResolver>,
    forwarder: Arc<Forwarder>,
    tracer: Arc<TraceRecorder>,
}

impl Pipeline {
    pub fn new(
        client_identifier: ClientIdentifier,
        rate_limiter: RateLimitEngine,
        authenticator: AuthVerifier,
        breakers: Arc<BreakerRegistry>,
        resolver: Arc<RouteResolver>,
        forwarder: Arc<Forwarder>,
        tracer: Arc<TraceRecorder>,
    ) -> Self {
        Self {
            client_identifier,
            rate_limiter,
            authenticator,
            breakers,
            resolver,
            forwarder,
            tracer,
        }
    }

    /// Handles one request end to end.
    pub async fn handle(&self, req: HttpRequest, body: web::Bytes) -> HttpResponse {
        let mut ctx = RequestContext::new(&req);
        self.tracer.start(&ctx);

        // If the client disconnects, actix drops this future; the guard
        // records the cancellation from the trace map.
        let mut guard = CancelGuard {
            tracer: self.tracer.clone(),
            trace_id: ctx.trace_id.clone(),
            armed: true,
        };

        let response = self.run(&req, body, &mut ctx).await;
        guard.armed = false;

        let (mut response, error_kind) = match response {
            Ok(resp) => {
                let outcome = if resp.status().is_server_error() {
                    RequestOutcome::Failed
                } else {
                    RequestOutcome::Completed
                };
                ctx.mark(outcome);
                (resp, None)
            }
            Err(e) => {
                let outcome = match e {
                    GatewayError::UpstreamTimeout { .. } => RequestOutcome::Timeout,
                    _ => RequestOutcome::Failed,
                };
                ctx.mark(outcome);
                if matches!(e, GatewayError::Internal { .. }) {
                    error!("internal error on trace {}: {}", ctx.trace_id, e);
                }
                (e.to_response(&ctx.trace_id), Some(e.kind().to_string()))
            }
        };

        self.shape_response(&ctx, &mut response);
        self.tracer
            .complete(&ctx, Some(response.status().as_u16()), error_kind);

        response
    }

    /// The ordered filter chain.
    async fn run(
        &self,
        req: &HttpRequest,
        body: web::Bytes,
        ctx: &mut RequestContext,
    ) -> Result<HttpResponse, GatewayError> {
        // Client-Identify
        self.client_identifier.identify(req, ctx);

        // Gateway-served health endpoints short-circuit before admission
        // control; they belong to every whitelist.
        if let FilterOutcome::ShortCircuit(resp) = self.serve_gateway_endpoints(ctx) {
            return Ok(resp);
        }

        // Rate-Limit
        match FilterOutcome::from_result(self.rate_limiter.check(ctx).await) {
            FilterOutcome::Error(e) => return Err(e),
            _ => {}
        }

        // Auth
        match FilterOutcome::from_result(self.authenticator.verify(req, ctx).await) {
            FilterOutcome::Error(e) => return Err(e),
            _ => {}
        }

        // Route-Match (breakers are keyed by route id, so matching precedes
        // the breaker reservation; instance selection happens later).
        let Some(route) = self.resolver.resolve(&ctx.method, &ctx.path, req.headers()) else {
            return Err(GatewayError::NoRoute {
                path: ctx.path.clone(),
            });
        };
        ctx.route_id = Some(route.route.id.clone());
        debug!("trace {} matched route {}", ctx.trace_id, route.route.id);

        // Circuit-Reserve
        let breaker = self
            .breakers
            .get_or_create(&route.route.id, route.route.policy.breaker.as_ref());

        match breaker.try_acquire() {
            Admission::Admitted => {
                ctx.breaker_admitted = Some(true);
            }
            Admission::Rejected { retry_after } => {
                ctx.breaker_admitted = Some(false);
                warn!(
                    "breaker open for route {}, rejecting trace {}",
                    route.route.id, ctx.trace_id
                );

                let open_error = GatewayError::BreakerOpen {
                    route_id: route.route.id.clone(),
                    retry_after_secs: retry_after.as_secs().max(1),
                };
                return match self.try_fallback(req, body, &route, ctx).await {
                    Some(resp) => Ok(resp),
                    None => Err(open_error),
                };
            }
        }

        // Instance-Select + Forward
        let deadline = self.forwarder.deadline_for(&route, ctx);
        let call_started = Instant::now();
        let result = self
            .forwarder
            .dispatch(req, body.clone(), &route, ctx, deadline, None)
            .await;
        let call_duration = call_started.elapsed();

        // Circuit-Record
        match &result {
            Ok(_) => breaker.record(CallOutcome::Success(call_duration)),
            Err(GatewayError::UpstreamTimeout { .. }) | Err(GatewayError::UpstreamError { .. }) => {
                breaker.record(CallOutcome::Failure(call_duration))
            }
            // No upstream call was made (e.g. no healthy instance); the
            // breaker window only tracks actual calls.
            Err(_) => {}
        }

        match result {
            Ok(reply) => Ok(self.upstream_to_response(reply)),
            Err(e) => {
                let upstream_5xx = matches!(
                    &e,
                    GatewayError::UpstreamError { status: Some(s), .. } if *s >= 500
                );
                if upstream_5xx {
                    if let Some(resp) = self.try_fallback(req, body, &route, ctx).await {
                        return Ok(resp);
                    }
                }
                Err(e)
            }
        }
    }

    fn serve_gateway_endpoints(&self, ctx: &RequestContext) -> FilterOutcome {
        if ctx.method == "GET" && GATEWAY_HEALTH_PATHS.contains(&ctx.path.as_str()) {
            return FilterOutcome::ShortCircuit(
                HttpResponse::Ok().json(json!({"status": "UP"})),
            );
        }
        FilterOutcome::Continue
    }

    /// One internal forward to the route's fallback URI, if declared.
    ///
    /// Absolute URIs go straight to the forwarder; gateway paths are
    /// re-resolved against the route table (one level, no breaker).
    async fn try_fallback(
        &self,
        req: &HttpRequest,
        body: web::Bytes,
        route: &CompiledRoute,
        ctx: &mut RequestContext,
    ) -> Option<HttpResponse> {
        let fallback = route.route.policy.fallback_uri.clone()?;
        debug!(
            "trace {} falling back to {} for route {}",
            ctx.trace_id, fallback, route.route.id
        );

        let deadline = self.forwarder.deadline_for(route, ctx);
        let result = if fallback.starts_with("http://") || fallback.starts_with("https://") {
            self.forwarder
                .forward_uri(&fallback, req, body, ctx, deadline)
                .await
        } else {
            let fallback_route = self
                .resolver
                .resolve(&ctx.method, &fallback, req.headers())?;
            self.forwarder
                .dispatch(req, body, &fallback_route, ctx, deadline, Some(&fallback))
                .await
        };

        match result {
            Ok(reply) => Some(self.upstream_to_response(reply)),
            Err(e) => {
                warn!("fallback {} failed: {}", fallback, e);
                None
            }
        }
    }

    /// Copies status and safe headers, then streams the body downstream.
    fn upstream_to_response(&self, reply: UpstreamReply) -> HttpResponse {
        let status =
            StatusCode::from_u16(reply.status()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut builder = HttpResponse::build(status);

        for (name, value) in reply.headers() {
            let lowered = name.as_str().to_ascii_lowercase();
            if SKIP_RESPONSE_HEADERS.contains(&lowered.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                builder.insert_header((name, value));
            }
        }

        builder.streaming(reply.into_body_stream())
    }

    /// Response shaping applied to every downstream response.
    fn shape_response(&self, ctx: &RequestContext, response: &mut HttpResponse) {
        let headers = response.headers_mut();

        if let Ok(value) = HeaderValue::from_str(&ctx.trace_id) {
            headers.insert(HeaderName::from_static("x-trace-id"), value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("{}ms", ctx.elapsed().as_millis())) {
            headers.insert(HeaderName::from_static("x-response-time"), value);
        }

        if let Some(decision) = ctx.last_rate_decision() {
            let pairs = [
                ("x-ratelimit-limit", decision.limit.to_string()),
                ("x-ratelimit-remaining", decision.remaining.to_string()),
                ("x-ratelimit-reset", decision.reset_epoch_secs.to_string()),
                ("x-ratelimit-type", decision.dimension.as_str().to_string()),
                ("x-ratelimit-algorithm", decision.algorithm.to_string()),
            ];
            for (name, value) in pairs {
                if let Ok(value) = HeaderValue::from_str(&value) {
                    headers.insert(HeaderName::from_static(name), value);
                }
            }
        }

        for (name, value) in &ctx.response_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        let security = [
            ("x-content-type-options", "nosniff"),
            ("x-frame-options", "DENY"),
            ("x-xss-protection", "1; mode=block"),
            (
                "strict-transport-security",
                "max-age=31536000; includeSubDomains",
            ),
            ("content-security-policy", "default-src 'self'"),
        ];
        for (name, value) in security {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }

        let cache_control = cache_control_for(&ctx.path);
        headers.insert(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static(cache_control),
        );
    }
}

/// Cache-Control by path family: admin/auth never cache, health and metrics
/// cache briefly, everything else revalidates.
fn cache_control_for(path: &str) -> &'static str {
    if path.starts_with("/api/admin") || path.starts_with("/api/auth") {
        "no-store"
    } else if path.contains("health") || path.contains("metrics") {
        "public, max-age=30"
    } else {
        "no-cache"
    }
}

struct CancelGuard {
    tracer: Arc<TraceRecorder>,
    trace_id: String,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.tracer.cancel(&self.trace_id);
        }
    }
}

/// Wires the catch-all proxy resource into an actix service config.
///
/// The payload limit enforces the inbound body hard cap; the `/{tail:.*}`
/// pattern hands every path to the pipeline.
pub fn configure_proxy(
    cfg: &mut web::ServiceConfig,
    pipeline: Arc<Pipeline>,
    body_limit_bytes: usize,
) {
    cfg.app_data(web::PayloadConfig::new(body_limit_bytes))
        .app_data(web::JsonConfig::default().limit(body_limit_bytes))
        .service(web::resource("/{tail:.*}").to(
            move |req: HttpRequest, body: web::Bytes| {
                let pipeline = pipeline.clone();
                async move { pipeline.handle(req, body).await }
            },
        ));
}
