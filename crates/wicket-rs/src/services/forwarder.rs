//! Upstream request dispatch: instance selection, retries, streaming.
//!
//! The forwarder owns the pooled HTTP client. For each admitted request it
//! materializes the outbound header set (context overlay plus route
//! rewrites), selects an instance per attempt, and streams the upstream
//! response body back without buffering. Retries apply only to idempotent
//! methods and configured status codes, use exponential backoff with jitter,
//! and always share the request's deadline.

use crate::context::RequestContext;
use crate::models::error::GatewayError;
use crate::models::route::{RetryConfig, RouteTarget};
use crate::models::settings::TimeoutSettings;
use crate::services::load_balancer::{sticky_select, LoadBalancer};
use crate::services::registry::{InstanceCache, ServiceInstance};
use crate::services::route_resolver::CompiledRoute;
use crate::utils::path::format_route;
use actix_web::{web, HttpRequest};
use log::{debug, warn};
use reqwest::header::{HeaderMap as UpstreamHeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Response handle returned by a successful dispatch.
///
/// The body has not been read yet; `into_body_stream` hands it over for
/// zero-copy streaming to the client.
pub struct UpstreamReply {
    inner: reqwest::Response,
}

impl UpstreamReply {
    pub fn status(&self) -> u16 {
        self.inner.status().as_u16()
    }

    pub fn headers(&self) -> &UpstreamHeaderMap {
        self.inner.headers()
    }

    pub fn into_body_stream(
        self,
    ) -> impl futures_util::Stream<Item = Result<web::Bytes, reqwest::Error>> {
        self.inner.bytes_stream()
    }
}

pub struct Forwarder {
    client: Client,
    cache: Arc<InstanceCache>,
    balancer: Arc<dyn LoadBalancer>,
    timeouts: TimeoutSettings,
    default_retry: RetryConfig,
    default_timeout: Duration,
}

/// Hop-by-hop and gateway-managed headers never copied upstream.
const SKIP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "content-length",
    "x-forwarded-for",
];

impl Forwarder {
    pub fn new(
        cache: Arc<InstanceCache>,
        balancer: Arc<dyn LoadBalancer>,
        timeouts: TimeoutSettings,
        default_retry: RetryConfig,
        default_timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(timeouts.connect_seconds))
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .build()
            .expect("failed to create upstream HTTP client");

        Self {
            client,
            cache,
            balancer,
            timeouts,
            default_retry,
            default_timeout,
        }
    }

    /// Deadline for a request on this route, shared by all retry attempts.
    pub fn deadline_for(&self, route: &CompiledRoute, ctx: &RequestContext) -> Instant {
        let total = route
            .route
            .policy
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        Instant::now() + total.saturating_sub(ctx.elapsed())
    }

    /// Forwards the request to the matched route's target.
    ///
    /// Each attempt gets a fresh instance selection; 5xx responses past the
    /// retry budget surface as `UpstreamError`, deadline expiry as
    /// `UpstreamTimeout`. `path_override` replaces the inbound path for
    /// internal fallback forwards.
    pub async fn dispatch(
        &self,
        req: &HttpRequest,
        body: web::Bytes,
        route: &CompiledRoute,
        ctx: &mut RequestContext,
        deadline: Instant,
        path_override: Option<&str>,
    ) -> Result<UpstreamReply, GatewayError> {
        let method = convert_method(req.method().as_str());
        let headers = self.build_outbound_headers(req, route, ctx);
        let rewritten = route.rewrite_path(path_override.unwrap_or(&ctx.path));
        let path_and_query = match (&ctx.query, path_override) {
            (Some(query), None) => format!("{}?{}", rewritten, query),
            _ => rewritten,
        };

        let retry = route
            .route
            .policy
            .retry
            .clone()
            .unwrap_or_else(|| self.default_retry.clone());
        let retryable = is_idempotent(&method);
        let max_attempts = if retryable { retry.max_attempts.max(1) } else { 1 };

        let session_key = if route.route.policy.sticky_sessions {
            req.cookie("JSESSIONID").map(|c| c.value().to_string())
        } else {
            None
        };

        for attempt in 0..max_attempts {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                return Err(GatewayError::UpstreamTimeout {
                    timeout_secs: self.default_timeout.as_secs(),
                });
            };

            let (url, instance) = self.select_target(route, &path_and_query, session_key.as_deref())?;
            ctx.upstream = Some(
                instance
                    .as_ref()
                    .map(|i| i.instance_id.clone())
                    .unwrap_or_else(|| url.clone()),
            );

            if attempt > 0 {
                warn!("retry attempt {} for {} -> {}", attempt, ctx.path, url);
            } else {
                debug!("forwarding {} {} -> {}", ctx.method, ctx.path, url);
            }

            if let Some(instance) = &instance {
                self.balancer.on_dispatch(instance);
            }

            let attempt_timeout =
                remaining.min(Duration::from_secs(self.timeouts.read_seconds));
            let attempt_started = Instant::now();
            let outcome = self
                .client
                .request(method.clone(), &url)
                .headers(headers.clone())
                .body(body.clone())
                .timeout(attempt_timeout)
                .send()
                .await;
            let attempt_duration = attempt_started.elapsed();

            if let Some(instance) = &instance {
                self.balancer
                    .on_complete(instance, attempt_duration, outcome.is_ok());
            }

            match outcome {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if status < 500 {
                        return Ok(UpstreamReply { inner: resp });
                    }

                    let can_retry = retryable
                        && attempt + 1 < max_attempts
                        && retry.retryable_status_codes.contains(&status);
                    if can_retry {
                        warn!(
                            "retryable status {} from {}, attempt {}/{}",
                            status,
                            url,
                            attempt + 1,
                            max_attempts
                        );
                        self.backoff(&retry, attempt, deadline).await;
                        continue;
                    }

                    return Err(GatewayError::UpstreamError {
                        message: format!("upstream returned {}", status),
                        status: Some(status),
                    });
                }
                Err(e) if e.is_timeout() => {
                    return Err(GatewayError::UpstreamTimeout {
                        timeout_secs: attempt_timeout.as_secs(),
                    });
                }
                Err(e) => {
                    let can_retry = retryable
                        && retry.retry_on_connection_error
                        && attempt + 1 < max_attempts;
                    if can_retry {
                        warn!(
                            "connection error to {} ({}), attempt {}/{}",
                            url,
                            e,
                            attempt + 1,
                            max_attempts
                        );
                        self.backoff(&retry, attempt, deadline).await;
                        continue;
                    }

                    return Err(GatewayError::UpstreamError {
                        message: e.to_string(),
                        status: None,
                    });
                }
            }
        }

        Err(GatewayError::UpstreamError {
            message: format!("all {} attempts exhausted", max_attempts),
            status: None,
        })
    }

    /// Single-attempt forward to an absolute URI, used for fallbacks.
    pub async fn forward_uri(
        &self,
        uri: &str,
        req: &HttpRequest,
        body: web::Bytes,
        ctx: &RequestContext,
        deadline: Instant,
    ) -> Result<UpstreamReply, GatewayError> {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
            return Err(GatewayError::UpstreamTimeout {
                timeout_secs: self.default_timeout.as_secs(),
            });
        };

        let method = convert_method(req.method().as_str());
        let mut headers = UpstreamHeaderMap::new();
        self.apply_overlay(&mut headers, ctx);

        let outcome = self
            .client
            .request(method, uri)
            .headers(headers)
            .body(body)
            .timeout(remaining.min(Duration::from_secs(self.timeouts.read_seconds)))
            .send()
            .await;

        match outcome {
            Ok(resp) if resp.status().as_u16() < 500 => Ok(UpstreamReply { inner: resp }),
            Ok(resp) => Err(GatewayError::UpstreamError {
                message: format!("fallback returned {}", resp.status().as_u16()),
                status: Some(resp.status().as_u16()),
            }),
            Err(e) if e.is_timeout() => Err(GatewayError::UpstreamTimeout {
                timeout_secs: remaining.as_secs(),
            }),
            Err(e) => Err(GatewayError::UpstreamError {
                message: e.to_string(),
                status: None,
            }),
        }
    }

    fn select_target(
        &self,
        route: &CompiledRoute,
        path_and_query: &str,
        session_key: Option<&str>,
    ) -> Result<(String, Option<ServiceInstance>), GatewayError> {
        match &route.route.target {
            RouteTarget::Uri(base) => {
                let url = format!("{}{}", base.trim_end_matches('/'), path_and_query);
                Ok((url, None))
            }
            RouteTarget::Service(name) => {
                let instances = self.cache.healthy_instances(name);
                if instances.is_empty() {
                    return Err(GatewayError::NoHealthyInstance {
                        service: name.clone(),
                    });
                }

                let instance = match session_key {
                    Some(key) => sticky_select(key, &instances),
                    None => self.balancer.select(name, &instances),
                }
                .ok_or_else(|| GatewayError::NoHealthyInstance {
                    service: name.clone(),
                })?;

                let url = format_route(
                    &instance.scheme,
                    &instance.host,
                    instance.port,
                    path_and_query,
                );
                Ok((url, Some(instance)))
            }
        }
    }

    /// Copies safe inbound headers and materializes the context overlay.
    fn build_outbound_headers(
        &self,
        req: &HttpRequest,
        route: &CompiledRoute,
        ctx: &RequestContext,
    ) -> UpstreamHeaderMap {
        let mut headers = UpstreamHeaderMap::with_capacity(req.headers().len() + 8);

        for (name, value) in req.headers() {
            let lowered = name.as_str().to_ascii_lowercase();
            if SKIP_HEADERS.contains(&lowered.as_str()) {
                if lowered != "host" || !route.route.preserve_host {
                    continue;
                }
            }
            if route
                .route
                .remove_headers
                .iter()
                .any(|r| r.eq_ignore_ascii_case(&lowered))
            {
                continue;
            }

            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        for (name, value) in &route.route.add_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        // X-Forwarded-For: append the resolved client IP to the inbound chain.
        let client_ip = ctx.client.as_ref().map(|c| c.ip.clone());
        if let Some(ip) = client_ip {
            let chain = match req
                .headers()
                .get("X-Forwarded-For")
                .and_then(|v| v.to_str().ok())
            {
                Some(existing) => format!("{}, {}", existing, ip),
                None => ip,
            };
            if let Ok(value) = HeaderValue::from_str(&chain) {
                headers.insert(HeaderName::from_static("x-forwarded-for"), value);
            }
        }

        self.apply_overlay(&mut headers, ctx);

        headers
            .entry("user-agent")
            .or_insert_with(|| HeaderValue::from_static(concat!("wicket-rs/", env!("CARGO_PKG_VERSION"))));

        headers
    }

    /// Gateway-added propagation headers: trace, timing, identity.
    fn apply_overlay(&self, headers: &mut UpstreamHeaderMap, ctx: &RequestContext) {
        if let Ok(value) = HeaderValue::from_str(&ctx.trace_id) {
            headers.insert(HeaderName::from_static("x-trace-id"), value);
        }
        if let Ok(value) = HeaderValue::from_str(&ctx.received_at.timestamp_millis().to_string()) {
            headers.insert(HeaderName::from_static("x-request-start-time"), value);
        }

        if let Some(identity) = &ctx.identity {
            if let Ok(value) = HeaderValue::from_str(&identity.user_id) {
                headers.insert(HeaderName::from_static("x-user-id"), value);
            }
            if let Some(tenant) = &identity.tenant_id {
                if let Ok(value) = HeaderValue::from_str(tenant) {
                    headers.insert(HeaderName::from_static("x-tenant-id"), value);
                }
            }
            if !identity.roles.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&identity.roles.join(",")) {
                    headers.insert(HeaderName::from_static("x-user-roles"), value);
                }
            }
            if let Some(client_id) = &identity.client_id {
                if let Ok(value) = HeaderValue::from_str(client_id) {
                    headers.insert(HeaderName::from_static("x-client-id"), value);
                }
            }
        }
    }

    /// Exponential backoff with jitter, never sleeping past the deadline.
    async fn backoff(&self, retry: &RetryConfig, attempt: u32, deadline: Instant) {
        use rand::Rng;

        let base = retry.calculate_backoff(attempt);
        let jitter = rand::thread_rng().gen_range(0..=base / 2 + 1);
        let delay = Duration::from_millis(base / 2 + jitter);

        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or_default();
        sleep(delay.min(remaining)).await;
    }
}

fn convert_method(method: &str) -> Method {
    match method {
        "GET" => Method::GET,
        "POST" => Method::POST,
        "PUT" => Method::PUT,
        "DELETE" => Method::DELETE,
        "HEAD" => Method::HEAD,
        "OPTIONS" => Method::OPTIONS,
        "PATCH" => Method::PATCH,
        "TRACE" => Method::TRACE,
        "CONNECT" => Method::CONNECT,
        _ => Method::GET,
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE | Method::TRACE
    )
}
