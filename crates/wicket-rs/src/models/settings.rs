use crate::models::route::{BreakerSettings, RetryConfig};
use serde::{Deserialize, Serialize};

/// Admission algorithm for a rate-limit dimension.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Timestamp-set window over `[now-W, now]`.
    SlidingWindow,
    /// Lazily refilled token bucket.
    TokenBucket,
    /// Integer counter with per-window reset.
    FixedWindow,
}

impl Default for RateLimitAlgorithm {
    fn default() -> Self {
        Self::SlidingWindow
    }
}

impl RateLimitAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SlidingWindow => "sliding_window",
            Self::TokenBucket => "token_bucket",
            Self::FixedWindow => "fixed_window",
        }
    }
}

/// Limit configuration for one rate-limit dimension.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DimensionSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_limit")]
    pub limit: u64,

    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
}

fn default_true() -> bool {
    true
}

fn default_limit() -> u64 {
    100
}

fn default_window_seconds() -> u64 {
    60
}

impl Default for DimensionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: default_limit(),
            window_seconds: default_window_seconds(),
            algorithm: RateLimitAlgorithm::default(),
        }
    }
}

impl DimensionSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Per-route override of the API-dimension limit, matched by path glob.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RouteLimitOverride {
    pub path: String,
    pub limit: u64,
}

/// Rate limiting configuration across all dimensions.
///
/// Dimensions are evaluated in fixed order (IP, User, API, Tenant, Global),
/// short-circuiting on the first denial. Paths matching a whitelist glob
/// bypass the engine entirely.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RateLimitSettings {
    #[serde(default)]
    pub ip: DimensionSettings,

    #[serde(default = "DimensionSettings::disabled")]
    pub user: DimensionSettings,

    #[serde(default = "DimensionSettings::disabled")]
    pub api: DimensionSettings,

    #[serde(default = "DimensionSettings::disabled")]
    pub tenant: DimensionSettings,

    #[serde(default = "DimensionSettings::disabled")]
    pub global: DimensionSettings,

    /// Path globs that bypass rate limiting.
    #[serde(default)]
    pub whitelist_paths: Vec<String>,

    /// API-dimension limit overrides keyed by path glob.
    #[serde(default)]
    pub route_overrides: Vec<RouteLimitOverride>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            ip: DimensionSettings::default(),
            user: DimensionSettings::disabled(),
            api: DimensionSettings::disabled(),
            tenant: DimensionSettings::disabled(),
            global: DimensionSettings::disabled(),
            whitelist_paths: Vec::new(),
            route_overrides: Vec::new(),
        }
    }
}

/// JWT validation parameters for the production token validator.
///
/// # Examples
///
/// ```json
/// {
///   "secret": "a-long-randomly-generated-secret-value",
///   "issuer": "wicket-gateway",
///   "audiences": ["api-clients"],
///   "algorithms": ["HS256"]
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JwtSettings {
    /// Secret key used for signature validation.
    pub secret: String,

    /// Expected `iss` claim, if any.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Accepted `aud` values; empty disables audience validation.
    #[serde(default)]
    pub audiences: Vec<String>,

    /// Accepted signing algorithms (default: HS256).
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<String>,

    /// Header carrying the credential (default: Authorization).
    #[serde(default = "default_auth_header")]
    pub header: String,

    /// Scheme prefix stripped from the header value (default: Bearer).
    #[serde(default = "default_auth_prefix")]
    pub prefix: String,
}

fn default_algorithms() -> Vec<String> {
    vec!["HS256".to_string()]
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

fn default_auth_prefix() -> String {
    "Bearer".to_string()
}

impl Default for JwtSettings {
    fn default() -> Self {
        Self {
            secret: std::env::var("WICKET_JWT_SECRET")
                .unwrap_or_else(|_| "please-change-this-secret".to_string()),
            issuer: None,
            audiences: Vec::new(),
            algorithms: default_algorithms(),
            header: default_auth_header(),
            prefix: default_auth_prefix(),
        }
    }
}

/// IP / path whitelists consumed by the auth verifier and client identifier.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct WhitelistSettings {
    /// Individual trusted IPs.
    #[serde(default)]
    pub ip: Vec<String>,

    /// Trusted CIDR blocks (loopback and RFC1918 are always trusted).
    #[serde(default)]
    pub cidr: Vec<String>,

    /// Path prefixes that skip authentication, in addition to the built-ins.
    #[serde(default)]
    pub skip_paths: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SecuritySettings {
    #[serde(default)]
    pub jwt: JwtSettings,

    #[serde(default)]
    pub whitelist: WhitelistSettings,
}

/// Health probe loop configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthCheckSettings {
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u64,

    #[serde(default = "default_health_timeout")]
    pub timeout_seconds: u64,

    /// Consecutive successes before an instance turns Healthy.
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    /// Consecutive failures before an instance turns Unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    #[serde(default = "default_health_path")]
    pub path: String,

    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    2
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_expected_status() -> u16 {
    200
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_health_interval(),
            timeout_seconds: default_health_timeout(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            path: default_health_path(),
            expected_status: default_expected_status(),
        }
    }
}

/// Upstream connection timeouts, in seconds.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimeoutSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_seconds: u64,

    #[serde(default = "default_read_timeout")]
    pub read_seconds: u64,

    #[serde(default = "default_write_timeout")]
    pub write_seconds: u64,
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    30
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_seconds: default_connect_timeout(),
            read_seconds: default_read_timeout(),
            write_seconds: default_write_timeout(),
        }
    }
}

/// Instance selection strategy for service targets.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerKind {
    RoundRobin,
    Random,
    LeastConnections,
    WeightedResponseTime,
}

impl Default for LoadBalancerKind {
    fn default() -> Self {
        Self::RoundRobin
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LoadBalancerSettings {
    #[serde(default)]
    pub algorithm: LoadBalancerKind,
}

/// Trace recorder bounds.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TraceSettings {
    #[serde(default = "default_trace_capacity")]
    pub capacity: usize,

    /// Records older than this are swept even if never completed.
    #[serde(default = "default_trace_ttl")]
    pub ttl_seconds: u64,
}

fn default_trace_capacity() -> usize {
    10_000
}

fn default_trace_ttl() -> u64 {
    300
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            capacity: default_trace_capacity(),
            ttl_seconds: default_trace_ttl(),
        }
    }
}

/// A statically declared backend instance for the registry.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InstanceSettings {
    pub host: String,
    pub port: u16,

    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[serde(default = "default_instance_weight")]
    pub weight: u32,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_instance_weight() -> u32 {
    1
}

/// A logical service and its instances, fed to the static registry.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServiceSettings {
    pub name: String,
    pub instances: Vec<InstanceSettings>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_bind_host")]
    pub host: String,

    #[serde(default = "default_bind_port")]
    pub port: u16,

    /// Hard cap on inbound request bodies, in bytes (default: 10 MB).
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    5900
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_bind_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

/// Complete gateway configuration, loaded from a JSON file at startup.
///
/// Routes are authoritative in the external route store; `routes_path` points
/// the file-backed store at its source and `route_refresh_interval_seconds`
/// sets the snapshot refresh cadence.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Settings {
    /// Configuration schema version, currently `1`.
    pub version: u8,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub security: SecuritySettings,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Gateway-wide breaker defaults; routes override via their policy.
    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub health_check: HealthCheckSettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Gateway-wide retry defaults; routes override via their policy.
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub load_balancer: LoadBalancerSettings,

    #[serde(default)]
    pub trace: TraceSettings,

    /// Default end-to-end request deadline in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    #[serde(default = "default_routes_path")]
    pub routes_path: String,

    #[serde(default = "default_route_refresh")]
    pub route_refresh_interval_seconds: u64,

    /// Registry stale-threshold: an instance set older than this is treated
    /// as empty.
    #[serde(default = "default_registry_stale")]
    pub registry_stale_after_seconds: u64,

    #[serde(default)]
    pub services: Vec<ServiceSettings>,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_routes_path() -> String {
    "./routes.json".to_string()
}

fn default_route_refresh() -> u64 {
    30
}

fn default_registry_stale() -> u64 {
    300
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: 1,
            server: ServerSettings::default(),
            security: SecuritySettings::default(),
            rate_limit: RateLimitSettings::default(),
            breaker: BreakerSettings::default(),
            health_check: HealthCheckSettings::default(),
            timeouts: TimeoutSettings::default(),
            retry: RetryConfig::default(),
            load_balancer: LoadBalancerSettings::default(),
            trace: TraceSettings::default(),
            request_timeout_seconds: default_request_timeout(),
            routes_path: default_routes_path(),
            route_refresh_interval_seconds: default_route_refresh(),
            registry_stale_after_seconds: default_registry_stale(),
            services: Vec::new(),
        }
    }
}

impl Settings {
    /// Validates the assembled configuration.
    ///
    /// Returns the first hard error; softer concerns (weak secrets, odd
    /// thresholds) are reported by the comprehensive validator at startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.version != 1 {
            return Err(format!("unsupported configuration version: {}", self.version));
        }

        if self.server.port == 0 {
            return Err("server port must be between 1 and 65535".to_string());
        }

        if self.request_timeout_seconds == 0 {
            return Err("request_timeout_seconds must be positive".to_string());
        }

        self.breaker.validate()?;
        self.retry.validate()?;

        for dim in [
            &self.rate_limit.ip,
            &self.rate_limit.user,
            &self.rate_limit.api,
            &self.rate_limit.tenant,
            &self.rate_limit.global,
        ] {
            if dim.enabled && dim.window_seconds == 0 {
                return Err("rate limit window_seconds must be positive".to_string());
            }
        }

        for service in &self.services {
            if service.name.is_empty() {
                return Err("service name cannot be empty".to_string());
            }
            for instance in &service.instances {
                if instance.port == 0 {
                    return Err(format!(
                        "service {}: instance port must be between 1 and 65535",
                        service.name
                    ));
                }
                if instance.scheme != "http" && instance.scheme != "https" {
                    return Err(format!(
                        "service {}: instance scheme must be http or https",
                        service.name
                    ));
                }
            }
        }

        Ok(())
    }
}
