use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a route. Only `Active` routes are ever selected.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Active,
    Inactive,
    Disabled,
    Maintenance,
}

impl Default for RouteStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// Where a matched request is sent.
///
/// # Examples
///
/// ```json
/// { "uri": "http://orders-backend:8080" }
/// { "service": "orders" }
/// ```
///
/// A `service` target is resolved through the registry's healthy instance set
/// and load-balanced; a `uri` target is forwarded to as-is.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    Uri(String),
    Service(String),
}

/// Header equality predicate. The header name compares case-insensitively;
/// the value is an exact string or a `*`/`**` glob.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HeaderPredicate {
    pub name: String,
    pub value: String,
}

/// Retry configuration for handling transient upstream failures.
///
/// Retries apply only to idempotent methods and the configured status codes,
/// use exponential backoff with jitter, and share the request deadline.
///
/// # Examples
///
/// ```json
/// {
///   "max_attempts": 3,
///   "backoff_initial_ms": 100,
///   "backoff_max_ms": 5000,
///   "backoff_multiplier": 2.0,
///   "retryable_status_codes": [502, 503, 504]
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds (default: 100ms).
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    /// Maximum backoff delay in milliseconds (default: 5000ms).
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Backoff multiplier for exponential backoff (default: 2.0).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upstream status codes that trigger a retry.
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,

    /// Whether to retry on connect/read errors (default: true).
    #[serde(default = "default_retry_on_connection_error")]
    pub retry_on_connection_error: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_initial() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_retryable_status_codes() -> Vec<u16> {
    vec![502, 503, 504]
}

fn default_retry_on_connection_error() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
            backoff_multiplier: default_backoff_multiplier(),
            retryable_status_codes: default_retryable_status_codes(),
            retry_on_connection_error: default_retry_on_connection_error(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.max_attempts > 10 {
            return Err("max_attempts should not exceed 10 to prevent excessive delays".to_string());
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err("backoff_initial_ms cannot be greater than backoff_max_ms".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be >= 1.0".to_string());
        }
        Ok(())
    }

    /// Base backoff for a given attempt, before jitter.
    pub fn calculate_backoff(&self, attempt: u32) -> u64 {
        let backoff =
            (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        backoff.min(self.backoff_max_ms as f64) as u64
    }
}

/// Rolling-window shape for a route's circuit breaker.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreakerWindowKind {
    /// Window over the last N calls.
    Count,
    /// Window over the last `window_size` seconds.
    Time,
}

impl Default for BreakerWindowKind {
    fn default() -> Self {
        Self::Count
    }
}

/// Circuit breaker thresholds. Configurable globally and overridable per
/// route through the policy bundle.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BreakerSettings {
    /// Failure rate (percent of windowed calls) that opens the circuit.
    #[serde(default = "default_failure_rate")]
    pub failure_rate_threshold: f64,

    /// Slow-call rate (percent) that opens the circuit.
    #[serde(default = "default_slow_rate")]
    pub slow_rate_threshold: f64,

    /// Calls slower than this count as slow.
    #[serde(default = "default_slow_call_duration_ms")]
    pub slow_call_duration_ms: u64,

    #[serde(default)]
    pub window_kind: BreakerWindowKind,

    /// Window size: number of calls (count) or seconds (time).
    #[serde(default = "default_window_size")]
    pub window_size: u64,

    /// Minimum windowed calls before rates are evaluated.
    #[serde(default = "default_min_calls")]
    pub min_calls: u64,

    /// Trial calls admitted while half-open.
    #[serde(default = "default_half_open_permits")]
    pub half_open_permits: u32,

    /// Seconds to stay open before probing recovery.
    #[serde(default = "default_wait_in_open_secs")]
    pub wait_in_open_secs: u64,
}

fn default_failure_rate() -> f64 {
    50.0
}

fn default_slow_rate() -> f64 {
    80.0
}

fn default_slow_call_duration_ms() -> u64 {
    2000
}

fn default_window_size() -> u64 {
    100
}

fn default_min_calls() -> u64 {
    10
}

fn default_half_open_permits() -> u32 {
    3
}

fn default_wait_in_open_secs() -> u64 {
    30
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_rate_threshold: default_failure_rate(),
            slow_rate_threshold: default_slow_rate(),
            slow_call_duration_ms: default_slow_call_duration_ms(),
            window_kind: BreakerWindowKind::default(),
            window_size: default_window_size(),
            min_calls: default_min_calls(),
            half_open_permits: default_half_open_permits(),
            wait_in_open_secs: default_wait_in_open_secs(),
        }
    }
}

impl BreakerSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=100.0).contains(&self.failure_rate_threshold) {
            return Err("failure_rate_threshold must be between 0 and 100".to_string());
        }
        if !(0.0..=100.0).contains(&self.slow_rate_threshold) {
            return Err("slow_rate_threshold must be between 0 and 100".to_string());
        }
        if self.window_size == 0 {
            return Err("window_size must be greater than 0".to_string());
        }
        if self.half_open_permits == 0 {
            return Err("half_open_permits must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Per-route policy bundle: overrides for admission, protection and timeout
/// behavior. Absent fields fall back to the gateway defaults.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RoutePolicy {
    /// Overrides the API-dimension rate limit for requests matching this
    /// route's path pattern.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerSettings>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    /// End-to-end deadline for requests on this route, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// URI (or gateway path) forwarded to when the breaker is open or the
    /// upstream keeps failing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_uri: Option<String>,

    /// Pin clients to an instance by `JSESSIONID` cookie hash.
    #[serde(default)]
    pub sticky_sessions: bool,
}

/// A declarative match-and-forward rule.
///
/// Routes are scanned in ascending priority (lower wins); ties break
/// lexicographically by id. The path pattern uses `*` (one segment) and
/// `**` (any suffix) globs.
///
/// # Examples
///
/// ```json
/// {
///   "id": "orders",
///   "priority": 10,
///   "path": "/api/orders/**",
///   "methods": ["GET", "POST"],
///   "target": { "service": "orders" },
///   "strip_prefix": 1,
///   "policy": {
///     "timeout_seconds": 10,
///     "fallback_uri": "/fallback/orders"
///   }
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Route {
    /// Stable route identifier.
    pub id: String,

    /// Match priority; lower values are tried first.
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub status: RouteStatus,

    /// Path glob the inbound request must match.
    pub path: String,

    /// Allowed HTTP methods. Empty means any method.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Header predicates that must all hold.
    #[serde(default)]
    pub headers: Vec<HeaderPredicate>,

    pub target: RouteTarget,

    /// Number of leading path segments dropped before forwarding.
    #[serde(default)]
    pub strip_prefix: usize,

    /// Headers added to the outbound request.
    #[serde(default)]
    pub add_headers: HashMap<String, String>,

    /// Headers removed from the outbound request.
    #[serde(default)]
    pub remove_headers: Vec<String>,

    /// Forward the inbound `Host` header instead of the upstream authority.
    #[serde(default)]
    pub preserve_host: bool,

    #[serde(default)]
    pub policy: RoutePolicy,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Route {
    /// Validates the route definition.
    ///
    /// Checks path shape, method names, target form and the nested retry and
    /// breaker configurations. Returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("route id cannot be empty".to_string());
        }

        if !self.path.starts_with('/') {
            return Err(format!("route {}: path must start with '/'", self.id));
        }

        let valid_methods = [
            "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE",
        ];
        for method in &self.methods {
            if !valid_methods.contains(&method.as_str()) {
                return Err(format!("route {}: invalid HTTP method: {}", self.id, method));
            }
        }

        match &self.target {
            RouteTarget::Uri(uri) => {
                if !uri.starts_with("http://") && !uri.starts_with("https://") {
                    return Err(format!(
                        "route {}: target uri must start with http:// or https://",
                        self.id
                    ));
                }
            }
            RouteTarget::Service(name) => {
                if name.is_empty() {
                    return Err(format!("route {}: target service cannot be empty", self.id));
                }
            }
        }

        if let Some(retry) = &self.policy.retry {
            retry
                .validate()
                .map_err(|e| format!("route {}: {}", self.id, e))?;
        }

        if let Some(breaker) = &self.policy.breaker {
            breaker
                .validate()
                .map_err(|e| format!("route {}: {}", self.id, e))?;
        }

        if let Some(timeout) = self.policy.timeout_seconds {
            if timeout == 0 {
                return Err(format!("route {}: timeout_seconds must be positive", self.id));
            }
        }

        Ok(())
    }

    /// Returns true when `method` is allowed on this route.
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m == method)
    }
}
