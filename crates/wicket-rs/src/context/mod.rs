//! Per-request state carrier.
//!
//! One [`RequestContext`] exists per inflight request, owned exclusively by
//! the handling task. Filters mutate it in sequence; its lifetime ends when
//! the response is fully written. The context carries the trace id, the
//! resolved identity, the client descriptor and every pipeline decision so
//! later filters (and the trace recorder) can observe earlier ones.

use actix_web::HttpRequest;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Device classification derived from the user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Desktop,
    Mobile,
    Tablet,
    Bot,
}

/// Resolved client information: real IP, device class and trust flags.
#[derive(Debug, Clone)]
pub struct ClientDescriptor {
    pub ip: String,
    pub user_agent: Option<String>,
    pub device: DeviceKind,
    pub bot: bool,
    pub trusted: bool,
}

/// Identity attached after successful authentication.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub roles: Vec<String>,
    pub client_id: Option<String>,
}

impl Identity {
    /// Admin means a role string of `ADMIN` or `ROLE_ADMIN`, case-insensitive.
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| {
            let role = r.to_ascii_uppercase();
            role == "ADMIN" || role == "ROLE_ADMIN"
        })
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

/// Identity over which a rate limit is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDimension {
    Ip,
    User,
    Api,
    Tenant,
    Global,
}

impl RateLimitDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::User => "user",
            Self::Api => "api",
            Self::Tenant => "tenant",
            Self::Global => "global",
        }
    }
}

/// Outcome of one dimension's admission check.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub dimension: RateLimitDimension,
    pub algorithm: &'static str,
    pub limit: u64,
    pub remaining: u64,
    pub reset_epoch_secs: i64,
    pub allowed: bool,
}

/// Request lifecycle outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Pending,
    InFlight,
    Completed,
    Failed,
    Timeout,
    ClientCancelled,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::ClientCancelled => "client_cancelled",
        }
    }
}

/// Per-request state: trace id, request facts, identity, decisions.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub method: String,
    pub scheme: String,
    pub path: String,
    pub query: Option<String>,
    pub remote_addr: Option<String>,
    pub received_at: DateTime<Utc>,
    started: Instant,

    /// Headers the gateway adds to the downstream response.
    pub response_headers: Vec<(String, String)>,

    pub identity: Option<Identity>,
    pub client: Option<ClientDescriptor>,
    pub rate_decisions: Vec<RateLimitDecision>,
    pub route_id: Option<String>,
    pub upstream: Option<String>,
    pub breaker_admitted: Option<bool>,
    pub outcome: RequestOutcome,
    pub duration: Option<Duration>,
}

impl RequestContext {
    /// Builds a fresh context from the inbound request.
    ///
    /// Adopts a well-formed inbound `X-Trace-ID` (32 hex characters) so a
    /// trace spans gateway hops; otherwise generates a new id.
    pub fn new(req: &HttpRequest) -> Self {
        let trace_id = req
            .headers()
            .get("X-Trace-ID")
            .and_then(|v| v.to_str().ok())
            .filter(|v| is_well_formed_trace_id(v))
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_else(new_trace_id);

        Self {
            trace_id,
            method: req.method().as_str().to_string(),
            scheme: req.connection_info().scheme().to_string(),
            path: req.path().to_string(),
            query: if req.query_string().is_empty() {
                None
            } else {
                Some(req.query_string().to_string())
            },
            remote_addr: req.peer_addr().map(|a| a.to_string()),
            received_at: Utc::now(),
            started: Instant::now(),
            response_headers: Vec::new(),
            identity: None,
            client: None,
            rate_decisions: Vec::new(),
            route_id: None,
            upstream: None,
            breaker_admitted: None,
            outcome: RequestOutcome::Pending,
            duration: None,
        }
    }

    pub fn with_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    pub fn with_rate_decision(&mut self, decision: RateLimitDecision) {
        self.rate_decisions.push(decision);
    }

    pub fn add_response_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response_headers.push((name.into(), value.into()));
    }

    /// Marks a terminal outcome and freezes the duration.
    pub fn mark(&mut self, outcome: RequestOutcome) {
        self.outcome = outcome;
        if !matches!(outcome, RequestOutcome::Pending | RequestOutcome::InFlight) {
            self.duration = Some(self.started.elapsed());
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The strictest (last) rate decision, used for response headers.
    pub fn last_rate_decision(&self) -> Option<&RateLimitDecision> {
        self.rate_decisions.last()
    }

    /// One-line identity summary for trace records.
    pub fn identity_summary(&self) -> Option<String> {
        self.identity.as_ref().map(|id| match &id.tenant_id {
            Some(tenant) => format!("{}@{}", id.user_id, tenant),
            None => id.user_id.clone(),
        })
    }
}

/// Generates a 32-hex-character trace id.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A well-formed trace id is exactly 32 hex characters.
pub fn is_well_formed_trace_id(value: &str) -> bool {
    value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit())
}
