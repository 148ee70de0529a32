use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde_json::json;

/// Error kinds raised by the request pipeline.
///
/// Every fatal error short-circuits the filter chain and is rendered as the
/// uniform JSON envelope `{code, message, traceId, ...}`. Non-fatal errors
/// (counter store down, trace map full) are logged and counted but never
/// change a request's outcome.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("forbidden: {message}")]
    Forbidden { message: String },

    #[error("rate limit exceeded on {limit_type}")]
    RateLimited {
        limit_type: String,
        algorithm: String,
        limit: u64,
        remaining: u64,
        reset_epoch_secs: i64,
        retry_after_secs: u64,
    },

    #[error("circuit open for route {route_id}")]
    BreakerOpen {
        route_id: String,
        retry_after_secs: u64,
    },

    #[error("no route matches path: {path}")]
    NoRoute { path: String },

    #[error("no healthy instance for service: {service}")]
    NoHealthyInstance { service: String },

    #[error("upstream timed out after {timeout_secs}s")]
    UpstreamTimeout { timeout_secs: u64 },

    #[error("upstream error: {message}")]
    UpstreamError {
        message: String,
        status: Option<u16>,
    },

    /// Recovered locally per the failure-semantics table; if it ever reaches
    /// the client it is rendered as an internal error.
    #[error("{store} unavailable: {message}")]
    StoreUnavailable { store: String, message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn internal(message: impl Into<String>) -> Self {
        GatewayError::Internal {
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden { .. } => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoRoute { .. } => StatusCode::NOT_FOUND,
            GatewayError::NoHealthyInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::StoreUnavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short kind label recorded in trace summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest { .. } => "invalid_request",
            GatewayError::Unauthorized { .. } => "unauthorized",
            GatewayError::Forbidden { .. } => "forbidden",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::BreakerOpen { .. } => "breaker_open",
            GatewayError::NoRoute { .. } => "no_route",
            GatewayError::NoHealthyInstance { .. } => "no_healthy_instance",
            GatewayError::UpstreamTimeout { .. } => "upstream_timeout",
            GatewayError::UpstreamError { .. } => "upstream_error",
            GatewayError::StoreUnavailable { .. } => "store_unavailable",
            GatewayError::Internal { .. } => "internal",
        }
    }

    /// Client-facing message. Upstream and internal detail stays in the logs.
    fn client_message(&self) -> String {
        match self {
            GatewayError::InvalidRequest { message } => message.clone(),
            GatewayError::Unauthorized { message } => message.clone(),
            GatewayError::Forbidden { message } => message.clone(),
            GatewayError::RateLimited { .. } => {
                "too many requests, please try again later".to_string()
            }
            GatewayError::BreakerOpen { .. } | GatewayError::NoHealthyInstance { .. } => {
                "service temporarily unavailable".to_string()
            }
            GatewayError::NoRoute { path } => format!("no route for path: {}", path),
            GatewayError::UpstreamTimeout { .. } => "upstream request timed out".to_string(),
            GatewayError::UpstreamError { .. } => "upstream service error".to_string(),
            GatewayError::StoreUnavailable { .. } | GatewayError::Internal { .. } => {
                "internal server error".to_string()
            }
        }
    }

    /// Renders the error as the downstream envelope response.
    ///
    /// Rate-limit denials carry the `X-RateLimit-*` headers and `Retry-After`;
    /// open circuits carry `Retry-After` equal to the remaining wait-in-open.
    pub fn to_response(&self, trace_id: &str) -> HttpResponse {
        let status = self.status();
        let mut body = json!({
            "code": status.as_u16(),
            "message": self.client_message(),
            "traceId": trace_id,
        });

        let mut builder = HttpResponse::build(status);

        match self {
            GatewayError::RateLimited {
                limit_type,
                algorithm,
                limit,
                remaining,
                reset_epoch_secs,
                retry_after_secs,
            } => {
                body["limitType"] = json!(limit_type);
                body["algorithm"] = json!(algorithm);
                body["remaining"] = json!(remaining);
                body["resetTime"] = json!(reset_epoch_secs);
                body["retryAfter"] = json!(retry_after_secs);

                builder.insert_header(("X-RateLimit-Limit", limit.to_string()));
                builder.insert_header(("X-RateLimit-Remaining", remaining.to_string()));
                builder.insert_header(("X-RateLimit-Reset", reset_epoch_secs.to_string()));
                builder.insert_header(("X-RateLimit-Type", limit_type.clone()));
                builder.insert_header(("X-RateLimit-Algorithm", algorithm.clone()));
                builder.insert_header(("Retry-After", retry_after_secs.to_string()));
            }
            GatewayError::BreakerOpen {
                retry_after_secs, ..
            } => {
                body["retryAfter"] = json!(retry_after_secs);
                builder.insert_header(("Retry-After", retry_after_secs.to_string()));
            }
            _ => {}
        }

        builder.insert_header(("X-Trace-ID", trace_id.to_string()));
        builder.json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_error_table() {
        let cases = [
            (
                GatewayError::Unauthorized {
                    message: "missing token".into(),
                },
                401,
            ),
            (
                GatewayError::Forbidden {
                    message: "admin required".into(),
                },
                403,
            ),
            (
                GatewayError::NoRoute {
                    path: "/nope".into(),
                },
                404,
            ),
            (
                GatewayError::NoHealthyInstance {
                    service: "users".into(),
                },
                503,
            ),
            (
                GatewayError::UpstreamTimeout { timeout_secs: 30 },
                504,
            ),
            (
                GatewayError::UpstreamError {
                    message: "connect refused".into(),
                    status: None,
                },
                502,
            ),
        ];

        for (err, code) in cases {
            assert_eq!(err.status().as_u16(), code);
        }
    }

    #[test]
    fn breaker_open_message_is_stable() {
        let err = GatewayError::BreakerOpen {
            route_id: "orders".into(),
            retry_after_secs: 30,
        };
        assert_eq!(err.client_message(), "service temporarily unavailable");
        assert_eq!(err.status().as_u16(), 503);
    }
}
