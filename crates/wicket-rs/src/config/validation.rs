//! Comprehensive startup validation for the assembled configuration.
//!
//! Hard errors abort the boot; warnings flag settings that are legal but
//! probably unintended (placeholder secrets, very low limits, zero
//! instances). Route definitions are validated separately when the route
//! store snapshot compiles.

use crate::models::settings::{RateLimitAlgorithm, Settings};

/// Outcome of a comprehensive validation pass.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate_comprehensive(settings: &Settings) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Err(e) = settings.validate() {
            result.errors.push(e);
        }

        // JWT hygiene
        let jwt = &settings.security.jwt;
        if jwt.secret == "please-change-this-secret" {
            result
                .errors
                .push("security.jwt.secret must be changed from the default value".to_string());
        } else if jwt.secret.len() < 32 {
            result.warnings.push(format!(
                "security.jwt.secret is only {} characters; 32+ recommended",
                jwt.secret.len()
            ));
        }
        if jwt.algorithms.iter().any(|a| a.parse::<jsonwebtoken::Algorithm>().is_err()) {
            result
                .errors
                .push("security.jwt.algorithms contains an unknown algorithm".to_string());
        }

        // Trust lists must parse
        for cidr in &settings.security.whitelist.cidr {
            if cidr.parse::<ipnet::IpNet>().is_err() {
                result
                    .errors
                    .push(format!("security.whitelist.cidr entry is not a CIDR: {}", cidr));
            }
        }
        for ip in &settings.security.whitelist.ip {
            if ip.parse::<std::net::IpAddr>().is_err() {
                result
                    .errors
                    .push(format!("security.whitelist.ip entry is not an IP: {}", ip));
            }
        }

        // Rate limit sanity
        for (name, dim) in [
            ("ip", &settings.rate_limit.ip),
            ("user", &settings.rate_limit.user),
            ("api", &settings.rate_limit.api),
            ("tenant", &settings.rate_limit.tenant),
            ("global", &settings.rate_limit.global),
        ] {
            if !dim.enabled {
                continue;
            }
            if dim.limit == 0 && dim.algorithm != RateLimitAlgorithm::TokenBucket {
                result.warnings.push(format!(
                    "rate_limit.{} has limit 0; every request will be denied",
                    name
                ));
            }
            if dim.window_seconds > 3600 {
                result.warnings.push(format!(
                    "rate_limit.{} window of {}s keeps large timestamp sets",
                    name, dim.window_seconds
                ));
            }
        }
        for override_ in &settings.rate_limit.route_overrides {
            if crate::utils::path::compile_glob(&override_.path).is_err() {
                result.errors.push(format!(
                    "rate_limit.route_overrides pattern does not compile: {}",
                    override_.path
                ));
            }
        }
        for pattern in &settings.rate_limit.whitelist_paths {
            if crate::utils::path::compile_glob(pattern).is_err() {
                result.errors.push(format!(
                    "rate_limit.whitelist_paths pattern does not compile: {}",
                    pattern
                ));
            }
        }

        // Health loop timing
        if settings.health_check.timeout_seconds >= settings.health_check.interval_seconds {
            result.warnings.push(
                "health_check.timeout_seconds >= interval_seconds; probes may overlap".to_string(),
            );
        }

        // Services
        if settings.services.is_empty() {
            result
                .warnings
                .push("no services declared; only uri-target routes will forward".to_string());
        }
        for service in &settings.services {
            if service.instances.is_empty() {
                result.warnings.push(format!(
                    "service {} has no instances; requests will see 503",
                    service.name
                ));
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::settings::JwtSettings;

    fn valid_settings() -> Settings {
        let mut settings = Settings::default();
        settings.security.jwt = JwtSettings {
            secret: "a-strong-secret-value-0123456789abcdef".to_string(),
            ..JwtSettings::default()
        };
        settings
    }

    #[test]
    fn default_secret_is_an_error() {
        let mut settings = valid_settings();
        settings.security.jwt.secret = "please-change-this-secret".to_string();

        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(!result.is_valid());
    }

    #[test]
    fn valid_settings_pass_with_warnings_only() {
        let result = ConfigValidator::validate_comprehensive(&valid_settings());
        assert!(result.is_valid(), "errors: {:?}", result.errors);
        // No services declared is a warning, not an error.
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn bad_cidr_is_an_error() {
        let mut settings = valid_settings();
        settings.security.whitelist.cidr = vec!["10.0.0.0/99".to_string()];

        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(!result.is_valid());
    }

    #[test]
    fn zero_limit_dimension_is_flagged() {
        let mut settings = valid_settings();
        settings.rate_limit.ip.limit = 0;

        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("rate_limit.ip")));
    }
}
