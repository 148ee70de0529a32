use crate::models::settings::Settings;
use log::{debug, warn};
use std::fs;
use std::path::Path;

/// Maximum configuration file size accepted at load time.
const MAX_CONFIG_SIZE: u64 = 10 * 1024 * 1024;

/// Loads gateway configuration from the file system.
///
/// The path comes from `WICKET_CONFIG_PATH`, defaulting to `./config.json`.
/// Safety checks: the file must stay under 10 MB and, for relative paths,
/// must resolve inside the working directory (no traversal via symlinks).
///
/// # Errors
///
/// Fails on a missing or unreadable file, an oversized file, malformed JSON
/// or a JSON document that does not match [`Settings`].
pub fn load_settings() -> Result<Settings, Box<dyn std::error::Error>> {
    let config_path =
        std::env::var("WICKET_CONFIG_PATH").unwrap_or_else(|_| "./config.json".to_string());
    let path = Path::new(&config_path);

    if !path.exists() {
        return Err(format!("configuration file not found: {}", config_path).into());
    }

    let metadata = fs::metadata(path)?;
    if metadata.len() > MAX_CONFIG_SIZE {
        return Err(format!(
            "configuration file too large: {} bytes (max {})",
            metadata.len(),
            MAX_CONFIG_SIZE
        )
        .into());
    }

    // Keep relative configs inside the working directory.
    if path.is_relative() {
        let canonical = path.canonicalize()?;
        let cwd = std::env::current_dir()?.canonicalize()?;
        if !canonical.starts_with(&cwd) {
            return Err(format!(
                "configuration path escapes the working directory: {}",
                config_path
            )
            .into());
        }
    }

    let raw = fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&raw)?;

    debug!(
        "loaded configuration from {} ({} services, routes at {})",
        config_path,
        settings.services.len(),
        settings.routes_path
    );

    if settings.security.jwt.secret == "please-change-this-secret" {
        warn!("JWT secret is the placeholder default; set security.jwt.secret");
    }

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_parse_with_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"version": 1}"#).unwrap();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.server.port, 5900);
        assert!(settings.rate_limit.ip.enabled);
        assert_eq!(settings.request_timeout_seconds, 30);
    }

    #[test]
    fn settings_parse_full_document() {
        let raw = r#"{
            "version": 1,
            "server": {"host": "127.0.0.1", "port": 8080},
            "rate_limit": {
                "ip": {"enabled": true, "limit": 100, "window_seconds": 60, "algorithm": "sliding_window"},
                "whitelist_paths": ["/actuator/**"]
            },
            "breaker": {"failure_rate_threshold": 50.0, "min_calls": 5},
            "timeouts": {"connect_seconds": 2, "read_seconds": 10, "write_seconds": 10},
            "load_balancer": {"algorithm": "least_connections"},
            "services": [
                {"name": "users", "instances": [{"host": "10.0.0.1", "port": 8080}]}
            ]
        }"#;

        let settings: Settings = serde_json::from_str(raw).unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.rate_limit.whitelist_paths.len(), 1);
        assert_eq!(settings.services[0].instances[0].scheme, "http");
        assert!(settings.validate().is_ok());
    }
}
