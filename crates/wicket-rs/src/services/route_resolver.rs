//! Route matching and the refreshed route snapshot.
//!
//! Routes are authoritative in an external route store; the resolver keeps a
//! compiled in-memory snapshot and swaps it atomically on each refresh, so a
//! request sees either the old route set or the new one, never a mix. Match
//! order is ascending priority with ties broken lexicographically by route
//! id; only `Active` routes participate.

use crate::models::route::{Route, RouteStatus};
use crate::services::counter_store::StoreError;
use crate::utils::path::{compile_glob, strip_prefix_segments};
use actix_web::http::header::HeaderMap;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while compiling route definitions into a snapshot.
#[derive(Error, Debug)]
pub enum RouteCompileError {
    #[error("route {id}: invalid path pattern: {pattern}")]
    InvalidPattern { id: String, pattern: String },

    #[error("route {id}: {message}")]
    InvalidRoute { id: String, message: String },
}

#[derive(Debug, Clone)]
enum HeaderMatch {
    Exact(String),
    Glob(Regex),
}

/// A route compiled for matching: anchored path regex plus prepared header
/// predicates.
#[derive(Debug)]
pub struct CompiledRoute {
    pub route: Route,
    path_regex: Regex,
    header_predicates: Vec<(String, HeaderMatch)>,
}

impl CompiledRoute {
    fn compile(route: Route) -> Result<Self, RouteCompileError> {
        route
            .validate()
            .map_err(|message| RouteCompileError::InvalidRoute {
                id: route.id.clone(),
                message,
            })?;

        let path_regex =
            compile_glob(&route.path).map_err(|_| RouteCompileError::InvalidPattern {
                id: route.id.clone(),
                pattern: route.path.clone(),
            })?;

        let mut header_predicates = Vec::with_capacity(route.headers.len());
        for predicate in &route.headers {
            let matcher = if predicate.value.contains('*') {
                let re = compile_glob(&predicate.value).map_err(|_| {
                    RouteCompileError::InvalidPattern {
                        id: route.id.clone(),
                        pattern: predicate.value.clone(),
                    }
                })?;
                HeaderMatch::Glob(re)
            } else {
                HeaderMatch::Exact(predicate.value.clone())
            };
            header_predicates.push((predicate.name.to_ascii_lowercase(), matcher));
        }

        Ok(Self {
            route,
            path_regex,
            header_predicates,
        })
    }

    /// True when every predicate holds for the request.
    pub fn matches(&self, method: &str, path: &str, headers: &HeaderMap) -> bool {
        if !self.route.allows_method(method) {
            return false;
        }

        if !self.path_regex.is_match(path) {
            return false;
        }

        for (name, matcher) in &self.header_predicates {
            let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) else {
                return false;
            };
            let holds = match matcher {
                HeaderMatch::Exact(expected) => value == expected,
                HeaderMatch::Glob(re) => re.is_match(value),
            };
            if !holds {
                return false;
            }
        }

        true
    }

    /// Applies the route's strip-prefix rewrite to the inbound path.
    pub fn rewrite_path(&self, path: &str) -> String {
        strip_prefix_segments(path, self.route.strip_prefix)
    }
}

/// An immutable, versioned compiled route set.
pub struct RouteSnapshot {
    routes: Vec<Arc<CompiledRoute>>,
    pub version: u64,
    pub refreshed_at: DateTime<Utc>,
}

impl RouteSnapshot {
    fn build(mut routes: Vec<Route>, version: u64) -> Result<Self, RouteCompileError> {
        // Scan order: priority ascending, ties lexicographic by id.
        routes.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

        let mut compiled = Vec::with_capacity(routes.len());
        for route in routes {
            if route.status != RouteStatus::Active {
                debug!("route {} has status {:?}, excluded from snapshot", route.id, route.status);
                continue;
            }
            compiled.push(Arc::new(CompiledRoute::compile(route)?));
        }

        Ok(Self {
            routes: compiled,
            version,
            refreshed_at: Utc::now(),
        })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Route persistence capability. Authoritative storage lives outside the
/// core; the gateway only pulls snapshots.
#[async_trait]
pub trait RouteStore: Send + Sync {
    async fn load(&self) -> Result<Vec<Route>, StoreError>;
}

/// Reads route definitions from a JSON file.
pub struct FileRouteStore {
    path: String,
}

impl FileRouteStore {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RouteStore for FileRouteStore {
    async fn load(&self) -> Result<Vec<Route>, StoreError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("route file {}: {}", self.path, e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| StoreError::Unavailable(format!("route file {}: {}", self.path, e)))
    }
}

/// Matches requests to routes against the current snapshot.
pub struct RouteResolver {
    snapshot: ArcSwap<RouteSnapshot>,
    store: Arc<dyn RouteStore>,
    version: AtomicU64,
}

impl RouteResolver {
    /// Compiles the initial route set; invalid routes fail startup rather
    /// than silently dropping traffic.
    pub fn new(store: Arc<dyn RouteStore>, initial: Vec<Route>) -> Result<Self, RouteCompileError> {
        let snapshot = RouteSnapshot::build(initial, 1)?;
        info!("route snapshot v1 loaded with {} active routes", snapshot.len());

        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            store,
            version: AtomicU64::new(1),
        })
    }

    /// First route whose predicates all match, in priority order.
    pub fn resolve(
        &self,
        method: &str,
        path: &str,
        headers: &HeaderMap,
    ) -> Option<Arc<CompiledRoute>> {
        let snapshot = self.snapshot.load();
        snapshot
            .routes
            .iter()
            .find(|r| r.matches(method, path, headers))
            .cloned()
    }

    pub fn snapshot_info(&self) -> (u64, DateTime<Utc>, usize) {
        let snapshot = self.snapshot.load();
        (snapshot.version, snapshot.refreshed_at, snapshot.len())
    }

    /// Pulls the route set from the store and publishes a new snapshot.
    ///
    /// On store failure the last known snapshot keeps serving; the staleness
    /// is logged, never surfaced to clients.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let routes = match self.store.load().await {
            Ok(routes) => routes,
            Err(e) => {
                let (version, refreshed_at, _) = self.snapshot_info();
                error!(
                    "route store unreachable ({}); serving snapshot v{} from {}",
                    e, version, refreshed_at
                );
                return Err(e);
            }
        };

        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        match RouteSnapshot::build(routes, version) {
            Ok(snapshot) => {
                info!(
                    "route snapshot v{} published with {} active routes",
                    version,
                    snapshot.len()
                );
                self.snapshot.store(Arc::new(snapshot));
                Ok(())
            }
            Err(e) => {
                error!("route snapshot rejected: {}; keeping previous snapshot", e);
                Err(StoreError::Unavailable(e.to_string()))
            }
        }
    }

    /// Background refresh on the configured cadence.
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                let _ = self.refresh().await;
            }
        })
    }
}
