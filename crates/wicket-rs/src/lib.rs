//! # Wicket API Gateway Core
//!
//! A multi-tenant HTTP API gateway core built with Rust and Actix Web. The
//! crate implements the request processing pipeline, the ordered filter
//! chain that observes, admits, throttles, protects and routes every inbound
//! request, plus the subsystems it depends on: a sliding-window rate
//! limiter, per-route circuit breakers, a load-balanced route resolver with
//! health tracking, and a per-request context carrying trace, identity and
//! decision state.
//!
//! ## Pipeline
//!
//! ```text
//! ingress ─▶ trace start ─▶ client identify ─▶ rate limit ─▶ auth
//!        ─▶ route match ─▶ breaker reserve ─▶ instance select + forward
//!        ─▶ breaker record ─▶ trace end ─▶ response egress
//! ```
//!
//! Filters execute sequentially within a request and independently across
//! requests. The only shared state lives in the explicitly concurrent
//! subsystems (route snapshot, instance cache, breaker registry, trace map,
//! counter store).
//!
//! ## Wiring
//!
//! Construction is an explicit graph: [`pipeline::Pipeline::new`] takes the
//! client identifier, rate-limit engine, auth verifier, breaker registry,
//! route resolver, forwarder and trace recorder. External collaborators
//! (token validator, revocation set, session store, counter store, route
//! store, service registry, trace sink) are traits with one production
//! implementation each, so tests swap in fakes without touching the wiring.

pub mod config;
pub mod context;
pub mod logs;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod utils;
