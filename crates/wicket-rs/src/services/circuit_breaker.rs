//! Per-route circuit breakers with windowed outcome tracking.
//!
//! One breaker exists per route id, created lazily by the [`BreakerRegistry`].
//! Each breaker rolls a window of call outcomes, by count or by time, and
//! opens when the failure rate or the slow-call rate crosses its threshold
//! once enough calls have been observed. Recovery goes through a half-open
//! trial phase with a bounded number of permits.
//!
//! State transitions run inside a per-route critical section that does only
//! counter math; no I/O happens under the lock.

use crate::models::route::{BreakerSettings, BreakerWindowKind};
use dashmap::DashMap;
use log::{info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// State of a circuit breaker.
///
/// * `Closed` - normal operation, calls pass through
/// * `Open` - circuit tripped, calls are denied fast
/// * `HalfOpen` - testing recovery, limited trial calls allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Completed-call report fed back by the forwarder.
///
/// `Cancelled` calls (client disconnects) count neither as success nor as
/// failure.
#[derive(Debug, Clone, Copy)]
pub enum CallOutcome {
    Success(Duration),
    Failure(Duration),
    Cancelled,
}

/// Admission decision for one call.
#[derive(Debug, Clone, Copy)]
pub enum Admission {
    Admitted,
    Rejected { retry_after: Duration },
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    failed: bool,
    slow: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    samples: VecDeque<Sample>,
    opened_at: Option<Instant>,
    half_open_remaining: u32,
    half_open_successes: u32,
}

/// Rolling-window circuit breaker for a single route.
#[derive(Debug)]
pub struct CircuitBreaker {
    route_id: String,
    config: BreakerSettings,
    inner: Mutex<BreakerInner>,
    not_permitted: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(route_id: String, config: BreakerSettings) -> Arc<Self> {
        Arc::new(Self {
            route_id,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                samples: VecDeque::new(),
                opened_at: None,
                half_open_remaining: 0,
                half_open_successes: 0,
            }),
            not_permitted: AtomicU64::new(0),
        })
    }

    /// Asks for admission of one call.
    ///
    /// Closed admits; Open denies until `wait_in_open` has elapsed, then the
    /// breaker moves to HalfOpen and hands out trial permits. A permit counts
    /// one call and is not refunded.
    pub fn try_acquire(&self) -> Admission {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => Admission::Admitted,
            CircuitState::Open => {
                let waited = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or_else(|| Duration::from_secs(0));
                let wait = Duration::from_secs(self.config.wait_in_open_secs);

                if waited >= wait {
                    self.transition_to_half_open(&mut inner);
                    inner.half_open_remaining -= 1;
                    Admission::Admitted
                } else {
                    self.not_permitted.fetch_add(1, Ordering::Relaxed);
                    Admission::Rejected {
                        retry_after: wait - waited,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_remaining > 0 {
                    inner.half_open_remaining -= 1;
                    Admission::Admitted
                } else {
                    self.not_permitted.fetch_add(1, Ordering::Relaxed);
                    Admission::Rejected {
                        retry_after: Duration::from_secs(1),
                    }
                }
            }
        }
    }

    /// Records a completed call and applies state transitions.
    pub fn record(&self, outcome: CallOutcome) {
        let (duration, failed) = match outcome {
            CallOutcome::Success(d) => (d, false),
            CallOutcome::Failure(d) => (d, true),
            CallOutcome::Cancelled => return,
        };
        let slow = duration >= Duration::from_millis(self.config.slow_call_duration_ms);

        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => {
                inner.samples.push_back(Sample {
                    at: Instant::now(),
                    failed,
                    slow,
                });
                self.prune_window(&mut inner);

                let total = inner.samples.len() as u64;
                if total >= self.config.min_calls {
                    let failed_count = inner.samples.iter().filter(|s| s.failed).count() as f64;
                    let slow_count = inner.samples.iter().filter(|s| s.slow).count() as f64;
                    let failure_rate = failed_count * 100.0 / total as f64;
                    let slow_rate = slow_count * 100.0 / total as f64;

                    if failure_rate > self.config.failure_rate_threshold
                        || slow_rate > self.config.slow_rate_threshold
                    {
                        self.transition_to_open(&mut inner, failure_rate, slow_rate);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if failed {
                    // Any half-open failure reopens the circuit.
                    self.transition_to_open(&mut inner, 100.0, 0.0);
                } else {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_permits {
                        self.transition_to_closed(&mut inner);
                    }
                }
            }
            CircuitState::Open => {
                // Late completion from before the trip; nothing to update.
            }
        }
    }

    fn prune_window(&self, inner: &mut BreakerInner) {
        match self.config.window_kind {
            BreakerWindowKind::Count => {
                while inner.samples.len() as u64 > self.config.window_size {
                    inner.samples.pop_front();
                }
            }
            BreakerWindowKind::Time => {
                let horizon = Duration::from_secs(self.config.window_size);
                while let Some(front) = inner.samples.front() {
                    if front.at.elapsed() >= horizon {
                        inner.samples.pop_front();
                    } else {
                        break;
                    }
                }
            }
        }
    }

    fn transition_to_open(&self, inner: &mut BreakerInner, failure_rate: f64, slow_rate: f64) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.samples.clear();
        inner.half_open_remaining = 0;
        inner.half_open_successes = 0;

        warn!(
            "circuit breaker {} opened (failure rate {:.1}%, slow rate {:.1}%)",
            self.route_id, failure_rate, slow_rate
        );
    }

    fn transition_to_half_open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::HalfOpen;
        inner.half_open_remaining = self.config.half_open_permits;
        inner.half_open_successes = 0;

        info!(
            "circuit breaker {} half-open, {} trial permits",
            self.route_id, self.config.half_open_permits
        );
    }

    fn transition_to_closed(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.samples.clear();
        inner.opened_at = None;
        inner.half_open_remaining = 0;
        inner.half_open_successes = 0;

        info!("circuit breaker {} closed - route recovered", self.route_id);
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Calls denied because the circuit was open or out of permits.
    pub fn not_permitted_count(&self) -> u64 {
        self.not_permitted.load(Ordering::Relaxed)
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }
}

/// Lazily populated registry of per-route breakers.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: BreakerSettings,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerSettings) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
        }
    }

    /// Returns the breaker for a route, creating it on first use.
    ///
    /// The route's policy override wins over the gateway defaults. The config
    /// is fixed at creation; a changed override applies to new breakers only.
    pub fn get_or_create(
        &self,
        route_id: &str,
        override_config: Option<&BreakerSettings>,
    ) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(route_id) {
            return existing.clone();
        }

        let config = override_config.cloned().unwrap_or_else(|| self.defaults.clone());
        self.breakers
            .entry(route_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(route_id.to_string(), config))
            .clone()
    }

    /// Current state of every breaker, for the stats snapshot.
    pub fn states(&self) -> Vec<(String, CircuitState, u64)> {
        self.breakers
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().state(),
                    entry.value().not_permitted_count(),
                )
            })
            .collect()
    }
}
