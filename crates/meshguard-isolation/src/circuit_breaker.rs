//! Circuit breaker for peer communication.
//!
//! Tracks failures per peer and stops traffic to peers that keep failing.
//! Three states: Closed (healthy), Open (failing), HalfOpen (probing).

use std::sync::Arc;

use meshguard_core::{Clock, SystemClock, Timestamp};
use serde::{Deserialize, Serialize};

use crate::error::{IsolationError, IsolationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_half_open_requests() -> u32 {
    3
}

/// Thresholds shared by every breaker a manager creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures counted while Closed before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds after the last failure before an Open circuit admits a probe.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Successful probes needed in HalfOpen to close again.
    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_requests: default_half_open_requests(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout_secs: u64, half_open_requests: u32) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_secs,
            half_open_requests,
        }
    }

    pub fn validate(&self) -> IsolationResult<()> {
        if self.failure_threshold == 0 {
            return Err(IsolationError::InvalidBreakerConfig(
                "failure_threshold must be > 0".into(),
            ));
        }
        if self.recovery_timeout_secs == 0 {
            return Err(IsolationError::InvalidBreakerConfig(
                "recovery_timeout_secs must be > 0".into(),
            ));
        }
        if self.half_open_requests == 0 {
            return Err(IsolationError::InvalidBreakerConfig(
                "half_open_requests must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerHealth {
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    pub last_failure: Option<Timestamp>,
    pub last_success: Option<Timestamp>,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// Circuit breaker for a single peer.
///
/// - Closed: all requests pass; each success pays back one failure
/// - Open: requests are rejected until the recovery timeout has elapsed
///   since the last failure
/// - HalfOpen: probes pass; enough successes close the circuit, any
///   failure reopens it
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    last_failure: Option<Timestamp>,
    last_success: Option<Timestamp>,
    total_successes: u64,
    total_failures: u64,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            last_failure: None,
            last_success: None,
            total_successes: 0,
            total_failures: 0,
            clock,
        }
    }

    /// Whether a request may go through.
    ///
    /// An Open circuit whose recovery timeout has elapsed moves to HalfOpen
    /// as part of this call and admits the request.
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovered = match self.last_failure {
                    Some(last_failure) => {
                        self.clock.now().seconds_since(&last_failure)
                            >= self.config.recovery_timeout_secs as f64
                    }
                    None => true,
                };
                if recovered {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    tracing::info!("circuit breaker half-open, probing recovery");
                }
                recovered
            }
        }
    }

    pub fn record_success(&mut self) {
        self.last_success = Some(self.clock.now());
        self.total_successes += 1;

        match self.state {
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.half_open_requests {
                    self.close();
                    tracing::info!("circuit breaker closed, peer recovered");
                }
            }
            CircuitState::Closed | CircuitState::Open => {
                self.failure_count = self.failure_count.saturating_sub(1);
            }
        }
    }

    pub fn record_failure(&mut self) {
        let now = self.clock.now();
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);
        self.total_failures += 1;

        match self.state {
            CircuitState::Closed => {
                if self.failure_count >= self.config.failure_threshold {
                    self.state = CircuitState::Open;
                    tracing::warn!(
                        failure_count = self.failure_count,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.half_open_successes = 0;
                tracing::warn!("circuit breaker reopened after failed probe");
            }
            CircuitState::Open => {
                // Already open; the refreshed last_failure extends the wait.
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn health(&self) -> BreakerHealth {
        BreakerHealth {
            state: self.state,
            failure_count: self.failure_count,
            half_open_successes: self.half_open_successes,
            last_failure: self.last_failure,
            last_success: self.last_success,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
        }
    }

    /// Force the circuit back to Closed. Lifetime totals are kept.
    pub fn reset(&mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.half_open_successes = 0;
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("health", &self.health())
            .finish()
    }
}
