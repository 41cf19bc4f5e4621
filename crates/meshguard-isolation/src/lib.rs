//! Meshguard Isolation
//!
//! Containment for misbehaving mesh peers. Failures feed a per-peer circuit
//! breaker; violations feed escalating isolation records whose level and
//! duration follow a per-reason curve. Quarantine zones restrict who an
//! isolated peer may still talk to.
//!
//! Nothing here runs in the background. Expiry is a comparison against the
//! injected clock at call time, and callers sweep with
//! [`AutoIsolationManager::cleanup_expired`] on their own schedule.

pub mod circuit_breaker;
pub mod error;
pub mod manager;
pub mod policy;
pub mod quarantine;
pub mod record;

pub use circuit_breaker::{BreakerHealth, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::{IsolationError, IsolationResult};
pub use manager::{
    AccessVerdict, AutoIsolationManager, IsolateOptions, IsolationObserver, IsolationSettings,
    IsolationStats,
};
pub use policy::{default_policies, IsolationLevel, IsolationPolicy, IsolationReason};
pub use quarantine::QuarantineZone;
pub use record::{IsolationDuration, IsolationRecord};
