//! Meshguard Root Library
//!
//! The decide-and-enforce core for one node of a zero-trust service mesh.
//! Ties together the ABAC policy engine (`meshguard-policy`) and the
//! containment machinery (`meshguard-isolation`) behind a single
//! [`MeshGuard`] built from a TOML [`MeshGuardConfig`].
//!
//! # Architecture
//!
//! `MeshGuard` is a thin orchestrator. Every request first passes the
//! isolation check for the calling peer (circuit breaker, then isolation
//! level), and only then is evaluated against policy. Violations and
//! failures are reported back into the isolation manager, and a
//! [`QuarantineSync`] observer keeps the quarantine zone aligned with
//! isolation levels.

pub mod config;
pub mod error;
pub mod guard;

pub use config::{IsolationConfig, MeshGuardConfig, PolicyConfig, QuarantineConfig};
pub use error::{RootError, RootResult};
pub use guard::{AuthorizationVerdict, MeshGuard, MeshGuardStats, QuarantineSync};

pub use meshguard_core::{Clock, ManualClock, SystemClock, Timestamp};
pub use meshguard_isolation::{
    AutoIsolationManager, IsolateOptions, IsolationLevel, IsolationReason, QuarantineZone,
};
pub use meshguard_policy::{AccessRequest, AttributeValue, Decision, Effect, PolicyEngine};
