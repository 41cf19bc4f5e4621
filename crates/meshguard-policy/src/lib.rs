//! Meshguard Policy Engine
//!
//! Attribute-based access control for mesh peers. Every request is reduced
//! to four attribute families (subject, resource, action, environment) and
//! evaluated against versioned, prioritized policies, producing exactly one
//! decision: ALLOW, DENY, AUDIT, or CHALLENGE.
//!
//! Key features:
//! - Typed attribute values with explicit comparator dispatch per operator
//! - Rules fire when every condition holds; lowest priority number wins
//! - Default-deny: no firing rule resolves to an implicit DENY decision
//! - Per-id version history with rollback
//! - Short-lived decision cache, cleared on every policy mutation
//! - Lossless JSON policy bundles for operator tooling
//! - Explicit enforcement middleware instead of implicit wrapping

pub mod attribute;
pub mod condition;
pub mod defaults;
pub mod enforcer;
pub mod engine;
pub mod error;
pub mod rule;
pub mod types;

pub use attribute::{Attribute, AttributeContext, AttributeMap, AttributeType, AttributeValue};
pub use condition::{Condition, Operator};
pub use defaults::default_policies;
pub use enforcer::PolicyEnforcer;
pub use engine::{PolicyEngine, PolicyEngineSettings};
pub use error::{PolicyError, PolicyResult};
pub use rule::{validate_policy, Effect, Priority, Rule};
pub use types::{AccessRequest, Decision, Policy, PolicyStats, Target, TargetPattern};
