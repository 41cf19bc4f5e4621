use std::sync::Arc;

use crate::engine::PolicyEngine;
use crate::error::{PolicyError, PolicyResult};
use crate::rule::Effect;
use crate::types::{AccessRequest, Decision};

/// Explicit enforcement middleware over a shared [`PolicyEngine`].
///
/// Call sites compose it directly: `check` when they only need the verdict,
/// `enforce` to run an operation only if the request is permitted.
#[derive(Clone)]
pub struct PolicyEnforcer {
    engine: Arc<PolicyEngine>,
}

impl PolicyEnforcer {
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    /// Evaluate `request` and turn a DENY into `PermissionDenied`.
    ///
    /// AUDIT and CHALLENGE proceed; both are logged so the caller's audit
    /// pipeline can pick them up.
    pub fn check(&self, request: &AccessRequest) -> PolicyResult<Decision> {
        let decision = self.engine.evaluate_request(request);
        let node_id = request.node_id().unwrap_or("unknown");

        match decision.effect {
            Effect::Deny => {
                tracing::warn!(
                    node_id,
                    resource = %request.resource,
                    action = %request.action,
                    policy_id = %decision.policy_id,
                    rule_id = %decision.rule_id,
                    "access denied"
                );
                return Err(PolicyError::PermissionDenied {
                    policy_id: decision.policy_id,
                    rule_id: decision.rule_id,
                    reason: decision.reason,
                });
            }
            Effect::Challenge => {
                tracing::warn!(
                    node_id,
                    resource = %request.resource,
                    action = %request.action,
                    "challenge required"
                );
            }
            Effect::Audit => {
                tracing::info!(
                    node_id,
                    resource = %request.resource,
                    action = %request.action,
                    policy_id = %decision.policy_id,
                    "audited access"
                );
            }
            Effect::Allow => {}
        }

        Ok(decision)
    }

    /// Run `operation` only if `request` is permitted.
    pub fn enforce<T, F>(&self, request: &AccessRequest, operation: F) -> PolicyResult<T>
    where
        F: FnOnce(&Decision) -> T,
    {
        let decision = self.check(request)?;
        Ok(operation(&decision))
    }
}
