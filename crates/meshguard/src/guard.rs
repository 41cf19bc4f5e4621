//! The calling layer that combines isolation state with policy decisions.

use std::sync::Arc;

use meshguard_core::Clock;
use meshguard_isolation::{
    AccessVerdict, AutoIsolationManager, IsolateOptions, IsolationLevel, IsolationObserver,
    IsolationReason, IsolationRecord, IsolationStats, QuarantineZone,
};
use meshguard_policy::{AccessRequest, Decision, PolicyEngine, PolicyStats};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::MeshGuardConfig;
use crate::error::{RootError, RootResult};

// ---------------------------------------------------------------------------
// QuarantineSync
// ---------------------------------------------------------------------------

/// Keeps a zone's membership in step with isolation levels.
///
/// A node joins the zone once its level reaches `Quarantine` and leaves it
/// when the level drops below, including on release.
pub struct QuarantineSync {
    zone: Arc<QuarantineZone>,
}

impl QuarantineSync {
    pub fn new(zone: Arc<QuarantineZone>) -> Self {
        Self { zone }
    }
}

impl IsolationObserver for QuarantineSync {
    fn on_isolation_change(&self, node_id: &str, level: IsolationLevel) {
        if level >= IsolationLevel::Quarantine {
            self.zone.add_node(node_id);
        } else {
            self.zone.remove_node(node_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Verdicts and snapshots
// ---------------------------------------------------------------------------

/// Outcome of [`MeshGuard::authorize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationVerdict {
    pub allowed: bool,
    /// Isolation check for the subject's node. `None` when the request names no node.
    pub isolation: Option<AccessVerdict>,
    /// Policy decision. `None` when isolation already refused the request.
    pub decision: Option<Decision>,
}

impl AuthorizationVerdict {
    /// The reason from whichever check settled the outcome.
    pub fn reason(&self) -> &str {
        match (&self.decision, &self.isolation) {
            (Some(decision), _) => &decision.reason,
            (None, Some(isolation)) => &isolation.reason,
            (None, None) => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshGuardStats {
    pub node_id: String,
    pub policy: PolicyStats,
    pub isolation: IsolationStats,
    pub quarantined_nodes: Vec<String>,
}

// ---------------------------------------------------------------------------
// MeshGuard
// ---------------------------------------------------------------------------

/// One node's decide-and-enforce core.
///
/// Isolation is consulted before policy: a peer that is contained never
/// reaches policy evaluation, and a policy DENY refuses a peer that
/// isolation would have let through.
pub struct MeshGuard {
    node_id: String,
    engine: Arc<PolicyEngine>,
    isolation: Arc<AutoIsolationManager>,
    zone: Arc<QuarantineZone>,
    sync_with_isolation: bool,
}

impl MeshGuard {
    /// Build every subsystem from `config`, all sharing `clock`.
    ///
    /// A configured policy bundle is imported after the bootstrap policies,
    /// replacing any of them that share an id.
    pub fn from_config(config: &MeshGuardConfig, clock: Arc<dyn Clock>) -> RootResult<Self> {
        config.validate()?;

        let engine = Arc::new(PolicyEngine::with_config(
            config.policy.engine_settings(),
            Arc::clone(&clock),
        ));
        if let Some(path) = &config.policy.bundle_path {
            let data = std::fs::read_to_string(path).map_err(|e| {
                RootError::Config(format!(
                    "cannot read policy bundle {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let imported = engine.import_policies(&data)?;
            info!(path = %path.display(), imported, "policy bundle loaded");
        }

        let isolation = Arc::new(AutoIsolationManager::with_config(
            config.node_id.clone(),
            config.isolation_settings(),
            clock,
        )?);

        let zone = QuarantineZone::new(config.quarantine.zone_id.clone())
            .with_max_bandwidth(config.quarantine.max_bandwidth)
            .with_allowed_operations(config.quarantine.allowed_operations.iter().cloned());
        for peer in &config.quarantine.allowed_peers {
            zone.add_allowed_peer(peer);
        }
        let zone = Arc::new(zone);

        let sync_with_isolation = config.quarantine.sync_with_isolation;
        if sync_with_isolation {
            isolation.register_observer(Arc::new(QuarantineSync::new(Arc::clone(&zone))));
        }

        info!(
            node_id = %config.node_id,
            policies = engine.get_stats().total_policies,
            sync_with_isolation,
            "meshguard initialized"
        );

        Ok(Self {
            node_id: config.node_id.clone(),
            engine,
            isolation,
            zone,
            sync_with_isolation,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    pub fn isolation(&self) -> &Arc<AutoIsolationManager> {
        &self.isolation
    }

    pub fn zone(&self) -> &Arc<QuarantineZone> {
        &self.zone
    }

    /// Decide whether `request` may proceed.
    ///
    /// The subject's `node_id` attribute identifies the peer for the
    /// isolation check, with the request's action as the operation.
    pub fn authorize(&self, request: &AccessRequest) -> AuthorizationVerdict {
        let isolation = request
            .node_id()
            .map(|node_id| self.isolation.is_allowed(node_id, &request.action));

        if let Some(verdict) = isolation.as_ref().filter(|v| !v.allowed) {
            debug!(
                node_id = request.node_id().unwrap_or_default(),
                action = %request.action,
                reason = %verdict.reason,
                "request refused by isolation"
            );
            return AuthorizationVerdict {
                allowed: false,
                isolation,
                decision: None,
            };
        }

        let decision = self.engine.evaluate_request(request);
        AuthorizationVerdict {
            allowed: decision.is_permitted(),
            isolation,
            decision: Some(decision),
        }
    }

    pub fn report_success(&self, node_id: &str) {
        self.isolation.record_success(node_id);
    }

    pub fn report_failure(&self, node_id: &str) {
        self.isolation.record_failure(node_id);
    }

    /// Record a violation by `node_id`, isolating or escalating it.
    pub fn report_violation(
        &self,
        node_id: &str,
        reason: IsolationReason,
        options: IsolateOptions,
    ) -> IsolationRecord {
        self.isolation.isolate_with(node_id, reason, options)
    }

    pub fn release(&self, node_id: &str, force: bool) -> bool {
        self.isolation.release(node_id, force)
    }

    /// Periodic maintenance: release expired isolations, then bring zone
    /// membership back in line with current levels. Returns how many
    /// isolations were released.
    pub fn tick(&self) -> usize {
        let released = self.isolation.cleanup_expired();
        if self.sync_with_isolation {
            self.resync_zone();
        }
        released
    }

    fn resync_zone(&self) {
        for node_id in self.zone.nodes() {
            if self.isolation.get_isolation_level(&node_id) < IsolationLevel::Quarantine {
                self.zone.remove_node(&node_id);
            }
        }
        for record in self.isolation.get_isolated_nodes() {
            if record.level >= IsolationLevel::Quarantine {
                self.zone.add_node(&record.node_id);
            }
        }
    }

    pub fn stats(&self) -> MeshGuardStats {
        MeshGuardStats {
            node_id: self.node_id.clone(),
            policy: self.engine.get_stats(),
            isolation: self.isolation.get_stats(),
            quarantined_nodes: self.zone.nodes(),
        }
    }
}
