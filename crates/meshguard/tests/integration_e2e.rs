//! End-to-end integration test: "Does the mesh actually contain a bad peer?"
//!
//! This test tells a story about one gateway node, `gw-1`:
//!
//! 1. The gateway boots with the bootstrap policies: health probes pass,
//!    everything unmatched is denied.
//! 2. A trusted service reads sensitive data; an untrusted one is audited.
//! 3. An operator ships a policy bundle; it round-trips losslessly and the
//!    gateway loaded from config enforces it.
//! 4. A peer keeps failing authentication and climbs the escalation ladder
//!    until it is blocked, then recovers when the isolation lapses.
//! 5. A compromised peer escalates into quarantine; the zone follows.
//! 6. A flaky peer trips its circuit breaker and earns its way back.
//! 7. A maintenance window shuts non-essential traffic even for trusted peers.
//!
//! Time is simulated throughout with a shared `ManualClock`.

use std::sync::Arc;
use std::time::Duration;

use meshguard::{
    AccessRequest, Effect, IsolateOptions, IsolationLevel, IsolationReason, ManualClock,
    MeshGuard, MeshGuardConfig, PolicyEngine, Timestamp,
};
use meshguard_core::Clock;
use meshguard_isolation::CircuitState;
use meshguard_policy::{
    AttributeType, Condition, Operator, Policy, PolicyEngineSettings, Priority, Rule, Target,
};

const BOOT: u64 = 1_700_000_000;

fn boot_gateway(config: MeshGuardConfig) -> (MeshGuard, ManualClock) {
    let clock = ManualClock::new(Timestamp::from_seconds(BOOT));
    let guard = MeshGuard::from_config(&config, Arc::new(clock.clone())).unwrap();
    (guard, clock)
}

fn gateway_config() -> MeshGuardConfig {
    MeshGuardConfig {
        node_id: "gw-1".into(),
        ..MeshGuardConfig::default()
    }
}

fn read_orders(node_id: &str, trust_level: i64) -> AccessRequest {
    AccessRequest::new("/api/orders", "read")
        .with_subject("node_id", node_id)
        .with_subject("trust_level", trust_level)
        .with_resource_attribute("sensitivity", "medium")
}

fn catalog_policy() -> Policy {
    Policy::new("catalog-read", "Catalog Read Access")
        .with_description("Services may read the catalog")
        .with_rule(
            Rule::new("service-read", "Services can read the catalog", Effect::Allow)
                .with_condition(Condition::new(
                    AttributeType::Subject,
                    "role",
                    Operator::Eq,
                    "service",
                ))
                .with_priority(Priority::HIGH),
        )
        .with_target(Target::new("/api/catalog", "read"))
}

// ============================================================================
// Chapter 1: The gateway boots
// ============================================================================

#[test]
fn chapter_1_gateway_boots_with_default_deny() {
    let (guard, _) = boot_gateway(gateway_config());

    let stats = guard.stats();
    assert_eq!(stats.node_id, "gw-1");
    assert_eq!(
        stats.policy.policy_ids,
        vec![
            "allow-health",
            "default-deny",
            "time-based-access",
            "trust-based-access"
        ]
    );

    // Liveness probes always get through
    let probe = AccessRequest::new("/ready", "read").with_subject("node_id", "kubelet");
    let verdict = guard.authorize(&probe);
    assert!(verdict.allowed);
    assert_eq!(verdict.decision.unwrap().rule_id, "health-allow");

    // Anything else with no supporting attributes is denied
    let anonymous = AccessRequest::new("/api/orders", "delete").with_subject("node_id", "p-1");
    let verdict = guard.authorize(&anonymous);
    assert!(!verdict.allowed);
    let decision = verdict.decision.unwrap();
    assert_eq!(decision.policy_id, "default-deny");
    assert_eq!(decision.reason, "Default deny rule");
}

// ============================================================================
// Chapter 2: Trust decides
// ============================================================================

#[test]
fn chapter_2_trust_levels_decide_access() {
    let (guard, _) = boot_gateway(gateway_config());

    let verdict = guard.authorize(&read_orders("billing", 85));
    assert!(verdict.allowed);
    assert_eq!(verdict.decision.unwrap().rule_id, "high-trust-allow");

    // Medium trust on a medium-sensitivity resource
    let verdict = guard.authorize(&read_orders("reports", 55));
    assert!(verdict.allowed);
    assert_eq!(verdict.decision.unwrap().rule_id, "medium-trust-allow");

    // Low trust proceeds but is audited
    let verdict = guard.authorize(&read_orders("intern-bot", 10));
    assert!(verdict.allowed);
    let decision = verdict.decision.unwrap();
    assert_eq!(decision.effect, Effect::Audit);
    assert_eq!(decision.rule_id, "low-trust-audit");
}

// ============================================================================
// Chapter 3: An operator ships a policy bundle
// ============================================================================

#[test]
fn chapter_3_policy_bundle_roundtrip_and_load() {
    let clock = ManualClock::new(Timestamp::from_seconds(BOOT));

    // The operator builds the bundle on a workstation engine
    let workstation = PolicyEngine::with_config(
        PolicyEngineSettings::default(),
        Arc::new(clock.clone()),
    );
    workstation.add_policy(catalog_policy()).unwrap();
    let bundle = workstation.export_policies().unwrap();

    // Export then import into an empty engine reproduces the bundle exactly
    let replica = PolicyEngine::with_config(
        PolicyEngineSettings {
            load_defaults: false,
            ..PolicyEngineSettings::default()
        },
        Arc::new(clock.clone()),
    );
    assert_eq!(replica.import_policies(&bundle).unwrap(), 5);
    assert_eq!(replica.export_policies().unwrap(), bundle);

    // The gateway picks the bundle up from its config
    let dir = std::env::temp_dir().join("meshguard-e2e-bundle");
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let bundle_path = dir.join("bundle.json");
    std::fs::write(&bundle_path, &bundle).unwrap();

    let mut config = gateway_config();
    config.policy.bundle_path = Some(bundle_path);
    let guard = MeshGuard::from_config(&config, Arc::new(clock)).unwrap();

    let request = AccessRequest::new("/api/catalog", "read")
        .with_subject("node_id", "storefront")
        .with_subject("role", "service");
    let verdict = guard.authorize(&request);
    assert!(verdict.allowed);
    assert_eq!(verdict.decision.unwrap().policy_id, "catalog-read");

    // A broken bundle is rejected at startup
    std::fs::write(dir.join("bundle.json"), r#"[{"id": "x"}]"#).unwrap();
    assert!(MeshGuard::from_config(&config, Arc::new(ManualClock::starting_now())).is_err());

    let _ = std::fs::remove_dir_all(&dir);
}

// ============================================================================
// Chapter 4: Repeated auth failures climb the ladder
// ============================================================================

#[test]
fn chapter_4_auth_failures_escalate_then_recover() {
    let (guard, clock) = boot_gateway(gateway_config());
    let peer = "scanner-7";

    let first = guard.report_violation(peer, IsolationReason::AuthFailure, IsolateOptions::default());
    assert_eq!(first.level, IsolationLevel::RateLimit);
    assert_eq!(first.escalation_count, 0);

    // Rate limited peers still reach policy
    assert!(guard.authorize(&read_orders(peer, 80)).allowed);

    let second =
        guard.report_violation(peer, IsolationReason::AuthFailure, IsolateOptions::default());
    assert_eq!(second.level, IsolationLevel::Restricted);
    assert_eq!(second.escalation_count, 1);
    assert_eq!(
        second.expires_at.unwrap().seconds_since(&clock.now()).round() as u64,
        180
    );

    // Restricted: essential operations only
    let verdict = guard.authorize(&read_orders(peer, 80));
    assert!(!verdict.allowed);
    assert!(verdict.decision.is_none());
    let auth = AccessRequest::new("/auth", "auth").with_subject("node_id", peer);
    assert!(guard.authorize(&auth).isolation.unwrap().allowed);

    let third = guard.report_violation(peer, IsolationReason::AuthFailure, IsolateOptions::default());
    assert_eq!(third.level, IsolationLevel::Blocked);
    assert_eq!(
        third.expires_at.unwrap().seconds_since(&clock.now()).round() as u64,
        540
    );
    assert!(!guard.authorize(&auth).allowed);
    assert_eq!(guard.isolation().violation_count(peer, IsolationReason::AuthFailure), 3);

    // The isolation lapses and the periodic sweep clears it
    clock.advance(Duration::from_secs(541));
    assert_eq!(guard.tick(), 1);
    assert_eq!(guard.isolation().get_isolation_level(peer), IsolationLevel::None);
    assert!(guard.authorize(&read_orders(peer, 80)).allowed);

    // A fresh failure after the lapse starts over at the bottom rung
    let again = guard.report_violation(peer, IsolationReason::AuthFailure, IsolateOptions::default());
    assert_eq!(again.level, IsolationLevel::RateLimit);
    assert_eq!(again.escalation_count, 0);
}

// ============================================================================
// Chapter 5: A compromised peer is quarantined
// ============================================================================

#[test]
fn chapter_5_threat_escalates_into_quarantine() {
    let mut config = gateway_config();
    config.quarantine.allowed_peers = vec!["forensics".into()];
    let (guard, _) = boot_gateway(config);
    let peer = "compromised-3";

    guard.report_violation(
        peer,
        IsolationReason::ThreatDetected,
        IsolateOptions::default().details("beaconing to known C2 address"),
    );
    assert!(!guard.zone().is_quarantined(peer));

    let record = guard.report_violation(
        peer,
        IsolationReason::ThreatDetected,
        IsolateOptions::default(),
    );
    assert_eq!(record.level, IsolationLevel::Quarantine);
    assert_eq!(record.details, "beaconing to known C2 address");
    assert!(guard.zone().is_quarantined(peer));

    // Inside the zone: only health checks, only with allowed peers
    let health = AccessRequest::new("/health", "health").with_subject("node_id", peer);
    assert!(guard.authorize(&health).isolation.unwrap().allowed);
    let write = AccessRequest::new("/api/orders", "write").with_subject("node_id", peer);
    assert_eq!(guard.authorize(&write).reason(), "Quarantine - blocked");

    assert!(guard.zone().can_communicate(peer, "forensics"));
    assert!(!guard.zone().can_communicate(peer, "billing"));
    assert!(guard.zone().is_operation_allowed("metrics"));

    let stats = guard.stats();
    assert_eq!(stats.isolation.total_isolated, 1);
    assert_eq!(
        stats.isolation.by_level.get(&IsolationLevel::Quarantine),
        Some(&1)
    );
    assert_eq!(stats.quarantined_nodes, vec![peer]);

    // An operator clears the peer
    assert!(guard.release(peer, false));
    assert!(!guard.zone().is_quarantined(peer));
    assert!(guard.stats().quarantined_nodes.is_empty());
}

#[test]
fn chapter_5b_protocol_violations_need_a_forced_release() {
    let (guard, clock) = boot_gateway(gateway_config());
    let peer = "legacy-1";

    guard.report_violation(peer, IsolationReason::ProtocolViolation, IsolateOptions::default());
    assert!(guard.zone().is_quarantined(peer));

    // Lapsed but not auto-recovering: still contained
    clock.advance(Duration::from_secs(3_601));
    assert_eq!(guard.tick(), 0);
    assert_eq!(
        guard.isolation().get_isolation_level(peer),
        IsolationLevel::Quarantine
    );
    assert!(!guard.release(peer, false));
    assert!(guard.zone().is_quarantined(peer));

    assert!(guard.release(peer, true));
    assert!(!guard.zone().is_quarantined(peer));
}

// ============================================================================
// Chapter 6: A flaky peer trips its breaker
// ============================================================================

#[test]
fn chapter_6_flaky_peer_trips_and_recovers_breaker() {
    let mut config = gateway_config();
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.recovery_timeout_secs = 30;
    config.circuit_breaker.half_open_requests = 2;
    let (guard, clock) = boot_gateway(config);
    let peer = "inventory";

    for _ in 0..3 {
        guard.report_failure(peer);
    }
    assert_eq!(guard.isolation().circuit_state(peer), Some(CircuitState::Open));

    let verdict = guard.authorize(&read_orders(peer, 90));
    assert!(!verdict.allowed);
    assert_eq!(verdict.reason(), "Circuit breaker open");

    // After the recovery timeout the breaker lets probes through
    clock.advance(Duration::from_secs(30));
    assert!(guard.authorize(&read_orders(peer, 90)).allowed);
    assert_eq!(
        guard.isolation().circuit_state(peer),
        Some(CircuitState::HalfOpen)
    );

    // A failed probe reopens it
    guard.report_failure(peer);
    assert_eq!(guard.isolation().circuit_state(peer), Some(CircuitState::Open));

    clock.advance(Duration::from_secs(31));
    assert!(guard.authorize(&read_orders(peer, 90)).allowed);
    guard.report_success(peer);
    guard.report_success(peer);
    assert_eq!(
        guard.isolation().circuit_state(peer),
        Some(CircuitState::Closed)
    );
    assert_eq!(guard.stats().isolation.open_circuit_breakers, 0);
}

// ============================================================================
// Chapter 7: Maintenance window
// ============================================================================

#[test]
fn chapter_7_maintenance_window_overrides_trust() {
    let (guard, _) = boot_gateway(gateway_config());

    let write = read_orders("billing", 95).with_environment("maintenance_mode", true);
    let write = AccessRequest {
        action: "write".into(),
        ..write
    };
    let verdict = guard.authorize(&write);
    assert!(!verdict.allowed);
    assert_eq!(verdict.decision.unwrap().rule_id, "maintenance-window");

    // Admin actions still go through the trust rules
    let admin = AccessRequest {
        action: "admin".into(),
        ..write
    };
    let verdict = guard.authorize(&admin);
    assert!(verdict.allowed);
    assert_eq!(verdict.decision.unwrap().rule_id, "high-trust-allow");
}
