//! Bootstrap policies installed into a fresh engine.
//!
//! Ids, names, priorities, and conditions are shared with existing
//! deployments and must not drift.

use crate::attribute::AttributeType;
use crate::condition::{Condition, Operator};
use crate::rule::{Effect, Priority, Rule};
use crate::types::{Policy, Target};

const SYSTEM_AUTHOR: &str = "system";

/// Endpoints that liveness and readiness probes hit.
pub const HEALTH_ENDPOINTS: [&str; 4] = ["/health", "/ready", "/live", "/metrics"];

/// Action types still permitted while `environment.maintenance_mode` is set.
pub const MAINTENANCE_ACTIONS: [&str; 3] = ["health", "metrics", "admin"];

/// The four default policies, in installation order.
pub fn default_policies() -> Vec<Policy> {
    vec![
        default_deny(),
        allow_health(),
        trust_based_access(),
        time_based_access(),
    ]
}

fn default_deny() -> Policy {
    Policy::new("default-deny", "Default Deny")
        .with_description("Deny all access by default (Zero Trust)")
        .with_rule(
            Rule::new("deny-all", "Default deny rule", Effect::Deny)
                .with_priority(Priority::DEFAULT),
        )
        .with_target(Target::new("*", "*"))
        .created_by(SYSTEM_AUTHOR)
}

fn allow_health() -> Policy {
    Policy::new("allow-health", "Allow Health Checks")
        .with_description("Allow health check endpoints")
        .with_rule(
            Rule::new("health-allow", "Allow health endpoint access", Effect::Allow)
                .with_condition(Condition::new(
                    AttributeType::Resource,
                    "endpoint",
                    Operator::In,
                    HEALTH_ENDPOINTS.to_vec(),
                ))
                .with_priority(Priority::HIGH),
        )
        .with_target(Target::new("*", "read"))
        .created_by(SYSTEM_AUTHOR)
}

fn trust_based_access() -> Policy {
    let trust = |op: Operator, threshold: i64| {
        Condition::new(AttributeType::Subject, "trust_level", op, threshold)
    };
    let sensitivity = |levels: Vec<&str>| {
        Condition::new(AttributeType::Resource, "sensitivity", Operator::In, levels)
    };

    Policy::new("trust-based-access", "Trust-Based Access Control")
        .with_description("Allow access based on trust level")
        .with_rule(
            Rule::new(
                "high-trust-allow",
                "High trust nodes can access sensitive resources",
                Effect::Allow,
            )
            .with_condition(trust(Operator::Gte, 70))
            .with_condition(sensitivity(vec!["low", "medium", "high"]))
            .with_priority(Priority::NORMAL),
        )
        .with_rule(
            Rule::new(
                "medium-trust-allow",
                "Medium trust nodes can access non-sensitive resources",
                Effect::Allow,
            )
            .with_condition(trust(Operator::Gte, 50))
            .with_condition(sensitivity(vec!["low", "medium"]))
            .with_priority(Priority::NORMAL),
        )
        .with_rule(
            Rule::new(
                "low-trust-audit",
                "Low trust nodes require audit logging",
                Effect::Audit,
            )
            .with_condition(trust(Operator::Lt, 50))
            .with_priority(Priority::NORMAL),
        )
        .with_target(Target::new("*", "*"))
        .created_by(SYSTEM_AUTHOR)
}

fn time_based_access() -> Policy {
    Policy::new("time-based-access", "Time-Based Access Control")
        .with_description("Restrict access based on time")
        .with_rule(
            Rule::new(
                "maintenance-window",
                "Deny non-essential access during maintenance",
                Effect::Deny,
            )
            .with_condition(Condition::new(
                AttributeType::Environment,
                "maintenance_mode",
                Operator::Eq,
                true,
            ))
            .with_condition(Condition::new(
                AttributeType::Action,
                "type",
                Operator::NotIn,
                MAINTENANCE_ACTIONS.to_vec(),
            ))
            .with_priority(Priority::HIGH),
        )
        .with_target(Target::new("*", "*"))
        .created_by(SYSTEM_AUTHOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::validate_policy;

    #[test]
    fn test_default_policy_ids() {
        let ids: Vec<String> = default_policies().into_iter().map(|p| p.id).collect();
        assert_eq!(
            ids,
            vec![
                "default-deny",
                "allow-health",
                "trust-based-access",
                "time-based-access"
            ]
        );
    }

    #[test]
    fn test_defaults_are_valid() {
        for policy in default_policies() {
            assert!(validate_policy(&policy).is_ok(), "{} invalid", policy.id);
            assert_eq!(policy.version, 1);
            assert_eq!(policy.created_by, "system");
        }
    }

    #[test]
    fn test_default_deny_is_lowest_precedence() {
        let policies = default_policies();
        let lowest = policies
            .iter()
            .flat_map(|p| p.rules.iter())
            .map(|r| r.priority)
            .max();
        assert_eq!(lowest, Some(Priority::DEFAULT));
        assert_eq!(policies[0].rules[0].id, "deny-all");
    }

    #[test]
    fn test_health_policy_only_targets_read() {
        let health = allow_health();
        assert!(health.matches_target("/health", "read"));
        assert!(!health.matches_target("/health", "write"));
    }

    #[test]
    fn test_trust_rules() {
        let trust = trust_based_access();
        let rule_ids: Vec<&str> = trust.rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            rule_ids,
            vec!["high-trust-allow", "medium-trust-allow", "low-trust-audit"]
        );
        assert_eq!(trust.rules[2].effect, Effect::Audit);
    }
}
