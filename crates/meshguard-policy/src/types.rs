use meshguard_core::Timestamp;
use serde::{Deserialize, Serialize};

use crate::attribute::{AttributeMap, AttributeValue};
use crate::rule::{Effect, Rule};

// ---------------------------------------------------------------------------
// Target: which (resource, action) pairs a policy applies to
// ---------------------------------------------------------------------------

/// A resource or action pattern: `"*"`, an exact string, or a list of
/// accepted values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetPattern {
    One(String),
    AnyOf(Vec<String>),
}

impl TargetPattern {
    pub fn any() -> Self {
        TargetPattern::One("*".to_string())
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            TargetPattern::One(p) => p == "*" || p == value,
            TargetPattern::AnyOf(values) => values.iter().any(|v| v == value),
        }
    }
}

impl Default for TargetPattern {
    fn default() -> Self {
        TargetPattern::any()
    }
}

impl From<&str> for TargetPattern {
    fn from(v: &str) -> Self {
        TargetPattern::One(v.to_string())
    }
}

impl From<Vec<&str>> for TargetPattern {
    fn from(v: Vec<&str>) -> Self {
        TargetPattern::AnyOf(v.into_iter().map(String::from).collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub resource: TargetPattern,
    #[serde(default)]
    pub action: TargetPattern,
}

impl Target {
    pub fn new(resource: impl Into<TargetPattern>, action: impl Into<TargetPattern>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
        }
    }

    /// Both the resource and the action pattern must match.
    pub fn matches(&self, resource: &str, action: &str) -> bool {
        self.resource.matches(resource) && self.action.matches(action)
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

fn initial_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// A versioned set of rules scoped to a target.
///
/// Bookkeeping fields (`created_at`, `updated_at`, `created_by`) are local
/// to the engine instance and are not part of the exported bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "initial_version")]
    pub version: u32,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub target: Target,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(skip, default = "Timestamp::now")]
    pub created_at: Timestamp,
    #[serde(skip, default = "Timestamp::now")]
    pub updated_at: Timestamp,
    #[serde(skip)]
    pub created_by: String,
}

impl Policy {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Timestamp::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: initial_version(),
            rules: Vec::new(),
            target: Target::default(),
            enabled: true,
            created_at: now,
            updated_at: now,
            created_by: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn created_by(mut self, creator: impl Into<String>) -> Self {
        self.created_by = creator.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn matches_target(&self, resource: &str, action: &str) -> bool {
        self.target.matches(resource, action)
    }
}

// ---------------------------------------------------------------------------
// Decision: one per evaluation, never mutated after return
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub effect: Effect,
    pub policy_id: String,
    pub rule_id: String,
    pub reason: String,
    pub attributes_evaluated: usize,
    pub evaluation_time_ms: f64,
}

impl Decision {
    /// Policy id reported when nothing fired.
    pub const IMPLICIT_POLICY_ID: &'static str = "implicit";
    /// Rule id reported when nothing fired.
    pub const NO_MATCH_RULE_ID: &'static str = "no-match";

    pub fn is_permitted(&self) -> bool {
        self.effect.is_permitted()
    }

    pub fn is_implicit_deny(&self) -> bool {
        self.policy_id == Self::IMPLICIT_POLICY_ID && self.rule_id == Self::NO_MATCH_RULE_ID
    }
}

// ---------------------------------------------------------------------------
// AccessRequest: caller-facing bundle of evaluation inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessRequest {
    #[serde(default)]
    pub subject: AttributeMap,
    pub resource: String,
    /// Extra `resource.*` facts such as `sensitivity`. `name` and
    /// `endpoint` are always derived from `resource`.
    #[serde(default)]
    pub resource_attributes: AttributeMap,
    pub action: String,
    #[serde(default)]
    pub environment: Option<AttributeMap>,
}

impl AccessRequest {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            subject: AttributeMap::new(),
            resource: resource.into(),
            resource_attributes: AttributeMap::new(),
            action: action.into(),
            environment: None,
        }
    }

    pub fn with_subject(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.subject.insert(key.into(), value.into());
        self
    }

    pub fn with_resource_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.resource_attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_environment(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.environment
            .get_or_insert_with(AttributeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// The requesting peer, taken from `subject.node_id`.
    pub fn node_id(&self) -> Option<&str> {
        self.subject.get("node_id").and_then(AttributeValue::as_str)
    }
}

// ---------------------------------------------------------------------------
// PolicyStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStats {
    pub total_policies: usize,
    pub enabled_policies: usize,
    pub total_rules: usize,
    pub cache_size: usize,
    pub policy_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_target_wildcard() {
        let p = Policy::new("p", "P");
        assert!(p.matches_target("/anything", "write"));
    }

    #[test]
    fn test_matches_target_exact() {
        let p = Policy::new("p", "P").with_target(Target::new("/api", "read"));
        assert!(p.matches_target("/api", "read"));
        assert!(!p.matches_target("/api", "write"));
        assert!(!p.matches_target("/other", "read"));
    }

    #[test]
    fn test_matches_target_list() {
        let p = Policy::new("p", "P").with_target(Target::new(vec!["/a", "/b"], "*"));
        assert!(p.matches_target("/b", "delete"));
        assert!(!p.matches_target("/c", "delete"));
    }

    #[test]
    fn test_target_defaults_to_wildcard_when_missing() {
        let p: Policy = serde_json::from_str(r#"{"id":"p","name":"P","target":{}}"#).unwrap();
        assert_eq!(p.target, Target::default());
        assert_eq!(p.version, 1);
        assert!(p.enabled);
    }

    #[test]
    fn test_policy_wire_format_omits_bookkeeping() {
        let p = Policy::new("p", "P")
            .created_by("system")
            .with_target(Target::new(vec!["/a"], "read"));
        let json = serde_json::to_value(&p).unwrap();
        assert!(json.get("created_at").is_none());
        assert!(json.get("created_by").is_none());
        assert_eq!(json["target"]["resource"][0], "/a");
        assert_eq!(json["target"]["action"], "read");
    }

    #[test]
    fn test_access_request_builder() {
        let req = AccessRequest::new("/api", "read")
            .with_subject("node_id", "n1")
            .with_subject("trust_level", 80)
            .with_resource_attribute("sensitivity", "low")
            .with_environment("maintenance_mode", false);
        assert_eq!(req.node_id(), Some("n1"));
        assert_eq!(req.resource_attributes.len(), 1);
        assert_eq!(req.subject.len(), 2);
        assert_eq!(req.environment.as_ref().map(|e| e.len()), Some(1));
    }

    #[test]
    fn test_decision_implicit_deny() {
        let d = Decision {
            effect: Effect::Deny,
            policy_id: Decision::IMPLICIT_POLICY_ID.into(),
            rule_id: Decision::NO_MATCH_RULE_ID.into(),
            reason: "No matching policy rules".into(),
            attributes_evaluated: 3,
            evaluation_time_ms: 0.1,
        };
        assert!(d.is_implicit_deny());
        assert!(!d.is_permitted());
    }
}
