use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::attribute::AttributeContext;
use crate::condition::{Condition, Operator};
use crate::types::Policy;

/// Outcome a firing rule imposes on the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
    /// Allow, but the access must be logged.
    Audit,
    /// Require additional verification from the caller.
    Challenge,
}

impl Effect {
    /// Whether the request may proceed under this effect.
    pub fn is_permitted(&self) -> bool {
        !matches!(self, Effect::Deny)
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Allow => write!(f, "ALLOW"),
            Effect::Deny => write!(f, "DENY"),
            Effect::Audit => write!(f, "AUDIT"),
            Effect::Challenge => write!(f, "CHALLENGE"),
        }
    }
}

/// Rule precedence. Lower numbers are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    /// Overrides everything.
    pub const EMERGENCY: Priority = Priority(0);
    pub const CRITICAL: Priority = Priority(10);
    pub const HIGH: Priority = Priority(20);
    pub const NORMAL: Priority = Priority(30);
    pub const LOW: Priority = Priority(40);
    /// Catch-all rules such as the global default deny.
    pub const DEFAULT: Priority = Priority(50);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn default_true() -> bool {
    true
}

/// A prioritized rule: fires when every condition holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub effect: Effect,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Rule {
    pub fn new(id: impl Into<String>, description: impl Into<String>, effect: Effect) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            conditions: Vec::new(),
            effect,
            priority: Priority::default(),
            enabled: true,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Returns the rule's effect if it is enabled and all conditions hold.
    /// A rule with no conditions always fires.
    pub fn evaluate(&self, attributes: &AttributeContext) -> Option<Effect> {
        if !self.enabled {
            return None;
        }
        if self.conditions.iter().all(|c| c.evaluate(attributes)) {
            Some(self.effect)
        } else {
            None
        }
    }
}

/// Structural validation of a policy before it reaches the engine.
///
/// Returns every problem found rather than stopping at the first.
pub fn validate_policy(policy: &Policy) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if policy.id.trim().is_empty() {
        errors.push("policy id must not be empty".to_string());
    }
    if policy.version == 0 {
        errors.push(format!("policy '{}': version must be >= 1", policy.id));
    }

    let mut seen = HashSet::new();
    for rule in &policy.rules {
        if rule.id.trim().is_empty() {
            errors.push(format!("policy '{}': rule id must not be empty", policy.id));
        } else if !seen.insert(rule.id.as_str()) {
            errors.push(format!(
                "policy '{}': duplicate rule id '{}'",
                policy.id, rule.id
            ));
        }

        for condition in &rule.conditions {
            if condition.attribute_name.trim().is_empty() {
                errors.push(format!(
                    "policy '{}' rule '{}': condition attribute name must not be empty",
                    policy.id, rule.id
                ));
            }
            if condition.operator == Operator::Regex {
                if let Err(e) = condition.compiled_regex() {
                    errors.push(format!(
                        "policy '{}' rule '{}': invalid regex for {}: {}",
                        policy.id,
                        rule.id,
                        condition.key(),
                        e
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
