use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::attribute::{cached_regex, AttributeContext, AttributeType, AttributeValue};

/// Comparison operators available to conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    NotIn,
    Regex,
    Contains,
    Exists,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::Gte => "gte",
            Operator::Lte => "lte",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Regex => "regex",
            Operator::Contains => "contains",
            Operator::Exists => "exists",
        };
        f.write_str(s)
    }
}

/// A predicate over one attribute of the evaluation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub attribute_type: AttributeType,
    pub attribute_name: String,
    pub operator: Operator,
    pub value: AttributeValue,
}

impl Condition {
    pub fn new(
        attribute_type: AttributeType,
        attribute_name: impl Into<String>,
        operator: Operator,
        value: impl Into<AttributeValue>,
    ) -> Self {
        Self {
            attribute_type,
            attribute_name: attribute_name.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn key(&self) -> String {
        self.attribute_type.key(&self.attribute_name)
    }

    /// Evaluate against an attribute context.
    ///
    /// Only `exists` looks at absent attributes; every other operator is
    /// false when the attribute is missing. Never panics.
    pub fn evaluate(&self, attributes: &AttributeContext) -> bool {
        let Some(attr) = attributes.lookup(self.attribute_type, &self.attribute_name) else {
            return self.operator == Operator::Exists && !self.value.is_truthy();
        };
        let actual = &attr.value;

        match self.operator {
            Operator::Eq => actual.loose_eq(&self.value),
            Operator::Ne => !actual.loose_eq(&self.value),
            Operator::Gt => actual.compare(&self.value) == Some(Ordering::Greater),
            Operator::Lt => actual.compare(&self.value) == Some(Ordering::Less),
            Operator::Gte => matches!(
                actual.compare(&self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lte => matches!(
                actual.compare(&self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::In => self.value.contains_member(actual).unwrap_or(false),
            Operator::NotIn => self
                .value
                .contains_member(actual)
                .map(|member| !member)
                .unwrap_or(false),
            Operator::Regex => match self.compiled_regex() {
                Ok(re) => re.is_match(&actual.to_string()),
                Err(e) => {
                    tracing::warn!(
                        attribute = %self.key(),
                        error = %e,
                        "invalid regex in condition"
                    );
                    false
                }
            },
            Operator::Contains => actual.to_string().contains(&self.value.to_string()),
            Operator::Exists => self.value.is_truthy(),
        }
    }

    /// Compile the regex for a `regex` condition, anchored at the start of
    /// the stringified value.
    pub(crate) fn compiled_regex(&self) -> Result<Regex, regex::Error> {
        cached_regex(&format!("^(?:{})", self.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;

    fn ctx_with(name: &str, value: impl Into<AttributeValue>) -> AttributeContext {
        let mut ctx = AttributeContext::new();
        ctx.insert(Attribute::new(AttributeType::Subject, name, value));
        ctx
    }

    fn cond(op: Operator, value: impl Into<AttributeValue>) -> Condition {
        Condition::new(AttributeType::Subject, "x", op, value)
    }

    #[test]
    fn test_eq_operator() {
        let ctx = ctx_with("x", "a");
        assert!(cond(Operator::Eq, "a").evaluate(&ctx));
        assert!(!cond(Operator::Eq, "b").evaluate(&ctx));
    }

    #[test]
    fn test_ne_operator() {
        let ctx = ctx_with("x", "a");
        assert!(cond(Operator::Ne, "b").evaluate(&ctx));
        assert!(!cond(Operator::Ne, "a").evaluate(&ctx));
    }

    #[test]
    fn test_numeric_operators() {
        let ctx = ctx_with("x", 70);
        assert!(cond(Operator::Gt, 69).evaluate(&ctx));
        assert!(!cond(Operator::Gt, 70).evaluate(&ctx));
        assert!(cond(Operator::Lt, 70.5).evaluate(&ctx));
        assert!(cond(Operator::Gte, 70).evaluate(&ctx));
        assert!(cond(Operator::Lte, 70).evaluate(&ctx));
        assert!(!cond(Operator::Lte, 69).evaluate(&ctx));
    }

    #[test]
    fn test_numeric_operator_against_string_is_false() {
        let ctx = ctx_with("x", "70");
        assert!(!cond(Operator::Gte, 50).evaluate(&ctx));
        assert!(!cond(Operator::Lt, 50).evaluate(&ctx));
    }

    #[test]
    fn test_in_operator() {
        let ctx = ctx_with("x", "medium");
        assert!(cond(Operator::In, vec!["low", "medium"]).evaluate(&ctx));
        assert!(!cond(Operator::In, vec!["high"]).evaluate(&ctx));
    }

    #[test]
    fn test_in_operator_with_string_haystack() {
        let ctx = ctx_with("x", "ell");
        assert!(cond(Operator::In, "hello").evaluate(&ctx));
    }

    #[test]
    fn test_not_in_operator() {
        let ctx = ctx_with("x", "write");
        assert!(cond(Operator::NotIn, vec!["health", "metrics", "admin"]).evaluate(&ctx));
        let ctx = ctx_with("x", "admin");
        assert!(!cond(Operator::NotIn, vec!["health", "metrics", "admin"]).evaluate(&ctx));
    }

    #[test]
    fn test_not_in_against_scalar_is_false() {
        let ctx = ctx_with("x", "write");
        assert!(!cond(Operator::NotIn, 5).evaluate(&ctx));
    }

    #[test]
    fn test_regex_operator_anchored_at_start() {
        let ctx = ctx_with("x", "spiffe://mesh/node/7");
        assert!(cond(Operator::Regex, "spiffe://mesh/").evaluate(&ctx));
        assert!(!cond(Operator::Regex, "node/7").evaluate(&ctx));
        assert!(cond(Operator::Regex, ".*node/7$").evaluate(&ctx));
    }

    #[test]
    fn test_invalid_regex_is_false() {
        let ctx = ctx_with("x", "abc");
        assert!(!cond(Operator::Regex, "[").evaluate(&ctx));
    }

    #[test]
    fn test_regex_condition_reused_across_requests() {
        let condition = cond(Operator::Regex, "node-\\d+");
        for i in 0..50 {
            assert!(condition.evaluate(&ctx_with("x", format!("node-{}", i).as_str())));
            assert!(!condition.evaluate(&ctx_with("x", format!("edge-{}", i).as_str())));
        }
        let invalid = cond(Operator::Regex, "(");
        for _ in 0..3 {
            assert!(!invalid.evaluate(&ctx_with("x", "(")));
        }
    }

    #[test]
    fn test_contains_operator() {
        let ctx = ctx_with("x", "/api/v1/secret");
        assert!(cond(Operator::Contains, "secret").evaluate(&ctx));
        assert!(!cond(Operator::Contains, "public").evaluate(&ctx));
    }

    #[test]
    fn test_exists_operator_true() {
        let ctx = ctx_with("x", 1);
        assert!(cond(Operator::Exists, true).evaluate(&ctx));
        assert!(!cond(Operator::Exists, true).evaluate(&AttributeContext::new()));
    }

    #[test]
    fn test_exists_operator_false() {
        let ctx = ctx_with("x", 1);
        assert!(!cond(Operator::Exists, false).evaluate(&ctx));
        assert!(cond(Operator::Exists, false).evaluate(&AttributeContext::new()));
    }

    #[test]
    fn test_missing_attribute_returns_false() {
        let empty = AttributeContext::new();
        for op in [
            Operator::Eq,
            Operator::Ne,
            Operator::Gt,
            Operator::Lt,
            Operator::Gte,
            Operator::Lte,
            Operator::In,
            Operator::NotIn,
            Operator::Regex,
            Operator::Contains,
        ] {
            assert!(!cond(op, vec!["a"]).evaluate(&empty), "{} on missing attribute", op);
        }
    }

    #[test]
    fn test_wire_format() {
        let c = Condition::new(
            AttributeType::Action,
            "type",
            Operator::NotIn,
            vec!["health", "metrics"],
        );
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["attribute_type"], "action");
        assert_eq!(json["attribute_name"], "type");
        assert_eq!(json["operator"], "not_in");
        assert_eq!(json["value"][1], "metrics");
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let raw = r#"{"attribute_type":"subject","attribute_name":"x","operator":"like","value":1}"#;
        assert!(serde_json::from_str::<Condition>(raw).is_err());
    }
}
