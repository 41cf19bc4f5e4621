use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, OnceLock, PoisonError};

/// Free-form attribute map supplied by callers (subject or environment facts).
pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// Prefix that turns a string pattern into a regular expression.
const REGEX_PATTERN_PREFIX: &str = "regex:";

/// Compiled patterns are kept until the cache reaches this many entries, then
/// it starts over.
const REGEX_CACHE_CAPACITY: usize = 512;

type RegexCache = HashMap<String, Result<Regex, regex::Error>>;

static REGEX_CACHE: OnceLock<Mutex<RegexCache>> = OnceLock::new();

/// Compile `source`, reusing an earlier compilation of the same text.
/// Invalid patterns are cached too.
pub(crate) fn cached_regex(source: &str) -> Result<Regex, regex::Error> {
    let cache = REGEX_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(compiled) = cache.get(source) {
        return compiled.clone();
    }
    if cache.len() >= REGEX_CACHE_CAPACITY {
        cache.clear();
    }
    let compiled = Regex::new(source);
    cache.insert(source.to_string(), compiled.clone());
    compiled
}

// ---------------------------------------------------------------------------
// AttributeType
// ---------------------------------------------------------------------------

/// The four ABAC attribute families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    /// Who: node, user, or service.
    Subject,
    /// What: data, endpoint, or service.
    Resource,
    /// How: read, write, execute.
    Action,
    /// When and where: time, location, network state.
    Environment,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::Subject => "subject",
            AttributeType::Resource => "resource",
            AttributeType::Action => "action",
            AttributeType::Environment => "environment",
        }
    }

    /// Context key for an attribute of this type, e.g. `subject.trust_level`.
    pub fn key(&self, name: &str) -> String {
        format!("{}.{}", self.as_str(), name)
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AttributeValue: tagged union over the value shapes policies compare
// ---------------------------------------------------------------------------

/// A scalar or collection attribute value.
///
/// Serialized untagged so policy bundles carry plain JSON values. Integers
/// and floats compare numerically with each other; every other cross-type
/// comparison is simply false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(i) => Some(*i as f64),
            AttributeValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            AttributeValue::Null => false,
            AttributeValue::Bool(b) => *b,
            AttributeValue::Int(i) => *i != 0,
            AttributeValue::Float(f) => *f != 0.0,
            AttributeValue::String(s) => !s.is_empty(),
            AttributeValue::List(items) => !items.is_empty(),
            AttributeValue::Map(entries) => !entries.is_empty(),
        }
    }

    /// Equality with numeric promotion (`Int(70) == Float(70.0)`).
    pub fn loose_eq(&self, other: &AttributeValue) -> bool {
        match (self, other) {
            (AttributeValue::List(a), AttributeValue::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (AttributeValue::Map(a), AttributeValue::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.loose_eq(vb))
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => self == other,
            },
        }
    }

    /// Ordering between comparable values: numbers, strings, booleans.
    pub fn compare(&self, other: &AttributeValue) -> Option<Ordering> {
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            return a.partial_cmp(&b);
        }
        match (self, other) {
            (AttributeValue::String(a), AttributeValue::String(b)) => Some(a.cmp(b)),
            (AttributeValue::Bool(a), AttributeValue::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Membership of `item` in `self`.
    ///
    /// Lists test element equality, maps test key presence, strings test
    /// substring containment. `None` when `self` is not a collection.
    pub fn contains_member(&self, item: &AttributeValue) -> Option<bool> {
        match self {
            AttributeValue::List(items) => Some(items.iter().any(|v| v.loose_eq(item))),
            AttributeValue::Map(entries) => Some(
                item.as_str()
                    .map(|key| entries.contains_key(key))
                    .unwrap_or(false),
            ),
            AttributeValue::String(haystack) => {
                Some(item.as_str().map(|n| haystack.contains(n)).unwrap_or(false))
            }
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Null => f.write_str("null"),
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Int(i) => write!(f, "{}", i),
            AttributeValue::Float(x) => write!(f, "{}", x),
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            AttributeValue::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Int(i64::from(v))
    }
}

impl From<u32> for AttributeValue {
    fn from(v: u32) -> Self {
        AttributeValue::Int(i64::from(v))
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(v: Vec<T>) -> Self {
        AttributeValue::List(v.into_iter().map(Into::into).collect())
    }
}

// ---------------------------------------------------------------------------
// Attribute
// ---------------------------------------------------------------------------

/// A single typed fact about a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub attribute_type: AttributeType,
    pub name: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(
        attribute_type: AttributeType,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        Self {
            attribute_type,
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> String {
        self.attribute_type.key(&self.name)
    }

    /// Check whether this attribute's value matches `pattern`.
    ///
    /// Patterns:
    /// - `"*"` matches everything
    /// - `"regex:<expr>"` searches the stringified value
    /// - a list matches by membership
    /// - a map applies the first of `gt`, `lt`, `gte`, `lte`, `in`, `not_in`
    /// - anything else is compared for equality
    pub fn matches(&self, pattern: &AttributeValue) -> bool {
        match pattern {
            AttributeValue::String(p) if p == "*" => true,
            AttributeValue::String(p) if p.starts_with(REGEX_PATTERN_PREFIX) => {
                let expr = &p[REGEX_PATTERN_PREFIX.len()..];
                match cached_regex(expr) {
                    Ok(re) => re.is_match(&self.value.to_string()),
                    Err(e) => {
                        tracing::warn!(pattern = expr, error = %e, "invalid regex in attribute pattern");
                        false
                    }
                }
            }
            AttributeValue::List(_) => pattern.contains_member(&self.value).unwrap_or(false),
            AttributeValue::Map(ops) => match self.match_comparison_map(ops) {
                Some(result) => result,
                None => self.value.loose_eq(pattern),
            },
            _ => self.value.loose_eq(pattern),
        }
    }

    fn match_comparison_map(&self, ops: &BTreeMap<String, AttributeValue>) -> Option<bool> {
        if let Some(bound) = ops.get("gt") {
            return Some(self.value.compare(bound) == Some(Ordering::Greater));
        }
        if let Some(bound) = ops.get("lt") {
            return Some(self.value.compare(bound) == Some(Ordering::Less));
        }
        if let Some(bound) = ops.get("gte") {
            return Some(matches!(
                self.value.compare(bound),
                Some(Ordering::Greater | Ordering::Equal)
            ));
        }
        if let Some(bound) = ops.get("lte") {
            return Some(matches!(
                self.value.compare(bound),
                Some(Ordering::Less | Ordering::Equal)
            ));
        }
        if let Some(set) = ops.get("in") {
            return Some(set.contains_member(&self.value).unwrap_or(false));
        }
        if let Some(set) = ops.get("not_in") {
            return Some(set.contains_member(&self.value).map(|m| !m).unwrap_or(false));
        }
        None
    }
}

// ---------------------------------------------------------------------------
// AttributeContext: the per-evaluation fact set
// ---------------------------------------------------------------------------

/// Attributes keyed by `"{type}.{name}"`. Built fresh for each evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeContext {
    attributes: BTreeMap<String, Attribute>,
}

impl AttributeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an attribute, replacing any previous value under the same key.
    pub fn insert(&mut self, attribute: Attribute) {
        self.attributes.insert(attribute.key(), attribute);
    }

    pub fn get(&self, key: &str) -> Option<&Attribute> {
        self.attributes.get(key)
    }

    pub fn lookup(&self, attribute_type: AttributeType, name: &str) -> Option<&Attribute> {
        self.attributes.get(&attribute_type.key(name))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Iterate in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Attribute)> {
        self.attributes.iter()
    }
}
