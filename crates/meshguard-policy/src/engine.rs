use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use meshguard_core::{Clock, SystemClock, Timestamp};
use sha2::{Digest, Sha256};

use crate::attribute::{Attribute, AttributeContext, AttributeMap, AttributeType, AttributeValue};
use crate::defaults::default_policies;
use crate::error::{PolicyError, PolicyResult};
use crate::rule::{validate_policy, Effect, Priority, Rule};
use crate::types::{AccessRequest, Decision, Policy, PolicyStats};

/// Reason attached to the implicit deny.
pub const NO_MATCH_REASON: &str = "No matching policy rules";

/// Length of the hex cache key (128 bits of the SHA-256 digest).
const CACHE_KEY_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyEngineSettings {
    /// How long a cached decision stays valid.
    pub cache_ttl: Duration,
    /// Upper bound on cached decisions.
    pub cache_max_entries: usize,
    /// Install the bootstrap policies on construction.
    pub load_defaults: bool,
}

impl Default for PolicyEngineSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            cache_max_entries: 10_000,
            load_defaults: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PolicyStore {
    /// Live policies keyed by id. Ordered so evaluation ties resolve by id.
    policies: BTreeMap<String, Policy>,
    /// Archived prior versions per id, oldest first.
    history: HashMap<String, Vec<Policy>>,
}

impl PolicyStore {
    /// Replace or insert, archiving whatever was live under the same id.
    fn install(&mut self, mut policy: Policy, now: Timestamp, keep_version: bool) {
        if let Some(previous) = self.policies.remove(&policy.id) {
            if !keep_version && policy.version <= previous.version {
                policy.version = previous.version + 1;
            }
            policy.created_at = previous.created_at;
            self.history
                .entry(policy.id.clone())
                .or_default()
                .push(previous);
        }
        policy.updated_at = now;
        self.policies.insert(policy.id.clone(), policy);
    }
}

struct CachedDecision {
    decision: Decision,
    cached_at: Timestamp,
}

struct Fired<'a> {
    priority: Priority,
    policy: &'a Policy,
    rule_index: usize,
    effect: Effect,
}

// ---------------------------------------------------------------------------
// PolicyEngine
// ---------------------------------------------------------------------------

/// Attribute-based policy evaluation engine.
///
/// Policies live behind a single `RwLock`: mutations take the write lock and
/// clear the decision cache before releasing it, evaluations share the read
/// lock. Decisions are cached while the read lock is still held, so a cached
/// entry always reflects the policy set it was computed from.
pub struct PolicyEngine {
    store: RwLock<PolicyStore>,
    cache: Mutex<HashMap<String, CachedDecision>>,
    settings: PolicyEngineSettings,
    clock: Arc<dyn Clock>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine {
    /// Engine with the bootstrap policies and the system clock.
    pub fn new() -> Self {
        Self::with_config(PolicyEngineSettings::default(), Arc::new(SystemClock))
    }

    /// Engine with no policies at all. Everything resolves to implicit deny.
    pub fn empty() -> Self {
        Self::with_config(
            PolicyEngineSettings {
                load_defaults: false,
                ..PolicyEngineSettings::default()
            },
            Arc::new(SystemClock),
        )
    }

    pub fn with_config(settings: PolicyEngineSettings, clock: Arc<dyn Clock>) -> Self {
        let mut store = PolicyStore::default();
        if settings.load_defaults {
            let now = clock.now();
            for policy in default_policies() {
                store.install(policy, now, true);
            }
        }
        tracing::debug!(
            policies = store.policies.len(),
            cache_ttl_secs = settings.cache_ttl.as_secs(),
            "policy engine initialized"
        );
        Self {
            store: RwLock::new(store),
            cache: Mutex::new(HashMap::new()),
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &PolicyEngineSettings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Add a policy or replace the live policy with the same id.
    ///
    /// The replaced object is archived for rollback. A replacement whose
    /// version does not exceed the live one is stamped `live + 1`.
    pub fn add_policy(&self, policy: Policy) -> PolicyResult<()> {
        validate_policy(&policy)
            .map_err(|errors| PolicyError::ValidationError(errors.join("; ")))?;

        let now = self.clock.now();
        let mut store = self.write_store();
        let id = policy.id.clone();
        store.install(policy, now, false);
        self.clear_cache();

        let version = store.policies.get(&id).map(|p| p.version).unwrap_or_default();
        tracing::info!(policy_id = %id, version, "added/updated policy");
        Ok(())
    }

    /// Remove a live policy. History is kept so the id can be rolled back.
    pub fn remove_policy(&self, policy_id: &str) -> bool {
        let mut store = self.write_store();
        let removed = store.policies.remove(policy_id).is_some();
        if removed {
            self.clear_cache();
            tracing::info!(policy_id, "removed policy");
        }
        removed
    }

    /// Restore an archived version.
    ///
    /// With `Some(version)` the archived policy carrying exactly that version
    /// is restored and stays in history. With `None` the most recent archive
    /// entry is popped and restored. Returns false if there is nothing to
    /// restore.
    pub fn rollback_policy(&self, policy_id: &str, version: Option<u32>) -> bool {
        let mut store = self.write_store();
        let Some(versions) = store.history.get_mut(policy_id) else {
            return false;
        };

        let target = match version {
            Some(v) => versions.iter().find(|p| p.version == v).cloned(),
            None => versions.pop(),
        };
        let Some(target) = target else {
            return false;
        };

        let restored_version = target.version;
        store.policies.insert(policy_id.to_string(), target);
        self.clear_cache();
        tracing::info!(policy_id, version = restored_version, "rolled back policy");
        true
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Resolve a request to exactly one decision.
    ///
    /// Every enabled rule of every enabled policy whose target matches
    /// `(resource, action)` is considered. The firing rule with the lowest
    /// priority number wins; ties go to the lower policy id, then to the
    /// earlier rule. Nothing firing yields an implicit DENY.
    pub fn evaluate(
        &self,
        subject: &AttributeMap,
        resource: &str,
        action: &str,
        environment: Option<&AttributeMap>,
    ) -> Decision {
        self.evaluate_with(subject, resource, &AttributeMap::new(), action, environment)
    }

    /// Evaluate a bundled request, including its extra resource attributes.
    pub fn evaluate_request(&self, request: &AccessRequest) -> Decision {
        self.evaluate_with(
            &request.subject,
            &request.resource,
            &request.resource_attributes,
            &request.action,
            request.environment.as_ref(),
        )
    }

    fn evaluate_with(
        &self,
        subject: &AttributeMap,
        resource: &str,
        resource_attributes: &AttributeMap,
        action: &str,
        environment: Option<&AttributeMap>,
    ) -> Decision {
        let start = Instant::now();
        let now = self.clock.now();
        let context =
            build_context(subject, resource, resource_attributes, action, environment, now);
        let key = cache_key(&context);

        let store = self.read_store();

        if let Some(hit) = self.cached(&key, now) {
            tracing::debug!(resource, action, effect = %hit.effect, "policy decision served from cache");
            return hit;
        }

        let mut fired: Vec<Fired<'_>> = Vec::new();
        for policy in store
            .policies
            .values()
            .filter(|p| p.enabled && p.matches_target(resource, action))
        {
            let mut rules: Vec<(usize, &Rule)> = policy
                .rules
                .iter()
                .enumerate()
                .filter(|(_, r)| r.enabled)
                .collect();
            rules.sort_by_key(|(_, r)| r.priority);

            for (rule_index, rule) in rules {
                if let Some(effect) = rule.evaluate(&context) {
                    fired.push(Fired {
                        priority: rule.priority,
                        policy,
                        rule_index,
                        effect,
                    });
                }
            }
        }

        // Stable sort keeps the policy-id then rule-order tie-break.
        fired.sort_by_key(|f| f.priority);

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let decision = match fired.first() {
            Some(winner) => {
                let rule = &winner.policy.rules[winner.rule_index];
                Decision {
                    effect: winner.effect,
                    policy_id: winner.policy.id.clone(),
                    rule_id: rule.id.clone(),
                    reason: rule.description.clone(),
                    attributes_evaluated: context.len(),
                    evaluation_time_ms: elapsed_ms,
                }
            }
            None => Decision {
                effect: Effect::Deny,
                policy_id: Decision::IMPLICIT_POLICY_ID.to_string(),
                rule_id: Decision::NO_MATCH_RULE_ID.to_string(),
                reason: NO_MATCH_REASON.to_string(),
                attributes_evaluated: context.len(),
                evaluation_time_ms: elapsed_ms,
            },
        };

        tracing::debug!(
            resource,
            action,
            effect = %decision.effect,
            policy_id = %decision.policy_id,
            rule_id = %decision.rule_id,
            candidates = fired.len(),
            "policy decision"
        );

        self.store_cached(key, decision.clone(), now);
        decision
    }

    // -----------------------------------------------------------------------
    // Bundles
    // -----------------------------------------------------------------------

    /// Serialize every live policy as a JSON array, ordered by id.
    /// Version history is not exported.
    pub fn export_policies(&self) -> PolicyResult<String> {
        let store = self.read_store();
        let policies: Vec<&Policy> = store.policies.values().collect();
        serde_json::to_string_pretty(&policies)
            .map_err(|e| PolicyError::SerializationError(e.to_string()))
    }

    /// Import a JSON policy bundle.
    ///
    /// The whole bundle is parsed and validated before anything is installed;
    /// a bad bundle changes nothing. Versions are taken from the bundle as-is.
    /// Existing policies with the same id are archived, not discarded.
    pub fn import_policies(&self, data: &str) -> PolicyResult<usize> {
        let policies: Vec<Policy> = serde_json::from_str(data)
            .map_err(|e| PolicyError::DeserializationError(e.to_string()))?;

        let mut errors = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for policy in &policies {
            if !seen.insert(policy.id.as_str()) {
                errors.push(format!("duplicate policy id '{}' in bundle", policy.id));
            }
            if let Err(mut problems) = validate_policy(policy) {
                errors.append(&mut problems);
            }
        }
        if !errors.is_empty() {
            return Err(PolicyError::ValidationError(errors.join("; ")));
        }

        let now = self.clock.now();
        let count = policies.len();
        let mut store = self.write_store();
        for mut policy in policies {
            policy.created_at = now;
            policy.created_by = "import".to_string();
            store.install(policy, now, true);
        }
        self.clear_cache();
        tracing::info!(count, "imported policy bundle");
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_policy(&self, policy_id: &str) -> Option<Policy> {
        self.read_store().policies.get(policy_id).cloned()
    }

    /// Snapshot of every live policy, ordered by id.
    pub fn list_policies(&self) -> Vec<Policy> {
        self.read_store().policies.values().cloned().collect()
    }

    /// Versions archived for `policy_id`, oldest first.
    pub fn version_history(&self, policy_id: &str) -> Vec<u32> {
        self.read_store()
            .history
            .get(policy_id)
            .map(|versions| versions.iter().map(|p| p.version).collect())
            .unwrap_or_default()
    }

    pub fn get_stats(&self) -> PolicyStats {
        let store = self.read_store();
        PolicyStats {
            total_policies: store.policies.len(),
            enabled_policies: store.policies.values().filter(|p| p.enabled).count(),
            total_rules: store.policies.values().map(|p| p.rules.len()).sum(),
            cache_size: self.lock_cache().len(),
            policy_ids: store.policies.keys().cloned().collect(),
        }
    }

    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn read_store(&self) -> std::sync::RwLockReadGuard<'_, PolicyStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_store(&self) -> std::sync::RwLockWriteGuard<'_, PolicyStore> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedDecision>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached(&self, key: &str, now: Timestamp) -> Option<Decision> {
        let cache = self.lock_cache();
        let entry = cache.get(key)?;
        if now.seconds_since(&entry.cached_at) < self.settings.cache_ttl.as_secs_f64() {
            Some(entry.decision.clone())
        } else {
            None
        }
    }

    fn store_cached(&self, key: String, decision: Decision, now: Timestamp) {
        let ttl = self.settings.cache_ttl.as_secs_f64();
        let mut cache = self.lock_cache();
        if cache.len() >= self.settings.cache_max_entries && !cache.contains_key(&key) {
            cache.retain(|_, entry| now.seconds_since(&entry.cached_at) < ttl);
            if cache.len() >= self.settings.cache_max_entries {
                cache.clear();
            }
        }
        cache.insert(
            key,
            CachedDecision {
                decision,
                cached_at: now,
            },
        );
    }
}

/// Assemble the per-evaluation attribute context.
fn build_context(
    subject: &AttributeMap,
    resource: &str,
    resource_attributes: &AttributeMap,
    action: &str,
    environment: Option<&AttributeMap>,
    now: Timestamp,
) -> AttributeContext {
    let mut context = AttributeContext::new();

    for (name, value) in subject {
        context.insert(Attribute::new(AttributeType::Subject, name.as_str(), value.clone()));
    }

    for (name, value) in resource_attributes {
        context.insert(Attribute::new(AttributeType::Resource, name.as_str(), value.clone()));
    }
    context.insert(Attribute::new(AttributeType::Resource, "name", resource));
    context.insert(Attribute::new(AttributeType::Resource, "endpoint", resource));

    context.insert(Attribute::new(AttributeType::Action, "type", action));

    if let Some(environment) = environment {
        for (name, value) in environment {
            context.insert(Attribute::new(
                AttributeType::Environment,
                name.as_str(),
                value.clone(),
            ));
        }
    }
    // Always present, so every cache key carries the evaluation instant.
    context.insert(Attribute::new(
        AttributeType::Environment,
        "timestamp",
        AttributeValue::Float(now.as_secs_f64()),
    ));

    context
}

/// SHA-256 over the sorted `key:value` pairs joined with `|`, hex, truncated.
fn cache_key(context: &AttributeContext) -> String {
    let joined = context
        .iter()
        .map(|(key, attr)| format!("{}:{}", key, attr.value))
        .collect::<Vec<_>>()
        .join("|");
    let digest = Sha256::digest(joined.as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(CACHE_KEY_LEN);
    key
}
