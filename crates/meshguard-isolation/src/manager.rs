use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use meshguard_core::{Clock, SystemClock};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{BreakerHealth, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::IsolationResult;
use crate::policy::{default_policies, IsolationLevel, IsolationPolicy, IsolationReason};
use crate::record::{IsolationDuration, IsolationRecord};

/// Level applied when no policy covers the reason.
const FALLBACK_LEVEL: IsolationLevel = IsolationLevel::Restricted;
/// Duration applied when no policy covers the reason.
const FALLBACK_DURATION_SECS: u64 = 300;

/// Operations a `Restricted` node may still perform.
pub const ESSENTIAL_OPERATIONS: [&str; 3] = ["health", "heartbeat", "auth"];
/// The only operation a `Quarantine` node may perform.
pub const QUARANTINE_OPERATION: &str = "health";

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Receives every isolation level change. Release reports `IsolationLevel::None`.
///
/// Called after the manager's lock is released, so observers may query the
/// manager. Events arrive one at a time in the order the state changed, possibly
/// on a different thread than the one that caused them; events from a call made
/// inside an observer are delivered after the current one. A panicking observer
/// is logged and skipped.
pub trait IsolationObserver: Send + Sync {
    fn on_isolation_change(&self, node_id: &str, level: IsolationLevel);
}

impl<F> IsolationObserver for F
where
    F: Fn(&str, IsolationLevel) + Send + Sync,
{
    fn on_isolation_change(&self, node_id: &str, level: IsolationLevel) {
        self(node_id, level)
    }
}

// ---------------------------------------------------------------------------
// Public value types
// ---------------------------------------------------------------------------

/// Optional inputs to [`AutoIsolationManager::isolate_with`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IsolateOptions {
    pub details: String,
    pub level_override: Option<IsolationLevel>,
    pub duration_override: Option<IsolationDuration>,
    pub recovery_conditions: Vec<String>,
}

impl IsolateOptions {
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn level(mut self, level: IsolationLevel) -> Self {
        self.level_override = Some(level);
        self
    }

    pub fn duration(mut self, duration: IsolationDuration) -> Self {
        self.duration_override = Some(duration);
        self
    }

    pub fn recovery_condition(mut self, condition: impl Into<String>) -> Self {
        self.recovery_conditions.push(condition.into());
        self
    }
}

/// Outcome of [`AutoIsolationManager::is_allowed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessVerdict {
    pub allowed: bool,
    pub level: IsolationLevel,
    pub reason: String,
}

impl AccessVerdict {
    fn allow(level: IsolationLevel, reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            level,
            reason: reason.into(),
        }
    }

    fn deny(level: IsolationLevel, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            level,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationStats {
    pub total_isolated: usize,
    pub by_level: BTreeMap<IsolationLevel, usize>,
    pub by_reason: BTreeMap<IsolationReason, usize>,
    /// Breakers not in the Closed state.
    pub open_circuit_breakers: usize,
    pub total_circuit_breakers: usize,
}

/// Construction-time configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct IsolationSettings {
    pub breaker: CircuitBreakerConfig,
    /// One per reason; later entries replace earlier ones for the same reason.
    pub policies: Vec<IsolationPolicy>,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            policies: default_policies(),
        }
    }
}

// ---------------------------------------------------------------------------
// AutoIsolationManager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ManagerState {
    isolated: HashMap<String, IsolationRecord>,
    violations: HashMap<String, HashMap<IsolationReason, u64>>,
    breakers: HashMap<String, CircuitBreaker>,
    policies: HashMap<IsolationReason, IsolationPolicy>,
}

type Notification = (String, IsolationLevel);

/// Observer delivery queue. One thread drains at a time, in enqueue order.
#[derive(Default)]
struct Dispatch {
    pending: VecDeque<Notification>,
    draining: bool,
}

/// Containment authority for one local node observing many peers.
///
/// Records, violation counters, and circuit breakers sit behind one mutex,
/// so every state change is linearizable. Callers only ever get copies.
pub struct AutoIsolationManager {
    node_id: String,
    state: Mutex<ManagerState>,
    observers: RwLock<Vec<Arc<dyn IsolationObserver>>>,
    dispatch: Mutex<Dispatch>,
    breaker_config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl AutoIsolationManager {
    /// Manager with the shipped policies, default breakers, and the system clock.
    pub fn new(node_id: impl Into<String>) -> Self {
        let settings = IsolationSettings::default();
        let mut state = ManagerState::default();
        for policy in settings.policies {
            state.policies.insert(policy.trigger_reason, policy);
        }
        Self::from_parts(node_id.into(), state, settings.breaker, Arc::new(SystemClock))
    }

    /// Validate `settings` and build a manager on `clock`.
    pub fn with_config(
        node_id: impl Into<String>,
        settings: IsolationSettings,
        clock: Arc<dyn Clock>,
    ) -> IsolationResult<Self> {
        settings.breaker.validate()?;
        let mut state = ManagerState::default();
        for policy in settings.policies {
            policy.validate()?;
            state.policies.insert(policy.trigger_reason, policy);
        }
        Ok(Self::from_parts(node_id.into(), state, settings.breaker, clock))
    }

    fn from_parts(
        node_id: String,
        state: ManagerState,
        breaker_config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        tracing::info!(
            node_id = %node_id,
            policies = state.policies.len(),
            "auto-isolation manager initialized"
        );
        Self {
            node_id,
            state: Mutex::new(state),
            observers: RwLock::new(Vec::new()),
            dispatch: Mutex::new(Dispatch::default()),
            breaker_config,
            clock,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    // -----------------------------------------------------------------------
    // Policies and observers
    // -----------------------------------------------------------------------

    /// Install or replace the policy for `policy.trigger_reason`.
    /// Existing records keep the level and expiry they were given.
    pub fn register_policy(&self, policy: IsolationPolicy) -> IsolationResult<()> {
        policy.validate()?;
        tracing::info!(
            policy = %policy.name,
            reason = %policy.trigger_reason,
            "registered isolation policy"
        );
        self.lock_state()
            .policies
            .insert(policy.trigger_reason, policy);
        Ok(())
    }

    pub fn policy_for(&self, reason: IsolationReason) -> Option<IsolationPolicy> {
        self.lock_state().policies.get(&reason).cloned()
    }

    /// Registered policies, ordered by reason.
    pub fn policies(&self) -> Vec<IsolationPolicy> {
        let state = self.lock_state();
        let mut policies: Vec<IsolationPolicy> = state.policies.values().cloned().collect();
        policies.sort_by_key(|p| p.trigger_reason);
        policies
    }

    pub fn register_observer(&self, observer: Arc<dyn IsolationObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    // -----------------------------------------------------------------------
    // Isolation lifecycle
    // -----------------------------------------------------------------------

    pub fn isolate(&self, node_id: &str, reason: IsolationReason) -> IsolationRecord {
        self.isolate_with(node_id, reason, IsolateOptions::default())
    }

    /// Isolate `node_id`, escalating if it is already isolated for `reason`.
    ///
    /// A different reason, or an expired record, starts a fresh record at
    /// escalation 0. Overrides replace the level or duration the policy
    /// curve would have produced.
    pub fn isolate_with(
        &self,
        node_id: &str,
        reason: IsolationReason,
        options: IsolateOptions,
    ) -> IsolationRecord {
        let now = self.clock.now();
        let (record, claimed) = {
            let mut state = self.lock_state();

            *state
                .violations
                .entry(node_id.to_string())
                .or_default()
                .entry(reason)
                .or_default() += 1;

            let existing = state
                .isolated
                .get(node_id)
                .filter(|r| r.reason == reason && !r.is_expired(now))
                .cloned();

            let policy = state.policies.get(&reason);
            let escalation_count = existing
                .as_ref()
                .map_or(0, |r| r.escalation_count.saturating_add(1));

            let level = options.level_override.unwrap_or_else(|| {
                policy.map_or(FALLBACK_LEVEL, |p| p.get_level(escalation_count))
            });
            let duration = options.duration_override.unwrap_or_else(|| {
                IsolationDuration::Seconds(policy.map_or(FALLBACK_DURATION_SECS, |p| {
                    p.get_duration(escalation_count)
                }))
            });
            let expires_at = match duration {
                IsolationDuration::Seconds(secs) => Some(now.plus_seconds(secs)),
                IsolationDuration::Permanent => None,
            };
            let auto_recover = policy.map_or(true, |p| p.auto_recover);

            let record = match existing {
                Some(mut current) => {
                    current.level = level;
                    current.escalation_count = escalation_count;
                    current.expires_at = expires_at;
                    current.auto_recover = auto_recover;
                    if !options.details.is_empty() {
                        current.details = options.details;
                    }
                    current
                        .recovery_conditions
                        .extend(options.recovery_conditions);
                    tracing::warn!(
                        node_id,
                        level = %level,
                        reason = %reason,
                        escalation = escalation_count,
                        "escalated isolation"
                    );
                    current
                }
                None => {
                    tracing::warn!(
                        node_id,
                        level = %level,
                        reason = %reason,
                        duration = ?duration,
                        "isolated node"
                    );
                    IsolationRecord {
                        node_id: node_id.to_string(),
                        level,
                        reason,
                        started_at: now,
                        expires_at,
                        escalation_count: 0,
                        details: options.details,
                        auto_recover,
                        recovery_conditions: options.recovery_conditions,
                    }
                }
            };

            state.isolated.insert(node_id.to_string(), record.clone());
            let claimed = self.enqueue(vec![(node_id.to_string(), record.level)]);
            (record, claimed)
        };

        self.flush(claimed);
        record
    }

    /// Lift isolation from `node_id`.
    ///
    /// Records without auto-recovery need `force`. Releasing also closes the
    /// node's circuit breaker. Returns whether a record was removed.
    pub fn release(&self, node_id: &str, force: bool) -> bool {
        let mut events = Vec::new();
        let (released, claimed) = {
            let mut state = self.lock_state();
            let released = release_locked(&mut state, node_id, force, &mut events);
            (released, self.enqueue(events))
        };
        self.flush(claimed);
        released
    }

    /// Current level, applying auto-recovery to an expired record first.
    ///
    /// An expired record that does not auto-recover keeps reporting its level
    /// until it is force-released.
    pub fn get_isolation_level(&self, node_id: &str) -> IsolationLevel {
        let mut events = Vec::new();
        let (level, claimed) = {
            let mut state = self.lock_state();
            let level = self.level_locked(&mut state, node_id, &mut events);
            (level, self.enqueue(events))
        };
        self.flush(claimed);
        level
    }

    /// Whether `node_id` may perform `operation` right now.
    ///
    /// Expired auto-recovering records are released first, then the circuit
    /// breaker is consulted; an open breaker denies regardless of isolation
    /// level. Nodes never reported on have no breaker.
    pub fn is_allowed(&self, node_id: &str, operation: &str) -> AccessVerdict {
        let mut events = Vec::new();
        let (verdict, claimed) = {
            let mut state = self.lock_state();

            // Lazy recovery runs first; releasing a lapsed record also resets its breaker.
            let level = self.level_locked(&mut state, node_id, &mut events);
            let breaker_allows = state
                .breakers
                .get_mut(node_id)
                .map_or(true, |cb| cb.allow_request());

            let verdict = if breaker_allows {
                verdict_for_level(level, operation)
            } else {
                AccessVerdict::deny(level, "Circuit breaker open")
            };
            (verdict, self.enqueue(events))
        };
        self.flush(claimed);

        if !verdict.allowed {
            tracing::debug!(
                node_id,
                operation,
                level = %verdict.level,
                reason = %verdict.reason,
                "operation refused"
            );
        }
        verdict
    }

    // -----------------------------------------------------------------------
    // Circuit breakers
    // -----------------------------------------------------------------------

    pub fn record_success(&self, node_id: &str) {
        let mut state = self.lock_state();
        self.breaker_locked(&mut state, node_id).record_success();
    }

    pub fn record_failure(&self, node_id: &str) {
        let mut state = self.lock_state();
        self.breaker_locked(&mut state, node_id).record_failure();
    }

    pub fn circuit_state(&self, node_id: &str) -> Option<CircuitState> {
        self.lock_state().breakers.get(node_id).map(|cb| cb.state())
    }

    pub fn breaker_health(&self, node_id: &str) -> Option<BreakerHealth> {
        self.lock_state().breakers.get(node_id).map(|cb| cb.health())
    }

    // -----------------------------------------------------------------------
    // Sweeps and snapshots
    // -----------------------------------------------------------------------

    /// Release every expired auto-recovering record. Returns how many were released.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut events = Vec::new();
        let (released, claimed) = {
            let mut state = self.lock_state();
            let expired: Vec<String> = state
                .isolated
                .values()
                .filter(|r| r.is_expired(now) && r.auto_recover)
                .map(|r| r.node_id.clone())
                .collect();
            let released = expired
                .iter()
                .filter(|node_id| release_locked(&mut state, node_id, false, &mut events))
                .count();
            (released, self.enqueue(events))
        };
        self.flush(claimed);
        if released > 0 {
            tracing::info!(released, "cleaned up expired isolations");
        }
        released
    }

    pub fn get_record(&self, node_id: &str) -> Option<IsolationRecord> {
        self.lock_state().isolated.get(node_id).cloned()
    }

    /// Every unexpired record, ordered by node id.
    pub fn get_isolated_nodes(&self) -> Vec<IsolationRecord> {
        let now = self.clock.now();
        let state = self.lock_state();
        let mut records: Vec<IsolationRecord> = state
            .isolated
            .values()
            .filter(|r| !r.is_expired(now))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records
    }

    /// Lifetime count of `reason` violations reported for `node_id`.
    pub fn violation_count(&self, node_id: &str, reason: IsolationReason) -> u64 {
        self.lock_state()
            .violations
            .get(node_id)
            .and_then(|counts| counts.get(&reason))
            .copied()
            .unwrap_or(0)
    }

    pub fn get_stats(&self) -> IsolationStats {
        let now = self.clock.now();
        let state = self.lock_state();
        let mut stats = IsolationStats::default();

        for record in state.isolated.values().filter(|r| !r.is_expired(now)) {
            stats.total_isolated += 1;
            *stats.by_level.entry(record.level).or_default() += 1;
            *stats.by_reason.entry(record.reason).or_default() += 1;
        }
        stats.open_circuit_breakers = state
            .breakers
            .values()
            .filter(|cb| cb.state() != CircuitState::Closed)
            .count();
        stats.total_circuit_breakers = state.breakers.len();
        stats
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn level_locked(
        &self,
        state: &mut ManagerState,
        node_id: &str,
        events: &mut Vec<Notification>,
    ) -> IsolationLevel {
        let now = self.clock.now();
        let Some(record) = state.isolated.get(node_id) else {
            return IsolationLevel::None;
        };
        let level = record.level;
        if record.is_expired(now) && release_locked(state, node_id, false, events) {
            return IsolationLevel::None;
        }
        level
    }

    fn breaker_locked<'a>(
        &self,
        state: &'a mut ManagerState,
        node_id: &str,
    ) -> &'a mut CircuitBreaker {
        state
            .breakers
            .entry(node_id.to_string())
            .or_insert_with(|| {
                CircuitBreaker::with_clock(self.breaker_config.clone(), Arc::clone(&self.clock))
            })
    }

    fn lock_dispatch(&self) -> MutexGuard<'_, Dispatch> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `events` behind everything already pending. Must be called with
    /// the state lock held so queue order is state order. Returns true if the
    /// caller has claimed delivery and must `flush`.
    fn enqueue(&self, events: Vec<Notification>) -> bool {
        if events.is_empty() {
            return false;
        }
        let mut dispatch = self.lock_dispatch();
        dispatch.pending.extend(events);
        if dispatch.draining {
            return false;
        }
        dispatch.draining = true;
        true
    }

    /// Deliver pending events one at a time until the queue is empty.
    /// Runs without the state lock, so observers may call back into the manager.
    fn flush(&self, claimed: bool) {
        if !claimed {
            return;
        }
        loop {
            let next = {
                let mut dispatch = self.lock_dispatch();
                match dispatch.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        dispatch.draining = false;
                        return;
                    }
                }
            };
            self.deliver(&next.0, next.1);
        }
    }

    fn deliver(&self, node_id: &str, level: IsolationLevel) {
        let observers: Vec<Arc<dyn IsolationObserver>> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for observer in &observers {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| observer.on_isolation_change(node_id, level)));
            if outcome.is_err() {
                tracing::error!(node_id, level = %level, "isolation observer panicked");
            }
        }
    }
}

fn release_locked(
    state: &mut ManagerState,
    node_id: &str,
    force: bool,
    events: &mut Vec<Notification>,
) -> bool {
    let Some(record) = state.isolated.get(node_id) else {
        return false;
    };
    if !record.auto_recover && !force {
        tracing::warn!(node_id, "isolation is pinned; manual release required");
        return false;
    }

    state.isolated.remove(node_id);
    if let Some(cb) = state.breakers.get_mut(node_id) {
        cb.reset();
    }
    events.push((node_id.to_string(), IsolationLevel::None));
    tracing::info!(node_id, forced = force, "released node from isolation");
    true
}

fn verdict_for_level(level: IsolationLevel, operation: &str) -> AccessVerdict {
    match level {
        IsolationLevel::None => AccessVerdict::allow(level, "OK"),
        IsolationLevel::Monitor => AccessVerdict::allow(level, "Monitored"),
        IsolationLevel::RateLimit => AccessVerdict::allow(level, "Rate limited"),
        IsolationLevel::Restricted => {
            if ESSENTIAL_OPERATIONS.contains(&operation) {
                AccessVerdict::allow(level, "Restricted - essential only")
            } else {
                AccessVerdict::deny(level, format!("Restricted - {} not allowed", operation))
            }
        }
        IsolationLevel::Quarantine => {
            if operation == QUARANTINE_OPERATION {
                AccessVerdict::allow(level, "Quarantine - health only")
            } else {
                AccessVerdict::deny(level, "Quarantine - blocked")
            }
        }
        IsolationLevel::Blocked => AccessVerdict::deny(level, "Blocked"),
    }
}
