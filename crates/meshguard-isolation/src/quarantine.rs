//! Communication restrictions for quarantined peers.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Default bandwidth cap for quarantined peers, bytes per second.
pub const DEFAULT_MAX_BANDWIDTH: u64 = 1024;

/// Operations allowed inside a zone unless configured otherwise.
pub const DEFAULT_ALLOWED_OPERATIONS: [&str; 2] = ["health", "metrics"];

#[derive(Debug, Default)]
struct ZoneState {
    nodes: BTreeSet<String>,
    allowed_peers: BTreeSet<String>,
    allowed_operations: BTreeSet<String>,
}

/// A set of quarantined nodes plus the rules for talking to them.
///
/// Quarantined nodes may talk to each other. Traffic between a quarantined
/// node and an outsider needs the outsider on the zone's allowed-peer list.
#[derive(Debug)]
pub struct QuarantineZone {
    zone_id: String,
    max_bandwidth: u64,
    state: RwLock<ZoneState>,
}

impl QuarantineZone {
    pub fn new(zone_id: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            max_bandwidth: DEFAULT_MAX_BANDWIDTH,
            state: RwLock::new(ZoneState {
                allowed_operations: DEFAULT_ALLOWED_OPERATIONS
                    .iter()
                    .map(|op| op.to_string())
                    .collect(),
                ..ZoneState::default()
            }),
        }
    }

    pub fn with_max_bandwidth(mut self, bytes_per_sec: u64) -> Self {
        self.max_bandwidth = bytes_per_sec;
        self
    }

    /// Replace the allowed-operation set.
    pub fn with_allowed_operations<I, S>(self, operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.write_state().allowed_operations = operations.into_iter().map(Into::into).collect();
        self
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    pub fn max_bandwidth(&self) -> u64 {
        self.max_bandwidth
    }

    /// Returns true if the node was not already in the zone.
    pub fn add_node(&self, node_id: &str) -> bool {
        let added = self.write_state().nodes.insert(node_id.to_string());
        if added {
            tracing::info!(node_id, zone_id = %self.zone_id, "node added to quarantine zone");
        }
        added
    }

    /// Returns true if the node was in the zone.
    pub fn remove_node(&self, node_id: &str) -> bool {
        let removed = self.write_state().nodes.remove(node_id);
        if removed {
            tracing::info!(node_id, zone_id = %self.zone_id, "node removed from quarantine zone");
        }
        removed
    }

    pub fn is_quarantined(&self, node_id: &str) -> bool {
        self.read_state().nodes.contains(node_id)
    }

    /// Whether `source` and `target` may exchange traffic.
    pub fn can_communicate(&self, source: &str, target: &str) -> bool {
        let state = self.read_state();
        let source_in = state.nodes.contains(source);
        let target_in = state.nodes.contains(target);

        match (source_in, target_in) {
            (false, false) | (true, true) => true,
            (true, false) => state.allowed_peers.contains(target),
            (false, true) => state.allowed_peers.contains(source),
        }
    }

    pub fn is_operation_allowed(&self, operation: &str) -> bool {
        self.read_state().allowed_operations.contains(operation)
    }

    pub fn add_allowed_peer(&self, peer_id: &str) -> bool {
        self.write_state().allowed_peers.insert(peer_id.to_string())
    }

    pub fn remove_allowed_peer(&self, peer_id: &str) -> bool {
        self.write_state().allowed_peers.remove(peer_id)
    }

    pub fn allow_operation(&self, operation: &str) -> bool {
        self.write_state()
            .allowed_operations
            .insert(operation.to_string())
    }

    /// Quarantined node ids, sorted.
    pub fn nodes(&self) -> Vec<String> {
        self.read_state().nodes.iter().cloned().collect()
    }

    pub fn allowed_peers(&self) -> Vec<String> {
        self.read_state().allowed_peers.iter().cloned().collect()
    }

    pub fn allowed_operations(&self) -> Vec<String> {
        self.read_state()
            .allowed_operations
            .iter()
            .cloned()
            .collect()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ZoneState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ZoneState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_defaults() {
        let zone = QuarantineZone::new("quarantine");
        assert_eq!(zone.zone_id(), "quarantine");
        assert_eq!(zone.max_bandwidth(), 1024);
        assert!(zone.is_operation_allowed("health"));
        assert!(zone.is_operation_allowed("metrics"));
        assert!(!zone.is_operation_allowed("write"));
        assert!(zone.nodes().is_empty());
    }

    #[test]
    fn test_add_remove_idempotent() {
        let zone = QuarantineZone::new("z");
        assert!(zone.add_node("a"));
        assert!(!zone.add_node("a"));
        assert_eq!(zone.nodes(), vec!["a"]);
        assert!(zone.remove_node("a"));
        assert!(!zone.remove_node("a"));
        assert!(!zone.is_quarantined("a"));
    }

    #[test]
    fn test_outsider_needs_allow_list() {
        let zone = QuarantineZone::new("z");
        zone.add_node("a");
        assert!(!zone.can_communicate("a", "b"));
        assert!(!zone.can_communicate("b", "a"));

        zone.add_allowed_peer("b");
        assert!(zone.can_communicate("a", "b"));
        assert!(zone.can_communicate("b", "a"));

        zone.remove_allowed_peer("b");
        assert!(!zone.can_communicate("a", "b"));
    }

    #[test]
    fn test_quarantined_node_on_allow_list_does_not_open_outside_traffic() {
        let zone = QuarantineZone::new("z");
        zone.add_node("a");
        zone.add_allowed_peer("a");
        assert!(!zone.can_communicate("a", "b"));
    }

    #[test]
    fn test_in_zone_and_outside_traffic() {
        let zone = QuarantineZone::new("z");
        zone.add_node("a");
        zone.add_node("c");
        assert!(zone.can_communicate("a", "c"));
        assert!(zone.can_communicate("x", "y"));
    }

    #[test]
    fn test_custom_operations_and_bandwidth() {
        let zone = QuarantineZone::new("z")
            .with_max_bandwidth(4096)
            .with_allowed_operations(["health"]);
        assert_eq!(zone.max_bandwidth(), 4096);
        assert!(!zone.is_operation_allowed("metrics"));
        assert!(zone.allow_operation("heartbeat"));
        assert_eq!(zone.allowed_operations(), vec!["health", "heartbeat"]);
    }

    proptest! {
        #[test]
        fn prop_add_node_idempotent(node in "[a-z0-9-]{1,16}", repeats in 1usize..5) {
            let zone = QuarantineZone::new("z");
            for _ in 0..repeats {
                zone.add_node(&node);
            }
            prop_assert_eq!(zone.nodes().len(), 1);
            prop_assert!(zone.is_quarantined(&node));
        }
    }
}
