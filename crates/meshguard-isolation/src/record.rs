use meshguard_core::Timestamp;
use serde::{Deserialize, Serialize};

use crate::policy::{IsolationLevel, IsolationReason};

/// How long an isolation lasts when the caller overrides the policy curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationDuration {
    Seconds(u64),
    /// Never expires; only `release` clears it.
    Permanent,
}

/// Live isolation state for one node.
///
/// Only one reason is tracked per node at a time. A repeat of the same
/// reason while the record is active escalates it in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationRecord {
    pub node_id: String,
    pub level: IsolationLevel,
    pub reason: IsolationReason,
    pub started_at: Timestamp,
    /// `None` for permanent isolation.
    pub expires_at: Option<Timestamp>,
    pub escalation_count: u32,
    #[serde(default)]
    pub details: String,
    pub auto_recover: bool,
    #[serde(default)]
    pub recovery_conditions: Vec<String>,
}

impl IsolationRecord {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        match self.expires_at {
            Some(expires_at) => now > expires_at,
            None => false,
        }
    }

    /// Whole seconds until expiry, `None` if permanent.
    pub fn remaining_secs(&self, now: Timestamp) -> Option<u64> {
        self.expires_at
            .map(|expires_at| expires_at.seconds_since(&now).floor() as u64)
    }

    pub fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expires_at: Option<Timestamp>) -> IsolationRecord {
        IsolationRecord {
            node_id: "n1".into(),
            level: IsolationLevel::Restricted,
            reason: IsolationReason::ThreatDetected,
            started_at: Timestamp::from_seconds(1_000),
            expires_at,
            escalation_count: 0,
            details: String::new(),
            auto_recover: true,
            recovery_conditions: Vec::new(),
        }
    }

    #[test]
    fn test_expiry_is_strictly_after() {
        let r = record(Some(Timestamp::from_seconds(1_300)));
        assert!(!r.is_expired(Timestamp::from_seconds(1_299)));
        assert!(!r.is_expired(Timestamp::from_seconds(1_300)));
        assert!(r.is_expired(Timestamp::from_seconds(1_301)));
    }

    #[test]
    fn test_permanent_never_expires() {
        let r = record(None);
        assert!(r.is_permanent());
        assert!(!r.is_expired(Timestamp::from_seconds(u32::MAX as u64)));
        assert_eq!(r.remaining_secs(Timestamp::from_seconds(5)), None);
    }

    #[test]
    fn test_remaining_secs() {
        let r = record(Some(Timestamp::from_seconds(1_300)));
        assert_eq!(r.remaining_secs(Timestamp::from_seconds(1_100)), Some(200));
        assert_eq!(r.remaining_secs(Timestamp::from_seconds(2_000)), Some(0));
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(record(None)).unwrap();
        assert_eq!(json["level"], "RESTRICTED");
        assert_eq!(json["reason"], "threat_detected");
        assert!(json["expires_at"].is_null());
    }

    #[test]
    fn test_duration_wire_format() {
        assert_eq!(
            serde_json::to_string(&IsolationDuration::Seconds(30)).unwrap(),
            r#"{"seconds":30}"#
        );
        assert_eq!(
            serde_json::to_string(&IsolationDuration::Permanent).unwrap(),
            r#""permanent""#
        );
    }
}
