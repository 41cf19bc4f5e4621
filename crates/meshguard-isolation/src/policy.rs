use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{IsolationError, IsolationResult};

/// Isolation severity, ascending.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// Full access.
    #[default]
    None,
    /// Extra monitoring, no restrictions.
    Monitor,
    RateLimit,
    /// Essential operations only.
    Restricted,
    /// No mesh communication beyond health probes.
    Quarantine,
    /// Complete network block.
    Blocked,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::None => "NONE",
            IsolationLevel::Monitor => "MONITOR",
            IsolationLevel::RateLimit => "RATE_LIMIT",
            IsolationLevel::Restricted => "RESTRICTED",
            IsolationLevel::Quarantine => "QUARANTINE",
            IsolationLevel::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationReason {
    ThreatDetected,
    TrustDegraded,
    AnomalyDetected,
    AuthFailure,
    ProtocolViolation,
    AdminAction,
    PeerConsensus,
    ResourceAbuse,
}

impl IsolationReason {
    pub const ALL: [IsolationReason; 8] = [
        IsolationReason::ThreatDetected,
        IsolationReason::TrustDegraded,
        IsolationReason::AnomalyDetected,
        IsolationReason::AuthFailure,
        IsolationReason::ProtocolViolation,
        IsolationReason::AdminAction,
        IsolationReason::PeerConsensus,
        IsolationReason::ResourceAbuse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationReason::ThreatDetected => "threat_detected",
            IsolationReason::TrustDegraded => "trust_degraded",
            IsolationReason::AnomalyDetected => "anomaly_detected",
            IsolationReason::AuthFailure => "auth_failure",
            IsolationReason::ProtocolViolation => "protocol_violation",
            IsolationReason::AdminAction => "admin_action",
            IsolationReason::PeerConsensus => "peer_consensus",
            IsolationReason::ResourceAbuse => "resource_abuse",
        }
    }
}

impl fmt::Display for IsolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IsolationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IsolationReason::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown isolation reason '{}'", s))
    }
}

/// Escalation curve for one violation reason.
///
/// Level and duration are functions of how many times the same reason has
/// repeated while the previous isolation was still active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationPolicy {
    pub name: String,
    pub trigger_reason: IsolationReason,
    pub initial_level: IsolationLevel,
    /// Level per escalation step; the last entry is the ceiling.
    pub escalation_levels: Vec<IsolationLevel>,
    pub initial_duration_secs: u64,
    pub escalation_multiplier: f64,
    pub max_duration_secs: u64,
    pub auto_recover: bool,
}

impl IsolationPolicy {
    /// `min(initial * multiplier^n, max)`, truncated to whole seconds.
    pub fn get_duration(&self, escalation_count: u32) -> u64 {
        let exponent = i32::try_from(escalation_count).unwrap_or(i32::MAX);
        let scaled = self.initial_duration_secs as f64 * self.escalation_multiplier.powi(exponent);
        // `as` saturates: an overflowing product lands on u64::MAX and is capped below.
        (scaled as u64).min(self.max_duration_secs)
    }

    /// Ladder rung for `escalation_count`, pinned to the last rung.
    pub fn get_level(&self, escalation_count: u32) -> IsolationLevel {
        let index = usize::try_from(escalation_count).unwrap_or(usize::MAX);
        self.escalation_levels
            .get(index)
            .or_else(|| self.escalation_levels.last())
            .copied()
            .unwrap_or(self.initial_level)
    }

    pub fn validate(&self) -> IsolationResult<()> {
        let invalid = |reason: &str| IsolationError::InvalidPolicy {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        let Some(first) = self.escalation_levels.first() else {
            return Err(invalid("escalation ladder is empty"));
        };
        if *first != self.initial_level {
            return Err(invalid("initial_level must be the first escalation level"));
        }
        if self.escalation_levels.windows(2).any(|w| w[1] < w[0]) {
            return Err(invalid("escalation levels must not decrease"));
        }
        if !self.escalation_multiplier.is_finite() || self.escalation_multiplier < 1.0 {
            return Err(invalid("escalation_multiplier must be a finite value >= 1.0"));
        }
        if self.initial_duration_secs == 0 {
            return Err(invalid("initial_duration_secs must be > 0"));
        }
        if self.max_duration_secs < self.initial_duration_secs {
            return Err(invalid("max_duration_secs must be >= initial_duration_secs"));
        }
        Ok(())
    }
}

fn ladder(
    name: &str,
    trigger_reason: IsolationReason,
    escalation_levels: Vec<IsolationLevel>,
    initial_duration_secs: u64,
    escalation_multiplier: f64,
    max_duration_secs: u64,
    auto_recover: bool,
) -> IsolationPolicy {
    IsolationPolicy {
        name: name.to_string(),
        trigger_reason,
        initial_level: escalation_levels.first().copied().unwrap_or_default(),
        escalation_levels,
        initial_duration_secs,
        escalation_multiplier,
        max_duration_secs,
        auto_recover,
    }
}

/// The shipped escalation curves, one per covered reason.
pub fn default_policies() -> Vec<IsolationPolicy> {
    use IsolationLevel::{Blocked, Monitor, Quarantine, RateLimit, Restricted};

    vec![
        ladder(
            "threat_response",
            IsolationReason::ThreatDetected,
            vec![Restricted, Quarantine, Blocked],
            300,
            4.0,
            86_400,
            true,
        ),
        ladder(
            "trust_degradation",
            IsolationReason::TrustDegraded,
            vec![RateLimit, Restricted, Quarantine],
            600,
            2.0,
            43_200,
            true,
        ),
        ladder(
            "auth_failure",
            IsolationReason::AuthFailure,
            vec![RateLimit, Restricted, Blocked],
            60,
            3.0,
            3_600,
            true,
        ),
        ladder(
            "anomaly_detection",
            IsolationReason::AnomalyDetected,
            vec![Monitor, RateLimit, Restricted],
            120,
            2.0,
            7_200,
            true,
        ),
        ladder(
            "protocol_violation",
            IsolationReason::ProtocolViolation,
            vec![Quarantine, Blocked],
            3_600,
            4.0,
            604_800,
            false,
        ),
    ]
}
