use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Timestamp: canonical time representation (seconds + nanoseconds)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds_since_epoch: u64,
    pub nanoseconds: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        chrono::Utc::now().into()
    }

    pub fn from_seconds(seconds: u64) -> Self {
        Self {
            seconds_since_epoch: seconds,
            nanoseconds: 0,
        }
    }

    /// Parse an RFC 3339 string such as `2026-01-01T00:00:00Z`.
    pub fn from_rfc3339(value: &str) -> CoreResult<Self> {
        let dt = chrono::DateTime::parse_from_rfc3339(value)
            .map_err(|e| CoreError::InvalidTimestamp(format!("{}: {}", value, e)))?;
        if dt.timestamp() < 0 {
            return Err(CoreError::InvalidTimestamp(format!(
                "{} is before the unix epoch",
                value
            )));
        }
        Ok(dt.with_timezone(&chrono::Utc).into())
    }

    pub fn to_rfc3339(&self) -> String {
        let dt =
            chrono::DateTime::from_timestamp(self.seconds_since_epoch as i64, self.nanoseconds);
        dt.map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "invalid".to_string())
    }

    pub fn plus_seconds(&self, seconds: u64) -> Self {
        Self {
            seconds_since_epoch: self.seconds_since_epoch.saturating_add(seconds),
            nanoseconds: self.nanoseconds,
        }
    }

    pub fn plus(&self, duration: Duration) -> Self {
        let mut seconds = self.seconds_since_epoch.saturating_add(duration.as_secs());
        let mut nanos = self.nanoseconds + duration.subsec_nanos();
        if nanos >= 1_000_000_000 {
            nanos -= 1_000_000_000;
            seconds = seconds.saturating_add(1);
        }
        Self {
            seconds_since_epoch: seconds,
            nanoseconds: nanos,
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.seconds_since_epoch as f64 + f64::from(self.nanoseconds) / 1e9
    }

    /// Fractional seconds elapsed since `earlier`; zero if `earlier` is in the future.
    pub fn seconds_since(&self, earlier: &Timestamp) -> f64 {
        if self <= earlier {
            return 0.0;
        }
        self.as_secs_f64() - earlier.as_secs_f64()
    }
}

impl From<chrono::DateTime<chrono::Utc>> for Timestamp {
    fn from(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            seconds_since_epoch: dt.timestamp().max(0) as u64,
            nanoseconds: dt.timestamp_subsec_nanos(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}
