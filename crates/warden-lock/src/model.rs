//! Lock data model
//!
//! Value objects shared by the resolver, the quorum store and the coordinator.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::time::Instant;
use warden_common::{LockError, join_key};

/// Caller supplied time-to-live
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "serde_json::Value")]
pub enum DurationSpec {
    /// Fixed duration in milliseconds
    Millis(u64),
    /// Cron expression; the TTL is the time left until its next occurrence
    Schedule(String),
}

impl DurationSpec {
    pub fn schedule(expression: impl Into<String>) -> Self {
        DurationSpec::Schedule(expression.into())
    }
}

impl From<u64> for DurationSpec {
    fn from(ms: u64) -> Self {
        DurationSpec::Millis(ms)
    }
}

impl From<Duration> for DurationSpec {
    fn from(duration: Duration) -> Self {
        DurationSpec::Millis(duration.as_millis() as u64)
    }
}

impl FromStr for DurationSpec {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LockError::InvalidDurationType(
                "empty duration string".to_string(),
            ));
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s
                .parse::<u64>()
                .map(DurationSpec::Millis)
                .map_err(|e| LockError::InvalidDurationType(format!("{s}: {e}")));
        }
        Ok(DurationSpec::Schedule(s.to_string()))
    }
}

impl TryFrom<serde_json::Value> for DurationSpec {
    type Error = LockError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;

        match value {
            Value::Number(ref n) => {
                if let Some(ms) = n.as_u64() {
                    return Ok(DurationSpec::Millis(ms));
                }
                match n.as_f64() {
                    Some(f) if f.is_finite() && f >= 0.0 && f.fract() == 0.0 => {
                        Ok(DurationSpec::Millis(f as u64))
                    }
                    _ => Err(LockError::InvalidDurationType(format!(
                        "number {n} is not a non-negative whole number of milliseconds"
                    ))),
                }
            }
            Value::String(s) => s.parse(),
            other => Err(LockError::InvalidDurationType(format!(
                "expected milliseconds or a cron expression, got {other}"
            ))),
        }
    }
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurationSpec::Millis(ms) => write!(f, "{ms}ms"),
            DurationSpec::Schedule(expr) => write!(f, "cron({expr})"),
        }
    }
}

/// Everything needed to request one lock: the key segments, the optional TTL
/// override and the storage key they resolve to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSpec {
    segments: Vec<String>,
    duration: Option<DurationSpec>,
    resource: String,
}

impl LockSpec {
    pub fn new(prefix: Option<&str>, segments: Vec<String>, duration: Option<DurationSpec>) -> Self {
        let resource = join_key(prefix, &segments);
        Self {
            segments,
            duration,
            resource,
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn duration(&self) -> Option<&DurationSpec> {
        self.duration.as_ref()
    }

    /// The storage key (prefix and segments joined by `:`)
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

/// Handle to a lock held on a quorum of nodes.
///
/// Owned by the acquiring caller until it is released or expires; it is
/// deliberately not `Clone`.
#[derive(Debug)]
pub struct Lock {
    resource: String,
    token: String,
    ttl_ms: u64,
    acquired_at: DateTime<Utc>,
    validity: Instant,
    attempts: u32,
    granted_nodes: Vec<usize>,
}

impl Lock {
    pub(crate) fn new(
        resource: String,
        token: String,
        ttl_ms: u64,
        validity: Instant,
        attempts: u32,
        granted_nodes: Vec<usize>,
    ) -> Self {
        Self {
            resource,
            token,
            ttl_ms,
            acquired_at: Utc::now(),
            validity,
            attempts,
            granted_nodes,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Ownership token written to every granting node
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Number of attempts it took to reach quorum (1 = first try)
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Indexes of the nodes that granted this lock
    pub fn granted_nodes(&self) -> &[usize] {
        &self.granted_nodes
    }

    /// Whether the drift-compensated validity window is still open
    pub fn is_valid(&self) -> bool {
        Instant::now() < self.validity
    }

    pub fn remaining_validity(&self) -> Duration {
        self.validity.saturating_duration_since(Instant::now())
    }
}

/// Per-node tally of a release fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Nodes that deleted the token
    pub released: usize,
    /// Nodes that answered but did not hold the token
    pub not_held: usize,
    /// Nodes that could not be reached or returned an error
    pub failed: usize,
}

impl ReleaseOutcome {
    pub fn nodes(&self) -> usize {
        self.released + self.not_held + self.failed
    }

    /// Every node failed; the lock will only disappear through TTL expiry.
    pub fn is_total_failure(&self) -> bool {
        self.nodes() > 0 && self.failed == self.nodes()
    }
}

/// What the coordinator did with a lock after execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseDisposition {
    /// Release was issued to the nodes
    Released(ReleaseOutcome),
    /// Release policy was off; the lock stays until its TTL elapses
    Retained,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duration_spec_from_str() {
        assert_eq!("1500".parse::<DurationSpec>().unwrap(), DurationSpec::Millis(1500));
        assert_eq!(
            "*/5 * * * *".parse::<DurationSpec>().unwrap(),
            DurationSpec::schedule("*/5 * * * *")
        );
        assert!(matches!(
            "  ".parse::<DurationSpec>(),
            Err(LockError::InvalidDurationType(_))
        ));
    }

    #[test]
    fn test_duration_spec_from_value() {
        assert_eq!(
            DurationSpec::try_from(json!(30000)).unwrap(),
            DurationSpec::Millis(30000)
        );
        assert_eq!(
            DurationSpec::try_from(json!(2000.0)).unwrap(),
            DurationSpec::Millis(2000)
        );
        assert_eq!(
            DurationSpec::try_from(json!("0 0 * * * *")).unwrap(),
            DurationSpec::schedule("0 0 * * * *")
        );

        for bad in [json!(true), json!(-5), json!(1.5), json!([1]), json!(null), json!({})] {
            assert!(
                matches!(
                    DurationSpec::try_from(bad.clone()),
                    Err(LockError::InvalidDurationType(_))
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_duration_spec_deserialize() {
        let spec: DurationSpec = serde_json::from_value(json!("*/10 * * * * *")).unwrap();
        assert_eq!(spec, DurationSpec::schedule("*/10 * * * * *"));

        let err = serde_json::from_value::<DurationSpec>(json!(false)).unwrap_err();
        assert!(err.to_string().contains("invalid duration type"));
    }

    #[test]
    fn test_lock_spec_resource() {
        let spec = LockSpec::new(
            Some("app"),
            vec!["report".to_string(), "tenant-42".to_string()],
            Some(DurationSpec::Millis(1000)),
        );
        assert_eq!(spec.resource(), "app:report:tenant-42");
        assert_eq!(spec.segments().len(), 2);
        assert_eq!(spec.duration(), Some(&DurationSpec::Millis(1000)));

        let spec = LockSpec::new(None, vec!["report".to_string()], None);
        assert_eq!(spec.resource(), "report");
        assert!(spec.duration().is_none());
    }

    #[test]
    fn test_release_outcome() {
        let outcome = ReleaseOutcome {
            released: 0,
            not_held: 0,
            failed: 3,
        };
        assert!(outcome.is_total_failure());

        let outcome = ReleaseOutcome {
            released: 1,
            not_held: 1,
            failed: 1,
        };
        assert_eq!(outcome.nodes(), 3);
        assert!(!outcome.is_total_failure());

        assert!(!ReleaseOutcome::default().is_total_failure());
    }
}
