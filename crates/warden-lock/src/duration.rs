//! TTL resolution
//!
//! Turns a [`DurationSpec`] (or its absence) into a concrete millisecond TTL.
//! Cron expressions resolve to the time remaining until their next
//! occurrence, so a lock taken by a scheduled job lasts until the next tick.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::warn;
use warden_common::{DEFAULT_LOCK_DURATION_MS, LockError, Result};

use crate::model::DurationSpec;

/// Resolves lock TTLs against the configured default
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationResolver {
    default_ttl_ms: Option<u64>,
    delta_ms: u64,
}

impl DurationResolver {
    pub fn new(default_ttl_ms: Option<u64>) -> Self {
        Self {
            default_ttl_ms,
            delta_ms: 0,
        }
    }

    /// Subtract `delta_ms` from TTLs derived from a cron schedule.
    ///
    /// Numeric TTLs, explicit or configured, are never adjusted.
    pub fn with_delta(mut self, delta_ms: u64) -> Self {
        self.delta_ms = delta_ms;
        self
    }

    pub fn default_ttl_ms(&self) -> Option<u64> {
        self.default_ttl_ms
    }

    pub fn resolve(&self, explicit: Option<&DurationSpec>) -> Result<u64> {
        self.resolve_at(explicit, Utc::now())
    }

    /// Resolve relative to `now` instead of the wall clock
    pub fn resolve_at(&self, explicit: Option<&DurationSpec>, now: DateTime<Utc>) -> Result<u64> {
        let ttl = resolve_at(explicit, self.default_ttl_ms, now)?;
        match explicit {
            Some(DurationSpec::Schedule(_)) => Ok(self.apply_delta(ttl)),
            _ => Ok(ttl),
        }
    }

    fn apply_delta(&self, ttl: u64) -> u64 {
        if self.delta_ms == 0 {
            return ttl;
        }
        if self.delta_ms >= ttl {
            warn!(
                ttl_ms = ttl,
                delta_ms = self.delta_ms,
                "Lock duration delta would consume the whole TTL, ignoring it"
            );
            return ttl;
        }
        ttl - self.delta_ms
    }
}

/// Resolve a TTL: explicit value, then the configured default, then one minute.
pub fn resolve(explicit: Option<&DurationSpec>, configured_default: Option<u64>) -> Result<u64> {
    resolve_at(explicit, configured_default, Utc::now())
}

pub fn resolve_at(
    explicit: Option<&DurationSpec>,
    configured_default: Option<u64>,
    now: DateTime<Utc>,
) -> Result<u64> {
    match explicit {
        Some(DurationSpec::Millis(ms)) => Ok(*ms),
        Some(DurationSpec::Schedule(expr)) => millis_until_next(expr, now),
        None => match configured_default {
            Some(ms) => Ok(ms),
            None => {
                warn!(
                    default_ms = DEFAULT_LOCK_DURATION_MS,
                    "Both provided duration and default duration are undefined, using predefined default duration"
                );
                Ok(DEFAULT_LOCK_DURATION_MS)
            }
        },
    }
}

/// Parse a cron expression.
///
/// Accepts the classic five-field form (minute first) as well as the
/// six/seven-field form with seconds (and year). Five-field expressions fire
/// at second zero.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| LockError::InvalidSchedule {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Milliseconds from `now` until the next occurrence strictly after it
pub fn millis_until_next(expression: &str, now: DateTime<Utc>) -> Result<u64> {
    let schedule = parse_schedule(expression)?;
    let next = schedule
        .after(&now)
        .next()
        .ok_or_else(|| LockError::InvalidSchedule {
            expression: expression.to_string(),
            reason: "schedule has no upcoming occurrence".to_string(),
        })?;

    Ok((next - now).num_milliseconds().max(0) as u64)
}
