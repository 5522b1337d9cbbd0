use std::fmt::{Display, Formatter};

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::RateLimitSettings;
use crate::db::models::{RateLimitState, RollingUsage};
use crate::db::{
    count_outbound_since, has_reservation, insert_reservation, load_rate_limit_state,
    rolling_usage, store_rate_limit_state, Database, DbError,
};

const EMERGENCY_SHORT_WINDOW_SECS: i64 = 30;
const EMERGENCY_LONG_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum BlockReason {
    EmergencyBrake {
        window_secs: i64,
        count: i64,
        threshold: i64,
    },
    Burst {
        count: i64,
        limit: i64,
    },
    PerMinute {
        count: i64,
        limit: i64,
    },
    PerHour {
        count: i64,
        limit: i64,
    },
    PerDay {
        count: i64,
        limit: i64,
    },
    MinInterval {
        remaining_secs: i64,
    },
}

impl BlockReason {
    pub fn tier(&self) -> &'static str {
        match self {
            Self::EmergencyBrake { .. } => "emergency_brake",
            Self::Burst { .. } => "burst",
            Self::PerMinute { .. } => "per_minute",
            Self::PerHour { .. } => "per_hour",
            Self::PerDay { .. } => "per_day",
            Self::MinInterval { .. } => "min_interval",
        }
    }
}

impl Display for BlockReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmergencyBrake {
                window_secs,
                count,
                threshold,
            } => write!(
                f,
                "emergency_brake: {count} outbound records in the last {window_secs}s (threshold {threshold})"
            ),
            Self::Burst { count, limit } => write!(f, "burst: {count}/{limit} in burst window"),
            Self::PerMinute { count, limit } => write!(f, "per_minute: {count}/{limit}"),
            Self::PerHour { count, limit } => write!(f, "per_hour: {count}/{limit}"),
            Self::PerDay { count, limit } => write!(f, "per_day: {count}/{limit}"),
            Self::MinInterval { remaining_secs } => {
                write!(f, "min_interval: next send allowed in {remaining_secs}s")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    /// Budget reserved; carries the state as written.
    Allowed(RateLimitState),
    Blocked(BlockReason),
}

impl GuardDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierUsage {
    pub used: i64,
    pub limit: i64,
}

/// Usage as it applies at `now`. Burst and minute windows that have rolled
/// over read as zero; hour and day count the trailing window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitSnapshot {
    pub tenant_id: String,
    pub burst: TierUsage,
    pub minute: TierUsage,
    pub hour: TierUsage,
    pub day: TierUsage,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub next_send_in_secs: i64,
}

fn minute_bucket(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::minutes(1)).unwrap_or(now)
}

/// The minute window has rolled when its stored start is before the current
/// bucket. A stored start ahead of `now` (clock moved back) keeps counting.
fn minute_usage(state: &RateLimitState, now: DateTime<Utc>) -> (i64, Option<DateTime<Utc>>) {
    let bucket = minute_bucket(now);
    match state.minute_window_start {
        Some(start) if start >= bucket => (state.minute_count, Some(start)),
        _ => (0, Some(bucket)),
    }
}

fn burst_usage(
    state: &RateLimitState,
    limits: &RateLimitSettings,
    now: DateTime<Utc>,
) -> (i64, Option<DateTime<Utc>>) {
    match state.burst_window_start {
        Some(start) if now - start < Duration::seconds(limits.burst_window_secs) => {
            (state.burst_count, Some(start))
        }
        _ => (0, None),
    }
}

fn interval_remaining(
    state: &RateLimitState,
    limits: &RateLimitSettings,
    now: DateTime<Utc>,
) -> i64 {
    let Some(last) = state.last_sent_at else {
        return 0;
    };
    if limits.min_interval_secs <= 0 {
        return 0;
    }
    let elapsed = (now - last).num_seconds();
    (limits.min_interval_secs - elapsed).max(0)
}

/// Pure check of every tier but the emergency brake. `rolling` holds the
/// reservations already inside the trailing hour and day. On success returns
/// the state as it stands after one more send.
pub fn evaluate(
    state: &RateLimitState,
    rolling: &RollingUsage,
    limits: &RateLimitSettings,
    now: DateTime<Utc>,
) -> Result<RateLimitState, BlockReason> {
    let (burst_count, burst_start) = burst_usage(state, limits, now);
    let (minute_count, minute_start) = minute_usage(state, now);
    let hourly_count = rolling.hour;
    let daily_count = rolling.day;

    if burst_count >= limits.burst_limit {
        return Err(BlockReason::Burst {
            count: burst_count,
            limit: limits.burst_limit,
        });
    }
    if minute_count >= limits.max_per_minute {
        return Err(BlockReason::PerMinute {
            count: minute_count,
            limit: limits.max_per_minute,
        });
    }
    if hourly_count >= limits.max_per_hour {
        return Err(BlockReason::PerHour {
            count: hourly_count,
            limit: limits.max_per_hour,
        });
    }
    if daily_count >= limits.max_per_day {
        return Err(BlockReason::PerDay {
            count: daily_count,
            limit: limits.max_per_day,
        });
    }
    let remaining_secs = interval_remaining(state, limits, now);
    if remaining_secs > 0 {
        return Err(BlockReason::MinInterval { remaining_secs });
    }

    Ok(RateLimitState {
        tenant_id: state.tenant_id.clone(),
        burst_count: burst_count + 1,
        burst_window_start: burst_start.or(Some(now)),
        minute_count: minute_count + 1,
        minute_window_start: minute_start,
        hourly_count: hourly_count + 1,
        hour_window_start: rolling.hour_oldest.or(Some(now)),
        daily_count: daily_count + 1,
        day_window_start: rolling.day_oldest.or(Some(now)),
        last_sent_at: Some(state.last_sent_at.map_or(now, |last| last.max(now))),
    })
}

pub struct RateLimiter<'a> {
    db: &'a Database,
}

impl<'a> RateLimiter<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Checks every tier and reserves one send in the same `BEGIN IMMEDIATE`
    /// transaction.
    pub fn check_and_record(
        &self,
        tenant_id: &str,
        limits: &RateLimitSettings,
        now: DateTime<Utc>,
    ) -> Result<GuardDecision, DbError> {
        self.reserve(tenant_id, None, limits, now)
    }

    /// As `check_and_record`, with the reservation tied to `message_id`. A
    /// message that already holds a reservation (its earlier cycle was cut
    /// off before the outcome was written) is allowed again without being
    /// charged twice.
    pub fn reserve(
        &self,
        tenant_id: &str,
        message_id: Option<&str>,
        limits: &RateLimitSettings,
        now: DateTime<Utc>,
    ) -> Result<GuardDecision, DbError> {
        let decision = self.db.immediate(|conn| {
            let state = load_rate_limit_state(conn, tenant_id)?.unwrap_or_else(|| RateLimitState {
                tenant_id: tenant_id.to_string(),
                ..RateLimitState::default()
            });
            if let Some(message_id) = message_id {
                if has_reservation(conn, tenant_id, message_id)? {
                    debug!(tenant_id, message_id, "reusing existing send reservation");
                    return Ok(GuardDecision::Allowed(state));
                }
            }

            for (window_secs, threshold) in [
                (EMERGENCY_SHORT_WINDOW_SECS, limits.emergency_30s_threshold),
                (EMERGENCY_LONG_WINDOW_SECS, limits.emergency_60s_threshold),
            ] {
                if threshold <= 0 {
                    continue;
                }
                let count =
                    count_outbound_since(conn, tenant_id, now - Duration::seconds(window_secs))?;
                if count >= threshold {
                    return Ok(GuardDecision::Blocked(BlockReason::EmergencyBrake {
                        window_secs,
                        count,
                        threshold,
                    }));
                }
            }

            let rolling = rolling_usage(conn, tenant_id, now)?;
            match evaluate(&state, &rolling, limits, now) {
                Ok(next) => {
                    store_rate_limit_state(conn, &next, now)?;
                    insert_reservation(conn, tenant_id, message_id, now)?;
                    Ok(GuardDecision::Allowed(next))
                }
                Err(reason) => Ok(GuardDecision::Blocked(reason)),
            }
        })?;

        match &decision {
            GuardDecision::Allowed(state) => debug!(
                tenant_id,
                hourly = state.hourly_count,
                daily = state.daily_count,
                "send budget reserved"
            ),
            GuardDecision::Blocked(reason) => {
                debug!(tenant_id, tier = reason.tier(), %reason, "send blocked")
            }
        }
        Ok(decision)
    }

    pub fn snapshot(
        &self,
        tenant_id: &str,
        limits: &RateLimitSettings,
        now: DateTime<Utc>,
    ) -> Result<RateLimitSnapshot, DbError> {
        let state = self
            .db
            .get_rate_limit_state(tenant_id)?
            .unwrap_or_default();
        let rolling = rolling_usage(self.db.conn(), tenant_id, now)?;

        let usage = |used: i64, limit: i64| TierUsage { used, limit };
        Ok(RateLimitSnapshot {
            tenant_id: tenant_id.to_string(),
            burst: usage(burst_usage(&state, limits, now).0, limits.burst_limit),
            minute: usage(minute_usage(&state, now).0, limits.max_per_minute),
            hour: usage(rolling.hour, limits.max_per_hour),
            day: usage(rolling.day, limits.max_per_day),
            last_sent_at: state.last_sent_at,
            next_send_in_secs: interval_remaining(&state, limits, now),
        })
    }

    pub fn reset(&self, tenant_id: &str) -> Result<bool, DbError> {
        Ok(self.db.reset_rate_limit_state(tenant_id)? > 0)
    }
}
