//! Scheduling windows: business hours, weekends, and whose clock counts.

use chrono::{
    DateTime, Datelike, Days, FixedOffset, NaiveDateTime, NaiveTime, Timelike, Utc, Weekday,
};

use crate::config::OrchestratorConfig;
use crate::session::model::ContactTimezone;
use crate::survey::model::SchedulingConstraints;

const WINDOW_OPEN_HOUR: u32 = 9;
const WINDOW_CLOSE_HOUR: u32 = 17;

/// Outcome of checking a session against its survey's constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowCheck {
    Open,
    Closed { next_open: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct SchedulingPolicy {
    local_offset: FixedOffset,
    horizon: chrono::Duration,
}

impl SchedulingPolicy {
    pub fn new(local_offset: FixedOffset, horizon: std::time::Duration) -> Self {
        Self {
            local_offset,
            horizon: chrono::Duration::from_std(horizon).unwrap_or(chrono::Duration::days(3)),
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.local_offset, config.window_horizon)
    }

    /// The offset "local time" means for this contact.
    pub fn resolve_offset(
        &self,
        constraints: &SchedulingConstraints,
        contact_tz: Option<ContactTimezone>,
    ) -> FixedOffset {
        match contact_tz {
            Some(tz) if constraints.respect_contact_timezone => tz.offset(),
            _ => self.local_offset,
        }
    }

    pub fn check(
        &self,
        constraints: &SchedulingConstraints,
        contact_tz: Option<ContactTimezone>,
        now: DateTime<Utc>,
    ) -> WindowCheck {
        if !constraints.business_hours_only && !constraints.avoid_weekends {
            return WindowCheck::Open;
        }

        let offset = self.resolve_offset(constraints, contact_tz);
        let local = now.with_timezone(&offset).naive_local();
        if permitted(constraints, local) {
            return WindowCheck::Open;
        }

        let opens_at = if constraints.business_hours_only {
            NaiveTime::from_hms_opt(WINDOW_OPEN_HOUR, 0, 0).unwrap_or(NaiveTime::MIN)
        } else {
            NaiveTime::MIN
        };

        // Any window is at most three days away (Friday evening to Monday morning).
        let next_local = (0..8u64)
            .filter_map(|d| local.date().checked_add_days(Days::new(d)))
            .map(|date| date.and_time(opens_at))
            .find(|candidate| *candidate > local && permitted(constraints, *candidate));

        let next_open = match next_local {
            Some(naive) => to_utc(naive, offset),
            None => now + chrono::Duration::days(1),
        };
        WindowCheck::Closed { next_open }
    }

    /// Whether a closed window reopens soon enough to reschedule to it.
    pub fn within_horizon(&self, now: DateTime<Utc>, next_open: DateTime<Utc>) -> bool {
        next_open.signed_duration_since(now) <= self.horizon
    }
}

fn permitted(constraints: &SchedulingConstraints, local: NaiveDateTime) -> bool {
    if constraints.avoid_weekends && matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    if constraints.business_hours_only {
        return (WINDOW_OPEN_HOUR..WINDOW_CLOSE_HOUR).contains(&local.hour());
    }
    true
}

fn to_utc(local: NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    (local - chrono::Duration::seconds(i64::from(offset.local_minus_utc()))).and_utc()
}
