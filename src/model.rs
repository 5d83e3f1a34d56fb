use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Width of one raw availability granule, in minutes.
pub const GRANULE_MINUTES: u16 = 30;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Local wall-clock time as minutes since midnight, `0..=1440`.
///
/// `1440` is only produced for window ends (`24:00`, or `00:00` used as an end).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalTime(u16);

impl LocalTime {
    pub const MIDNIGHT: LocalTime = LocalTime(0);
    pub const END_OF_DAY: LocalTime = LocalTime(MINUTES_PER_DAY);

    pub fn from_hm(hours: u16, minutes: u16) -> Option<Self> {
        if minutes >= 60 {
            return None;
        }
        let total = hours.checked_mul(60)?.checked_add(minutes)?;
        (total <= MINUTES_PER_DAY).then_some(LocalTime(total))
    }

    /// Parse `HH:MM` or `HH:MM:SS`. Seconds are ignored.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split(':');
        let hours: u16 = parts.next()?.parse().ok()?;
        let minutes: u16 = parts.next()?.parse().ok()?;
        if let Some(secs) = parts.next() {
            let secs: u16 = secs.parse().ok()?;
            if secs >= 60 {
                return None;
            }
        }
        if parts.next().is_some() {
            return None;
        }
        Self::from_hm(hours, minutes)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    /// Add minutes, saturating at end of day.
    pub fn plus_minutes(self, minutes: u16) -> Self {
        LocalTime(self.0.saturating_add(minutes).min(MINUTES_PER_DAY))
    }

    /// Round down to the start of the containing granule.
    pub fn truncate_to_granule(self) -> Self {
        LocalTime(self.0 - self.0 % GRANULE_MINUTES)
    }

    /// Render in 12-hour clock, e.g. `9:30 AM`.
    pub fn to_12_hour(self) -> String {
        let hours = (self.0 / 60) % 24;
        let minutes = self.0 % 60;
        let suffix = if hours >= 12 { "PM" } else { "AM" };
        let h12 = match hours % 12 {
            0 => 12,
            h => h,
        };
        format!("{h12}:{minutes:02} {suffix}")
    }
}

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// Upstream day-of-week numbering: Sunday = 1 … Saturday = 7.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8 + 1
}

/// One occupied 30-minute slot at one court.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Granule {
    pub date: NaiveDate,
    pub time: LocalTime,
}

impl Granule {
    pub fn new(date: NaiveDate, time: LocalTime) -> Self {
        Self {
            date,
            time: time.truncate_to_granule(),
        }
    }

    /// Parse an upstream `YYYY-MM-DD HH:MM[:SS]` local timestamp.
    pub fn parse(s: &str) -> Option<Self> {
        let (date, time) = s.trim().split_once(' ')?;
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        let time = LocalTime::parse(time)?;
        if time == LocalTime::END_OF_DAY {
            return None;
        }
        Some(Self::new(date, time))
    }
}

/// Recurring bookable interval attached to a court.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PolicyWindow {
    /// Sunday = 1 … Saturday = 7.
    pub day_of_week: u8,
    pub start: LocalTime,
    pub end: LocalTime,
}

impl PolicyWindow {
    /// An end of `00:00` after a later start means the window runs to midnight.
    pub fn new(day_of_week: u8, start: LocalTime, end: LocalTime) -> Self {
        let end = if end == LocalTime::MIDNIGHT && start > LocalTime::MIDNIGHT {
            LocalTime::END_OF_DAY
        } else {
            end
        };
        Self {
            day_of_week,
            start,
            end,
        }
    }

    pub fn applies_on(&self, date: NaiveDate) -> bool {
        day_of_week(date) == self.day_of_week
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Court {
    pub id: String,
    pub instant_bookable: bool,
    pub sport_ids: Vec<String>,
    pub granules: Vec<Granule>,
    pub policies: Vec<PolicyWindow>,
}

/// Everything fetched for one facility in one pass. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilityFeed {
    pub facility_id: String,
    pub courts: Vec<Court>,
}

/// A watched facility. The list is static configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Facility {
    pub id: String,
    pub name: Option<String>,
}

impl Facility {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A policy-validated available window. Its fields are also its identity:
/// two timeslots are the same iff all four fields match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalTimeslot {
    pub facility_id: String,
    pub date: NaiveDate,
    pub start: LocalTime,
    pub end: LocalTime,
}

impl CanonicalTimeslot {
    pub fn new(facility_id: impl Into<String>, date: NaiveDate, start: LocalTime, end: LocalTime) -> Self {
        Self {
            facility_id: facility_id.into(),
            date,
            start,
            end,
        }
    }

    /// Stable string form of the identity key.
    pub fn fingerprint(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CanonicalTimeslot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.facility_id, self.date, self.start, self.end)
    }
}

/// Channel-specific id of a posted notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationHandle(pub String);

impl fmt::Display for NotificationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable record of a timeslot that was observed as available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTimeslot {
    pub id: Ulid,
    pub slot: CanonicalTimeslot,
    pub facility_name: Option<String>,
    pub available: bool,
    pub available_at: DateTime<Utc>,
    pub unavailable_at: Option<DateTime<Utc>>,
    pub notification: Option<NotificationHandle>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Set once the notification has been deleted from the channel.
    pub retracted_at: Option<DateTime<Utc>>,
}

impl PersistedTimeslot {
    pub fn opened(
        slot: CanonicalTimeslot,
        facility_name: Option<String>,
        notification: NotificationHandle,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            slot,
            facility_name,
            available: true,
            available_at: at,
            unavailable_at: None,
            notification: Some(notification),
            deleted_at: None,
            retracted_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Soft-deleted with a notification that has not been deleted yet.
    pub fn awaits_retraction(&self) -> bool {
        self.deleted_at.is_some() && self.notification.is_some() && self.retracted_at.is_none()
    }

    /// How long the slot stayed open. Display only.
    pub fn available_for(&self) -> Option<chrono::Duration> {
        self.unavailable_at.map(|end| end - self.available_at)
    }
}

/// One-shot cleanup of a stale notification.
///
/// `record` links the task to the row whose notification it deletes, so the
/// deletion can be recorded and replayed after a restart. Tasks for
/// notifications that never got a row carry `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetractionTask {
    pub handle: NotificationHandle,
    pub not_ready_before: DateTime<Utc>,
    pub record: Option<Ulid>,
}

impl RetractionTask {
    pub fn after(handle: NotificationHandle, now: DateTime<Utc>, delay: std::time::Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        Self {
            handle,
            not_ready_before: now + delay,
            record: None,
        }
    }

    pub fn for_record(mut self, id: Ulid) -> Self {
        self.record = Some(id);
        self
    }

    /// The pending deletion for a closed row, due `delay` after it closed.
    pub fn for_closed(row: &PersistedTimeslot, delay: std::time::Duration) -> Option<Self> {
        let handle = row.notification.clone()?;
        let closed_at = row.deleted_at?;
        Some(Self::after(handle, closed_at, delay).for_record(row.id))
    }

    /// Remaining wait relative to `now`; zero once due.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.not_ready_before - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

/// State-store log records, flat. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEvent {
    Created {
        record: PersistedTimeslot,
    },
    MarkedUnavailable {
        id: Ulid,
        at: DateTime<Utc>,
    },
    SoftDeleted {
        id: Ulid,
        at: DateTime<Utc>,
    },
    Retracted {
        id: Ulid,
        at: DateTime<Utc>,
    },
}

// ── Result types ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedOpen {
    pub slot: CanonicalTimeslot,
    pub reason: String,
}

/// Outcome of one reconciliation pass for one facility.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub facility_id: String,
    pub opened: Vec<CanonicalTimeslot>,
    pub closed: Vec<CanonicalTimeslot>,
    pub failed_opens: Vec<FailedOpen>,
    pub retractions: Vec<RetractionTask>,
}

impl ReconcileReport {
    pub fn new(facility_id: impl Into<String>) -> Self {
        Self {
            facility_id: facility_id.into(),
            ..Self::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty() && self.failed_opens.is_empty()
    }
}
