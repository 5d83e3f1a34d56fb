mod memory;
mod routed;
mod webhook;

pub use memory::{MemoryChannel, MemoryMessage};
pub use routed::RoutedChannel;
pub use webhook::{WebhookChannel, render_close, render_open};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::NotificationError;
use crate::model::*;

/// What a channel needs to announce a newly open timeslot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenNotice {
    pub slot: CanonicalTimeslot,
    pub facility_name: Option<String>,
}

/// What a channel needs to mark a notification stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseNotice {
    pub slot: CanonicalTimeslot,
    pub facility_name: Option<String>,
    pub available_at: DateTime<Utc>,
    pub unavailable_at: DateTime<Utc>,
}

impl CloseNotice {
    /// Whole minutes the slot stayed open, rounded.
    pub fn available_minutes(&self) -> i64 {
        let secs = (self.unavailable_at - self.available_at).num_seconds().max(0);
        (secs + 30) / 60
    }
}

/// Outbound notification sink. Rendering is the channel's concern.
///
/// `retract` and `delete` report `NotificationError::NotFound` for absent
/// handles; callers treat that as success.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn post(&self, notice: &OpenNotice) -> Result<NotificationHandle, NotificationError>;

    async fn retract(
        &self,
        handle: &NotificationHandle,
        notice: &CloseNotice,
    ) -> Result<(), NotificationError>;

    async fn delete(&self, handle: &NotificationHandle) -> Result<(), NotificationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn available_minutes_rounds() {
        let at = Utc::now();
        let notice = CloseNotice {
            slot: CanonicalTimeslot::new(
                "f",
                NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
                LocalTime::from_hm(9, 0).unwrap(),
                LocalTime::from_hm(10, 0).unwrap(),
            ),
            facility_name: None,
            available_at: at,
            unavailable_at: at + chrono::Duration::seconds(150),
        };
        assert_eq!(notice.available_minutes(), 3);
    }
}
