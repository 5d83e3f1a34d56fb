use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{CloseNotice, NotificationChannel, OpenNotice};
use crate::error::NotificationError;
use crate::model::NotificationHandle;

const OPEN_COLOR: u32 = 0x00ff00;
const CLOSED_COLOR: u32 = 0xff0000;
const BOOKING_URL: &str = "https://www.rec.us/locations";

/// Discord-compatible webhook: post, edit and delete messages by id.
pub struct WebhookChannel {
    client: Client,
    url: String,
}

#[derive(Deserialize)]
struct PostedMessage {
    id: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotificationError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
        }
    }

    fn message_url(&self, handle: &NotificationHandle) -> String {
        format!("{}/messages/{}", self.url, handle)
    }
}

/// Map a response status: 2xx ok, 404 absent, anything else an error.
fn check_status(status: StatusCode, handle: &NotificationHandle) -> Result<(), NotificationError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::NOT_FOUND {
        Err(NotificationError::NotFound(handle.to_string()))
    } else {
        Err(NotificationError::Status(status.as_u16()))
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn post(&self, notice: &OpenNotice) -> Result<NotificationHandle, NotificationError> {
        let resp = self
            .client
            .post(&self.url)
            .query(&[("wait", "true")])
            .json(&render_open(notice))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NotificationError::Status(status.as_u16()));
        }
        let message: PostedMessage = resp.json().await?;
        Ok(NotificationHandle(message.id))
    }

    async fn retract(
        &self,
        handle: &NotificationHandle,
        notice: &CloseNotice,
    ) -> Result<(), NotificationError> {
        let resp = self
            .client
            .patch(self.message_url(handle))
            .json(&render_close(notice))
            .send()
            .await?;
        check_status(resp.status(), handle)
    }

    async fn delete(&self, handle: &NotificationHandle) -> Result<(), NotificationError> {
        let resp = self.client.delete(self.message_url(handle)).send().await?;
        check_status(resp.status(), handle)
    }
}

// ── Rendering ────────────────────────────────────────────────────

fn title_prefix(facility_name: &Option<String>) -> String {
    facility_name
        .as_ref()
        .map(|n| format!("{n}: "))
        .unwrap_or_default()
}

pub fn render_open(notice: &OpenNotice) -> Value {
    let slot = &notice.slot;
    json!({
        "embeds": [{
            "color": OPEN_COLOR,
            "title": format!("{}New Court Timeslot Available!", title_prefix(&notice.facility_name)),
            "description": "If you can see this message, the court is still available for booking!",
            "fields": [
                { "name": "Date", "value": slot.date.to_string(), "inline": true },
                { "name": "Start Time", "value": slot.start.to_12_hour(), "inline": true },
                { "name": "Book Here", "value": format!("[Click to book on rec.us]({BOOKING_URL}/{})", slot.facility_id), "inline": true },
            ],
            "footer": { "text": "Book fast!" },
        }]
    })
}

pub fn render_close(notice: &CloseNotice) -> Value {
    let slot = &notice.slot;
    json!({
        "embeds": [{
            "color": CLOSED_COLOR,
            "title": format!("{}Court Timeslot No Longer Available", title_prefix(&notice.facility_name)),
            "description": "This court has been booked by someone else.",
            "fields": [
                { "name": "Date", "value": slot.date.to_string(), "inline": true },
                { "name": "Start Time", "value": slot.start.to_12_hour(), "inline": true },
                { "name": "Duration Available", "value": format!("{} minutes", notice.available_minutes()), "inline": true },
                { "name": "Booked At", "value": notice.unavailable_at.to_rfc3339(), "inline": true },
            ],
            "footer": { "text": "Keep checking for new timeslots!" },
        }]
    })
}
