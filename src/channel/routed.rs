use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{CloseNotice, NotificationChannel, OpenNotice};
use crate::error::NotificationError;
use crate::model::NotificationHandle;

/// Sends each facility's notifications to its own channel.
///
/// Handles from a routed facility are stored as `{facility_id}/{inner}` so
/// later edits and deletes reach the channel that posted them. Facilities
/// without a route use `fallback` and keep the inner handle unchanged.
pub struct RoutedChannel {
    routes: HashMap<String, Arc<dyn NotificationChannel>>,
    fallback: Arc<dyn NotificationChannel>,
}

impl RoutedChannel {
    pub fn new(fallback: Arc<dyn NotificationChannel>) -> Self {
        Self {
            routes: HashMap::new(),
            fallback,
        }
    }

    pub fn with_route(mut self, facility_id: impl Into<String>, channel: Arc<dyn NotificationChannel>) -> Self {
        self.routes.insert(facility_id.into(), channel);
        self
    }

    /// Channel and inner handle for a stored handle.
    fn resolve(&self, handle: &NotificationHandle) -> (&dyn NotificationChannel, NotificationHandle) {
        if let Some((facility_id, inner)) = handle.0.rsplit_once('/') {
            if let Some(channel) = self.routes.get(facility_id) {
                return (channel.as_ref(), NotificationHandle(inner.to_string()));
            }
        }
        (self.fallback.as_ref(), handle.clone())
    }
}

#[async_trait]
impl NotificationChannel for RoutedChannel {
    async fn post(&self, notice: &OpenNotice) -> Result<NotificationHandle, NotificationError> {
        let facility_id = &notice.slot.facility_id;
        match self.routes.get(facility_id) {
            Some(channel) => {
                let inner = channel.post(notice).await?;
                Ok(NotificationHandle(format!("{facility_id}/{inner}")))
            }
            None => self.fallback.post(notice).await,
        }
    }

    async fn retract(
        &self,
        handle: &NotificationHandle,
        notice: &CloseNotice,
    ) -> Result<(), NotificationError> {
        let (channel, inner) = self.resolve(handle);
        channel.retract(&inner, notice).await
    }

    async fn delete(&self, handle: &NotificationHandle) -> Result<(), NotificationError> {
        let (channel, inner) = self.resolve(handle);
        channel.delete(&inner).await
    }
}
