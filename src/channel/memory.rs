use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;
use ulid::Ulid;

use super::{CloseNotice, NotificationChannel, OpenNotice};
use crate::error::NotificationError;
use crate::model::NotificationHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMessage {
    pub notice: OpenNotice,
    pub retracted: Option<CloseNotice>,
}

/// Channel that keeps messages in memory and logs them. Used for dry runs.
#[derive(Default)]
pub struct MemoryChannel {
    messages: DashMap<NotificationHandle, MemoryMessage>,
    deleted: DashMap<NotificationHandle, usize>,
    fail_posts: AtomicBool,
    fail_retracts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent posts fail, to simulate an unreachable channel.
    pub fn set_fail_posts(&self, fail: bool) {
        self.fail_posts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_retracts(&self, fail: bool) {
        self.fail_retracts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Messages still present (posted and not deleted).
    pub fn live(&self) -> Vec<(NotificationHandle, MemoryMessage)> {
        self.messages
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn get(&self, handle: &NotificationHandle) -> Option<MemoryMessage> {
        self.messages.get(handle).map(|m| m.value().clone())
    }

    /// How many times `handle` was successfully deleted.
    pub fn delete_count(&self, handle: &NotificationHandle) -> usize {
        self.deleted.get(handle).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl NotificationChannel for MemoryChannel {
    async fn post(&self, notice: &OpenNotice) -> Result<NotificationHandle, NotificationError> {
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(NotificationError::Rejected("posting disabled".into()));
        }
        let handle = NotificationHandle(Ulid::new().to_string());
        info!("notify open {} as {handle}", notice.slot);
        self.messages.insert(
            handle.clone(),
            MemoryMessage {
                notice: notice.clone(),
                retracted: None,
            },
        );
        Ok(handle)
    }

    async fn retract(
        &self,
        handle: &NotificationHandle,
        notice: &CloseNotice,
    ) -> Result<(), NotificationError> {
        if self.fail_retracts.load(Ordering::SeqCst) {
            return Err(NotificationError::Status(503));
        }
        let mut message = self
            .messages
            .get_mut(handle)
            .ok_or_else(|| NotificationError::NotFound(handle.to_string()))?;
        info!(
            "notify closed {} after {} minutes",
            notice.slot,
            notice.available_minutes()
        );
        message.retracted = Some(notice.clone());
        Ok(())
    }

    async fn delete(&self, handle: &NotificationHandle) -> Result<(), NotificationError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(NotificationError::Status(503));
        }
        self.messages
            .remove(handle)
            .ok_or_else(|| NotificationError::NotFound(handle.to_string()))?;
        *self.deleted.entry(handle.clone()).or_insert(0) += 1;
        info!("notify deleted {handle}");
        Ok(())
    }
}
