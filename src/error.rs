use thiserror::Error;
use ulid::Ulid;

/// Upstream availability could not be read. Scoped to one facility.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("timeslot not found: {0}")]
    NotFound(Ulid),
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("channel returned status {0}")]
    Status(u16),
    #[error("notification not found: {0}")]
    NotFound(String),
    #[error("channel rejected notification: {0}")]
    Rejected(String),
}

impl NotificationError {
    /// Absent targets count as already retracted.
    pub fn is_not_found(&self) -> bool {
        matches!(self, NotificationError::NotFound(_))
    }
}

/// Why a facility's reconciliation pass was abandoned.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

impl ReconcileError {
    pub fn kind_label(&self) -> &'static str {
        match self {
            ReconcileError::Fetch(_) => "fetch",
            ReconcileError::Persistence(_) => "persistence",
        }
    }
}
