pub mod channel;
pub mod config;
pub mod diff;
pub mod error;
pub mod extract;
pub mod lock;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod reconciler;
pub mod retraction;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod wal;
