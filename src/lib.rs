#![forbid(unsafe_code)]

//! Idempotent ingestion of a single online video: channel profile, video
//! row and local media files are reconciled so each exists exactly once.

pub mod channel_api;
pub mod config;
pub mod error;
pub mod layout;
pub mod logging;
pub mod media;
pub mod metadata;
pub mod probe;
pub mod reconcile;

pub use error::IngestError;
pub use reconcile::{Ingestion, ReconciliationEngine, VideoAction};
