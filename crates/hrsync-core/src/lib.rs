//! hrsync-core - Offline synchronization core
//!
//! This crate contains the durable write queue, the local mirror of
//! server-owned records, and the pull/push engine that reconciles them with
//! the remote HR leave portal API.

pub mod cache;
pub mod compression;
pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod scheduler;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{
    ConflictRecord, DeadLetterEntry, HttpMethod, MirrorRecord, QueueEntry, QueueEntryId,
    ResourceKind, SyncStatus,
};
