//! Database layer for hrsync

mod cache_repository;
mod conflict_repository;
mod connection;
mod metadata_repository;
mod migrations;
mod mirror_repository;
mod queue_repository;

pub use cache_repository::LibSqlCacheRepository;
pub use conflict_repository::LibSqlConflictRepository;
pub use connection::Database;
pub use metadata_repository::{LibSqlMetadataRepository, LAST_PUSH_AT, LAST_SYNC_AT};
pub use mirror_repository::{LibSqlMirrorRepository, MirrorRepository, UpsertOutcome};
pub use queue_repository::{
    FailureOutcome, LibSqlDeadLetterRepository, LibSqlQueueRepository, QueueRepository,
};
