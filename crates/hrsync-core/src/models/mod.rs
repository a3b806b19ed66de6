//! Data models for hrsync

mod cache_entry;
mod conflict;
mod dead_letter;
mod mirror;
mod queue_entry;
mod resource;

pub use cache_entry::CacheEntry;
pub use conflict::{ConflictRecord, ConflictStatus, ConflictType, ResolutionStrategy};
pub use dead_letter::DeadLetterEntry;
pub use mirror::{LeaveRequestFields, MirrorRecord, ServerRecord, SyncStatus};
pub use queue_entry::{
    local_record_id, NewQueueEntry, QueueEntry, QueueEntryId, QueueHeaders, DEFAULT_MAX_RETRIES,
    LOCAL_ID_PREFIX,
};
pub use resource::{HttpMethod, ResourceKind};
