//! Pull/push synchronization against the remote API

mod engine;
mod pull;
mod push;
mod status;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine::SyncEngine;
pub use status::{CycleReport, PullReport, PushReport, SyncStatusSnapshot};
