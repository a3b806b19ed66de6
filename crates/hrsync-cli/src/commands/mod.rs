pub mod auth_cmd;
pub mod cache;
pub mod common;
pub mod completions;
pub mod config_cmd;
pub mod conflicts;
pub mod dead_letter;
pub mod queue;
pub mod status;
pub mod sync;
