//! Shared application services.

pub mod database;

pub use database::DatabaseService;
