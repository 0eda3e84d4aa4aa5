//! Persistence layer — libSQL-backed storage for profiles, stories, contexts, and stats.

pub mod history;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use history::HistoryTrimmer;
pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
