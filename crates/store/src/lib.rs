//! Persistence adapters for the insights pipeline.
//!
//! Both stores implement [`pipeline::WorkStore`] and [`pipeline::InsightReader`]:
//!
//! - [`MemoryStore`]: process-local, for tests and throwaway runs.
//! - [`SqliteStore`]: durable single-file store with transactional
//!   result commits.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
