//! Score schemas, validation and storage.

pub mod schema;
pub mod store;
pub mod validate;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use schema::{ScoreDataType, ScoreRecord, ScoreSchema, SubmittedScore};
pub use store::{MemorySchemaStore, MemoryScoreStore, SchemaStore, ScoreStore};
pub use validate::{parse_bool, validate, ScoreValidator};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteScoreStore;
