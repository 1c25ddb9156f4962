pub mod continuations;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use continuations::{ContinuationRepo, ContinuationRow};
pub use database::Database;
pub use error::StoreError;
pub use sessions::{SessionRecord, SessionRepo};
