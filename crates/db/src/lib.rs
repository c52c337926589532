pub mod connection;
pub mod incident_file;
pub mod lock_file;
pub mod migrations;
pub mod vector_store;

pub use connection::{connect, connect_with_settings, open_storage, DbError, DbPool};
pub use incident_file::FileIncidentLog;
pub use lock_file::FileLockStore;
pub use vector_store::SqlVectorStore;
