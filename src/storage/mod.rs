pub mod import;
pub mod sqlite;

pub use import::{ImportReport, Importer};
pub use sqlite::{ContentStore, StorageError};
