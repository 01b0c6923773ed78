mod sqlite_store;
mod time;

pub use sqlite_store::{SIMULATED_PHONE, SqliteStore, StoreError};
