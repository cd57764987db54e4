pub mod backoff;
pub mod offline_store;

pub use offline_store::{InMemoryOfflineStore, OfflineStore, PgOfflineStore};
