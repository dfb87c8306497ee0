pub mod persistent_store;
pub mod stores;

pub use persistent_store::PersistentStore;
pub use stores::{PresenceStore, RetentionPolicy, Stores, TimestampStore};
