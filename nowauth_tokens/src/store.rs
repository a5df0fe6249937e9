//! Token persistence

use std::{collections::HashMap, error};

use async_trait::async_trait;

use crate::{BackendIdentity, TokenRecord};

#[cfg(feature = "file")]
pub mod file;
pub mod in_memory;

#[cfg(feature = "file")]
pub use file::FileTokenStore;
pub use in_memory::InMemoryTokenStore;

/// The full set of persisted token records, keyed by backend
pub type TokenRecords = HashMap<BackendIdentity, TokenRecord>;

/// A boxed persistence error
pub type StoreError = Box<dyn error::Error + Send + Sync + 'static>;

/// An asynchronous store for token records
///
/// Stores always read and write the complete set of records.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Loads every persisted record
    ///
    /// A store that has never been written returns an empty set.
    async fn load(&self) -> Result<TokenRecords, StoreError>;

    /// Replaces the persisted records with `records`
    async fn save(&self, records: &TokenRecords) -> Result<(), StoreError>;
}
