//! An in-memory token store

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{StoreError, TokenRecords, TokenStore};

/// An in-memory token store
///
/// Useful when persistence is not wanted, and for observing writes in tests.
#[derive(Default, Debug)]
pub struct InMemoryTokenStore {
    records: Mutex<TokenRecords>,
}

impl InMemoryTokenStore {
    /// Constructs a new, empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a store that already holds `records`
    pub fn with_records(records: TokenRecords) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    /// A copy of the records most recently saved
    pub fn records(&self) -> TokenRecords {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn load(&self) -> Result<TokenRecords, StoreError> {
        Ok(self.records())
    }

    async fn save(&self, records: &TokenRecords) -> Result<(), StoreError> {
        *self.records.lock().unwrap_or_else(PoisonError::into_inner) = records.clone();
        Ok(())
    }
}
