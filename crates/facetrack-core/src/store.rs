//! Persistence seam for identities.

use crate::types::Identity;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("identity already exists: {0}")]
    Duplicate(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Durable home of identities. Implementations are driven from the worker
/// thread only, so methods take `&mut self`.
pub trait IdentityStore: Send {
    /// All identities in insertion order. Embeddings may be absent.
    fn fetch_all(&mut self) -> Result<Vec<Identity>, StoreError>;

    /// Persist a new identity and return its id.
    fn insert(&mut self, identity: &Identity) -> Result<String, StoreError>;

    /// Record one more visit: increment the count and bump the timestamp.
    fn update_visit(&mut self, id: &str) -> Result<(), StoreError>;
}

/// In-process store. Clones share the same backing list, which lets a
/// caller keep a handle for inspection after moving one into a resolver.
#[derive(Clone, Default)]
pub struct MemoryStore {
    identities: Arc<Mutex<Vec<Identity>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identities(identities: Vec<Identity>) -> Self {
        Self {
            identities: Arc::new(Mutex::new(identities)),
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<Identity> {
        self.identities
            .lock()
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<Identity> {
        self.snapshot().into_iter().find(|i| i.id == id)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Identity>>, StoreError> {
        self.identities
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }
}

impl IdentityStore for MemoryStore {
    fn fetch_all(&mut self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.lock()?.clone())
    }

    fn insert(&mut self, identity: &Identity) -> Result<String, StoreError> {
        let mut list = self.lock()?;
        if list.iter().any(|i| i.id == identity.id) {
            return Err(StoreError::Duplicate(identity.id.clone()));
        }
        list.push(identity.clone());
        Ok(identity.id.clone())
    }

    fn update_visit(&mut self, id: &str) -> Result<(), StoreError> {
        let mut list = self.lock()?;
        let identity = list
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        identity.visit_count = identity.visit_count.saturating_add(1);
        identity.last_visit = Utc::now();
        Ok(())
    }
}
