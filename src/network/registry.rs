//! Connection registry - id to live handle map, one instance per manager

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::ManagerError;

/// Single source of truth for "is there a live handle for this id".
///
/// Every mutation takes the inner lock once and never across an `.await`,
/// so a reservation made by `register` is visible to any concurrent caller
/// before the manager starts talking to the network.
pub struct Registry<H> {
    entries: Mutex<HashMap<String, H>>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Registry {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<H> Registry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, H>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a handle, failing if the id is taken
    pub fn register(&self, id: &str, handle: H) -> Result<(), ManagerError> {
        self.register_with(id, handle, |_| false)
    }

    /// Insert a handle; an existing entry is replaced only if `can_replace` says so
    pub fn register_with(
        &self,
        id: &str,
        handle: H,
        can_replace: impl FnOnce(&H) -> bool,
    ) -> Result<(), ManagerError> {
        let mut entries = self.entries();
        if let Some(existing) = entries.get(id) {
            if !can_replace(existing) {
                return Err(ManagerError::AlreadyConnected(id.to_string()));
            }
        }
        entries.insert(id.to_string(), handle);
        Ok(())
    }

    /// Run `f` against the entry under the lock
    pub fn with<R>(&self, id: &str, f: impl FnOnce(&mut H) -> R) -> Option<R> {
        self.entries().get_mut(id).map(f)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<H> {
        self.entries().remove(id)
    }

    /// Remove only if the current entry matches, e.g. still the same session
    pub fn remove_if(&self, id: &str, pred: impl FnOnce(&H) -> bool) -> Option<H> {
        let mut entries = self.entries();
        match entries.get(id) {
            Some(handle) if pred(handle) => entries.remove(id),
            _ => None,
        }
    }

    /// Drain everything, used at shutdown
    pub fn remove_all(&self) -> Vec<(String, H)> {
        self.entries().drain().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl<H: Clone> Registry<H> {
    pub fn lookup(&self, id: &str) -> Option<H> {
        self.entries().get(id).cloned()
    }
}

/// Cancellation handle of a one-shot call, keyed by request id
pub type CallToken = Arc<CancellationToken>;

/// Holds a request id for the duration of one call.
/// On drop only its own token is removed; the id may have been reused since.
pub struct InFlight<'a> {
    registry: &'a Registry<CallToken>,
    id: &'a str,
    token: CallToken,
}

impl<'a> InFlight<'a> {
    pub fn register(registry: &'a Registry<CallToken>, id: &'a str) -> Result<Self, ManagerError> {
        let token = Arc::new(CancellationToken::new());
        registry.register(id, Arc::clone(&token))?;
        Ok(InFlight { registry, id, token })
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.registry
            .remove_if(self.id, |token| Arc::ptr_eq(token, &self.token));
    }
}
