//! Store handle shared by every entity.

use flotilla_state::SharedStore;

/// Explicit handle to the coordination store.
///
/// Entities are constructed through a `Context` and keep a clone of it;
/// cloning only bumps the store's reference count.
#[derive(Clone)]
pub struct Context {
    store: SharedStore,
}

impl Context {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}
