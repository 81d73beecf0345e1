//! Registry of fetches currently running, one per canonical key.
//!
//! Each registration carries a generation id. Only the operation that
//! created a registration may remove it, so a fetch started before a
//! [`InFlight::clear`] can never unregister (or cache on behalf of) the
//! fetch that replaced it.

use barvault_core::{Bar, CanonicalKey, FetchError};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;

/// Result handed to every caller joined on one operation.
pub type FetchOutcome = Result<Arc<[Bar]>, FetchError>;

/// Handle to a running operation. Cloning it and awaiting the clone is how
/// additional callers attach.
pub type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Whether [`InFlight::join`] attached to an existing operation or started one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRole {
    Leader,
    Follower,
}

struct Registration {
    id: u64,
    fetch: SharedFetch,
}

#[derive(Default)]
pub struct InFlight {
    ops: HashMap<CanonicalKey, Registration>,
    next_id: u64,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn contains(&self, key: &CanonicalKey) -> bool {
        self.ops.contains_key(key)
    }

    /// Attach to the running operation for `key`, or register a new one
    /// built by `start`. `start` receives the generation id it must later
    /// pass to [`InFlight::finish`].
    pub fn join<F>(&mut self, key: &CanonicalKey, start: F) -> (SharedFetch, JoinRole)
    where
        F: FnOnce(u64) -> BoxFuture<'static, FetchOutcome>,
    {
        if let Some(reg) = self.ops.get(key) {
            return (reg.fetch.clone(), JoinRole::Follower);
        }
        let id = self.next_id;
        self.next_id += 1;
        let fetch = start(id).shared();
        self.ops.insert(
            key.clone(),
            Registration {
                id,
                fetch: fetch.clone(),
            },
        );
        (fetch, JoinRole::Leader)
    }

    /// Remove the registration for `key` if it is still generation `id`.
    pub fn finish(&mut self, key: &CanonicalKey, id: u64) -> bool {
        match self.ops.get(key) {
            Some(reg) if reg.id == id => {
                self.ops.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Forget every registration. Running operations still complete and
    /// deliver to the callers already attached.
    pub fn clear(&mut self) {
        self.ops.clear();
    }
}
