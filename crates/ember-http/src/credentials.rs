//! User credential lookup for the form login/registration pages.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Name/password store queried by form POSTs
pub trait CredentialStore: Send + Sync {
    /// True if `name` exists with exactly `password`
    fn login(&self, name: &str, password: &str) -> bool;

    /// Add `name`; false if it already exists
    fn register(&self, name: &str, password: &str) -> bool;
}

/// In-process map guarded by a mutex
#[derive(Debug)]
pub struct MemoryStore {
    users: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Empty store
    pub fn empty() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_users<I, N, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (N, P)>,
        N: Into<String>,
        P: Into<String>,
    {
        let store = Self::empty();
        {
            let mut map = store.users.lock().unwrap_or_else(PoisonError::into_inner);
            for (name, password) in users {
                map.insert(name.into(), password.into());
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.users.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    /// Seeded with the demo account `root` / `root`
    fn default() -> Self {
        Self::with_users([("root", "root")])
    }
}

impl CredentialStore for MemoryStore {
    fn login(&self, name: &str, password: &str) -> bool {
        let users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        users.get(name).is_some_and(|p| p == password)
    }

    fn register(&self, name: &str, password: &str) -> bool {
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        if users.contains_key(name) {
            return false;
        }
        users.insert(name.to_string(), password.to_string());
        true
    }
}
