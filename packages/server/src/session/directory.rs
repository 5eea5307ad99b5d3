//! An in-memory user directory: the default [`hub_core::Authenticator`] the
//! server registers at startup (spec §4.3 `registerAuthenticator`).

use std::collections::HashMap;

use hub_core::{AuthOutcome, Authenticator, User};
use parking_lot::RwLock;

/// Holds the full `User` set in memory, keyed by user id.
///
/// Loaded from the persisted `config/users` document at startup and written
/// back through the same key whenever a user is added or changed.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<String, User>>,
}

impl InMemoryUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_users(users: Vec<User>) -> Self {
        let mut map = HashMap::with_capacity(users.len());
        for user in users {
            map.insert(user.user_id.clone(), user);
        }
        Self {
            users: RwLock::new(map),
        }
    }

    pub fn upsert(&self, user: User) {
        self.users.write().insert(user.user_id.clone(), user);
    }

    pub fn remove(&self, user_id: &str) -> Option<User> {
        self.users.write().remove(user_id)
    }

    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<User> {
        self.users.read().get(user_id).cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<User> {
        self.users.read().values().cloned().collect()
    }
}

impl Authenticator<User> for InMemoryUserDirectory {
    fn authenticate(&self, user_id: &str, password: &str) -> AuthOutcome<User> {
        match self.users.read().get(user_id) {
            Some(user) if user.check_password(password) => AuthOutcome::Authenticated(user.clone()),
            Some(_) => AuthOutcome::IncorrectPassword,
            None => AuthOutcome::NotFound,
        }
    }
}
