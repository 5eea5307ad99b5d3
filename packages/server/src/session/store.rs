//! Token-keyed session store wrapping [`hub_core::IdentityStore`] with the
//! locking, authenticator list, and 60s expiry ticker the core type
//! deliberately leaves out (spec §4.3, §5).

use std::sync::Arc;

use hub_core::{
    AuthOutcome, Authenticator, ClockSource, DeviceIdentity, Identity, IdentityStore, Permission,
    SessionClosed, SessionError, Token, User,
};
use parking_lot::RwLock;

/// Either identity kind a token can resolve to.
#[derive(Debug, Clone)]
pub enum AnyIdentity {
    User(User),
    Device(DeviceIdentity),
}

impl AnyIdentity {
    #[must_use]
    pub fn as_user(&self) -> Option<&User> {
        match self {
            Self::User(u) => Some(u),
            Self::Device(_) => None,
        }
    }

    #[must_use]
    pub fn as_device(&self) -> Option<&DeviceIdentity> {
        match self {
            Self::Device(d) => Some(d),
            Self::User(_) => None,
        }
    }
}

impl Identity for AnyIdentity {
    fn identity_id(&self) -> &str {
        match self {
            Self::User(u) => u.identity_id(),
            Self::Device(d) => d.identity_id(),
        }
    }

    fn last_activity(&self) -> u64 {
        match self {
            Self::User(u) => u.last_activity(),
            Self::Device(d) => d.last_activity(),
        }
    }

    fn touch(&mut self, now_millis: u64) {
        match self {
            Self::User(u) => u.touch(now_millis),
            Self::Device(d) => d.touch(now_millis),
        }
    }

    fn is_authorized_to(&self, permission: &Permission) -> bool {
        match self {
            Self::User(u) => u.is_authorized_to(permission),
            Self::Device(d) => d.is_authorized_to(permission),
        }
    }

    fn session_expiration(&self) -> i64 {
        match self {
            Self::User(u) => u.session_expiration(),
            Self::Device(d) => d.session_expiration(),
        }
    }

    fn multiple_sessions_allowed(&self) -> bool {
        match self {
            Self::User(u) => u.multiple_sessions_allowed(),
            Self::Device(d) => d.multiple_sessions_allowed(),
        }
    }
}

/// Identity/session store: authenticator chain, token store, and clock.
///
/// `hub_core::IdentityStore` stays pure `&mut self` logic; this wrapper adds
/// the `RwLock` and is the only place in the server that touches it, so the
/// lock's scope is visible at every call site (spec §5).
pub struct SessionStore {
    authenticators: RwLock<Vec<Arc<dyn Authenticator<User>>>>,
    tokens: RwLock<IdentityStore<AnyIdentity>>,
    clock: Arc<dyn ClockSource>,
}

impl SessionStore {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            authenticators: RwLock::new(Vec::new()),
            tokens: RwLock::new(IdentityStore::new()),
            clock,
        }
    }

    /// Appends an authenticator to the read-mostly probe chain (spec §4.3
    /// `registerAuthenticator`).
    pub fn register_authenticator(&self, authenticator: Arc<dyn Authenticator<User>>) {
        self.authenticators.write().push(authenticator);
    }

    /// Probes registered authenticators in order; the first non-`NotFound`
    /// outcome wins.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UserNotExists`] if no authenticator recognizes
    /// the user id, or [`SessionError::IncorrectPassword`] if one does but
    /// the password does not match.
    pub fn validate_user(&self, user_id: &str, password: &str) -> Result<User, SessionError> {
        for authenticator in self.authenticators.read().iter() {
            match authenticator.authenticate(user_id, password) {
                AuthOutcome::Authenticated(user) => return Ok(user),
                AuthOutcome::IncorrectPassword => return Err(SessionError::IncorrectPassword),
                AuthOutcome::NotFound => continue,
            }
        }
        Err(SessionError::UserNotExists)
    }

    /// Validates credentials and issues a token (spec §4.3 `login(userID, password)`).
    ///
    /// # Errors
    ///
    /// Propagates [`SessionError`] from [`Self::validate_user`], or
    /// [`SessionError::AlreadyLoggedIn`] if the user is a service identity
    /// with an existing session.
    pub fn login_with_password(&self, user_id: &str, password: &str) -> Result<Token, SessionError> {
        let user = self.validate_user(user_id, password)?;
        self.login_identity(AnyIdentity::User(user))
    }

    /// Issues a token for an already-authenticated identity (spec §4.3
    /// `login(identity)`), e.g. a device completing `node:register`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyLoggedIn`] if `identity` disallows
    /// multiple sessions and already holds one.
    pub fn login_identity(&self, identity: AnyIdentity) -> Result<Token, SessionError> {
        self.tokens.write().login(identity, self.clock.now_millis())
    }

    /// Validates a token, sliding its expiry forward on success (spec §4.3
    /// `validateToken`).
    #[must_use]
    pub fn validate_token(&self, token: &str) -> Option<AnyIdentity> {
        self.tokens
            .write()
            .validate_token(token, self.clock.now_millis())
            .cloned()
    }

    /// The epoch-millis instant `token` expires at, if its identity has a
    /// finite session expiration (spec S1 `tokenExpiration`).
    #[must_use]
    pub fn token_expiration_millis(&self, token: &str) -> Option<i64> {
        self.tokens.read().token_expiry_millis(token)
    }

    /// Removes a token's session, returning the closed-session notification
    /// so callers can detach subscribed channels (spec §4.3 `logout`).
    pub fn logout(&self, token: &str) -> Option<SessionClosed> {
        self.tokens.write().logout(token)
    }

    /// Forcibly logs out every token past its expiry. Intended to be driven
    /// by a 60-second ticker (spec §4.3).
    pub fn sweep_expired(&self) -> Vec<SessionClosed> {
        self.tokens.write().sweep_expired(self.clock.now_millis())
    }

    #[must_use]
    pub fn token_count(&self) -> usize {
        self.tokens.read().token_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::ManualClock;

    fn store_with_user(user_id: &str, password: &str) -> (SessionStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let store = SessionStore::new(clock.clone());
        let dir = Arc::new(crate::session::InMemoryUserDirectory::new());
        dir.upsert(User::new(user_id, password));
        store.register_authenticator(dir);
        (store, clock)
    }

    #[test]
    fn login_with_password_then_validate() {
        let (store, _clock) = store_with_user("admin", "hunter2");
        let token = store.login_with_password("admin", "hunter2").unwrap();
        let identity = store.validate_token(&token).unwrap();
        assert_eq!(identity.identity_id(), "admin");
    }

    #[test]
    fn wrong_password_rejected() {
        let (store, _clock) = store_with_user("admin", "hunter2");
        assert_eq!(
            store.login_with_password("admin", "wrong").unwrap_err(),
            SessionError::IncorrectPassword
        );
    }

    #[test]
    fn unknown_user_rejected() {
        let (store, _clock) = store_with_user("admin", "hunter2");
        assert_eq!(
            store.login_with_password("nobody", "x").unwrap_err(),
            SessionError::UserNotExists
        );
    }

    #[test]
    fn login_identity_supports_devices() {
        let clock = Arc::new(ManualClock::new(0));
        let store = SessionStore::new(clock);
        let token = store
            .login_identity(AnyIdentity::Device(DeviceIdentity::new("AA:BB")))
            .unwrap();
        let identity = store.validate_token(&token).unwrap();
        assert!(identity.as_device().is_some());
    }

    #[test]
    fn sweep_expired_logs_out_past_due_tokens() {
        let clock = Arc::new(ManualClock::new(0));
        let store = SessionStore::new(clock.clone());
        let mut expiring = User::new("admin", "x");
        expiring.session_expiration_secs = 1;
        store.login_identity(AnyIdentity::User(expiring)).unwrap();

        clock.advance(5_000);
        let closed = store.sweep_expired();
        assert_eq!(closed.len(), 1);
        assert_eq!(store.token_count(), 0);
    }
}
