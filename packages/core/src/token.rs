//! Opaque session tokens and the identity/session store (spec §4.3).
//!
//! `IdentityStore<I>` is pure logic over `&mut self` -- no internal locking.
//! The server wraps an instance in a `parking_lot::RwLock` (mirroring how
//! the teacher crate wraps its `HLC` in a `Mutex` rather than baking a lock
//! into the core type itself) so lock scope stays visible at the call site.

use std::collections::HashMap;

use rand::distr::Alphanumeric;
use rand::Rng;

use crate::identity::Identity;

/// An opaque, random, URL-safe session token.
pub type Token = String;

#[must_use]
pub fn generate_token() -> Token {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

/// Authenticates a `(userID, password)` pair against some user store.
///
/// Authenticators are tried in registration order; the first to return
/// `Some` wins (spec §4.3 `validateUser`).
pub trait Authenticator<U>: Send + Sync {
    fn authenticate(&self, user_id: &str, password: &str) -> AuthOutcome<U>;
}

/// Result of probing a single authenticator.
pub enum AuthOutcome<U> {
    /// The user exists and the password matched.
    Authenticated(U),
    /// The user exists but the password did not match.
    IncorrectPassword,
    /// This authenticator has no such user; the next one should be tried.
    NotFound,
}

/// Errors raised by session operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("user does not exist")]
    UserNotExists,
    #[error("incorrect password")]
    IncorrectPassword,
    #[error("identity already has an active session")]
    AlreadyLoggedIn,
    #[error("token is invalid or expired")]
    InvalidToken,
}

/// A forced-logout notification raised by the 60s expiry ticker or an
/// explicit `logout`, carrying enough to let subscribers detach channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClosed {
    pub identity_id: String,
    pub token: Token,
}

/// Token-keyed store of identities and their expiry, plus the reverse index
/// from identity id to its live tokens (used to enforce
/// "at most one session" and to fan out forced logout).
pub struct IdentityStore<I> {
    identities: HashMap<Token, I>,
    expiry_millis: HashMap<Token, i64>,
    tokens_by_identity: HashMap<String, Vec<Token>>,
}

impl<I: Identity + Clone> Default for IdentityStore<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Identity + Clone> IdentityStore<I> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            identities: HashMap::new(),
            expiry_millis: HashMap::new(),
            tokens_by_identity: HashMap::new(),
        }
    }

    /// Issues a token for `identity`, enforcing the single-session rule when
    /// `identity.multiple_sessions_allowed()` is `false`.
    pub fn login(&mut self, identity: I, now_millis: u64) -> Result<Token, SessionError> {
        let id = identity.identity_id().to_string();
        if !identity.multiple_sessions_allowed()
            && self.tokens_by_identity.get(&id).is_some_and(|v| !v.is_empty())
        {
            return Err(SessionError::AlreadyLoggedIn);
        }

        let token = generate_token();
        let expiration_secs = identity.session_expiration();
        if expiration_secs > 0 {
            self.expiry_millis
                .insert(token.clone(), now_millis as i64 + expiration_secs * 1000);
        }
        self.identities.insert(token.clone(), identity);
        self.tokens_by_identity
            .entry(id)
            .or_default()
            .push(token.clone());
        Ok(token)
    }

    /// Validates a token, sliding its expiry forward and touching
    /// `last_activity` on success. Expired tokens are logged out and `None`
    /// is returned (invariant 1: removal from both maps happens together).
    pub fn validate_token(&mut self, token: &str, now_millis: u64) -> Option<&I> {
        if let Some(&expiry) = self.expiry_millis.get(token) {
            if (now_millis as i64) >= expiry {
                self.logout(token);
                return None;
            }
        } else if !self.identities.contains_key(token) {
            return None;
        }

        let expiration_secs = self.identities.get(token)?.session_expiration();
        if expiration_secs > 0 {
            self.expiry_millis
                .insert(token.to_string(), now_millis as i64 + expiration_secs * 1000);
        }
        let identity = self.identities.get_mut(token)?;
        identity.touch(now_millis);
        Some(identity)
    }

    /// Read-only lookup that does not slide expiry (used by diagnostics).
    #[must_use]
    pub fn peek(&self, token: &str) -> Option<&I> {
        self.identities.get(token)
    }

    /// The epoch-millis instant `token` currently expires at, if its
    /// identity has a finite session expiration.
    #[must_use]
    pub fn token_expiry_millis(&self, token: &str) -> Option<i64> {
        self.expiry_millis.get(token).copied()
    }

    /// Removes a token and its identity-side index entry, returning the
    /// closed-session notification if the token existed.
    pub fn logout(&mut self, token: &str) -> Option<SessionClosed> {
        let identity = self.identities.remove(token)?;
        self.expiry_millis.remove(token);
        let id = identity.identity_id().to_string();
        if let Some(tokens) = self.tokens_by_identity.get_mut(&id) {
            tokens.retain(|t| t != token);
            if tokens.is_empty() {
                self.tokens_by_identity.remove(&id);
            }
        }
        Some(SessionClosed {
            identity_id: id,
            token: token.to_string(),
        })
    }

    /// Forcibly logs out every token whose expiry is in the past. Intended
    /// to be driven by a 60-second ticker (spec §4.3).
    pub fn sweep_expired(&mut self, now_millis: u64) -> Vec<SessionClosed> {
        let expired: Vec<Token> = self
            .expiry_millis
            .iter()
            .filter(|&(_, &exp)| (now_millis as i64) >= exp)
            .map(|(t, _)| t.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|t| self.logout(&t))
            .collect()
    }

    #[must_use]
    pub fn token_count(&self) -> usize {
        self.identities.len()
    }
}
