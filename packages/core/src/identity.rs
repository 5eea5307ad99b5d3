//! Identity model: the common contract for users and devices, plus the
//! `User` specialization. Password hashing, permission checks and session
//! knobs all live here as pure data/logic -- the session store that wraps
//! identities in tokens lives in [`crate::token`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A permission name, e.g. `"is-admin"` or `"MANAGE_DEVICES"`.
///
/// Modeled as a plain string set rather than a closed enum: the spec leaves
/// the permission vocabulary open (Non-goal: ACL expression language), so
/// callers compare against whatever string the deployment chooses to use.
pub type Permission = str;

/// Well-known permission required to hook/unhook device mappings.
pub const MANAGE_DEVICES: &str = "MANAGE_DEVICES";
/// Well-known permission required to write `SettingsObjectResource` properties.
pub const IS_ADMIN: &str = "is-admin";

/// Common contract shared by every identity kind (user, device).
pub trait Identity: Send + Sync {
    /// Stable identifier: a username for users, the device uuid for devices.
    fn identity_id(&self) -> &str;

    /// Milliseconds since epoch of the identity's last observed activity.
    fn last_activity(&self) -> u64;

    /// Records activity at the given timestamp.
    fn touch(&mut self, now_millis: u64);

    /// Whether the identity holds the named permission.
    fn is_authorized_to(&self, permission: &Permission) -> bool;

    /// Seconds until a token should expire; `<= 0` means "never expires".
    fn session_expiration(&self) -> i64;

    /// Whether more than one concurrent token may be issued for this identity.
    fn multiple_sessions_allowed(&self) -> bool;
}

/// A human (or service) account: password-authenticated, with a persisted
/// permission map and an optional set of long-lived "steady tokens".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub password_hash: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub permissions: HashMap<String, bool>,
    /// Long-lived tokens persisted against the user for non-interactive access.
    pub steady_tokens: Vec<String>,
    /// `true` for service accounts: at most one session is ever allowed.
    pub is_service_identity: bool,
    pub session_expiration_secs: i64,
    #[serde(skip, default)]
    pub last_activity_millis: u64,
}

impl User {
    /// Deterministic, fixed-output, one-way password hash.
    ///
    /// Salted SHA-256: the spec only asks for a fixed-output one-way check,
    /// not brute-force-resistance tuning, so a KDF (argon2/scrypt) would be
    /// over-engineering relative to what's specified.
    #[must_use]
    pub fn hash_password(user_id: &str, password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(b":");
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }

    #[must_use]
    pub fn new(user_id: impl Into<String>, password: &str) -> Self {
        let user_id = user_id.into();
        let password_hash = Self::hash_password(&user_id, password);
        Self {
            user_id,
            password_hash,
            email: None,
            display_name: None,
            permissions: HashMap::new(),
            steady_tokens: Vec::new(),
            is_service_identity: false,
            session_expiration_secs: 1200,
            last_activity_millis: 0,
        }
    }

    #[must_use]
    pub fn check_password(&self, password: &str) -> bool {
        use subtle::ConstantTimeEq;
        let candidate = Self::hash_password(&self.user_id, password);
        candidate.as_bytes().ct_eq(self.password_hash.as_bytes()).into()
    }

    pub fn set_permission(&mut self, permission: impl Into<String>, granted: bool) {
        self.permissions.insert(permission.into(), granted);
    }
}

impl Identity for User {
    fn identity_id(&self) -> &str {
        &self.user_id
    }

    fn last_activity(&self) -> u64 {
        self.last_activity_millis
    }

    fn touch(&mut self, now_millis: u64) {
        self.last_activity_millis = now_millis;
    }

    fn is_authorized_to(&self, permission: &Permission) -> bool {
        self.permissions.get(permission).copied().unwrap_or(false)
    }

    fn session_expiration(&self) -> i64 {
        self.session_expiration_secs
    }

    fn multiple_sessions_allowed(&self) -> bool {
        !self.is_service_identity
    }
}

/// A device's own identity (distinct from the durable twin it backs).
/// `identity_id` is the device uuid; permissions are split between what the
/// device asked for at registration and what an administrator granted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_uuid: String,
    pub requested_permissions: Vec<String>,
    pub granted_permissions: HashMap<String, bool>,
    pub session_expiration_secs: i64,
    #[serde(skip, default)]
    pub last_activity_millis: u64,
}

impl DeviceIdentity {
    #[must_use]
    pub fn new(device_uuid: impl Into<String>) -> Self {
        Self {
            device_uuid: device_uuid.into(),
            requested_permissions: Vec::new(),
            granted_permissions: HashMap::new(),
            session_expiration_secs: 0,
            last_activity_millis: 0,
        }
    }
}

impl Identity for DeviceIdentity {
    fn identity_id(&self) -> &str {
        &self.device_uuid
    }

    fn last_activity(&self) -> u64 {
        self.last_activity_millis
    }

    fn touch(&mut self, now_millis: u64) {
        self.last_activity_millis = now_millis;
    }

    fn is_authorized_to(&self, permission: &Permission) -> bool {
        self.granted_permissions
            .get(permission)
            .copied()
            .unwrap_or(false)
    }

    fn session_expiration(&self) -> i64 {
        self.session_expiration_secs
    }

    fn multiple_sessions_allowed(&self) -> bool {
        true
    }
}
