//! Qualified-name derivation (spec §3 "Resource").
//!
//! A resource is addressed by `(type, qualifiedName)`. The qualified name is
//! the client-supplied descriptor, except that descriptors rooted at
//! `home/` have the owner's identity id spliced in right after `home/` --
//! this is what lets every user's `home/todo` resolve to a private
//! `home/<identityID>/todo` instance while still sharing one descriptor
//! string across all clients.

const HOME_PREFIX: &str = "home/";

/// Computes the qualified name for a descriptor, splicing in `owner_id`
/// for `home/`-rooted descriptors.
#[must_use]
pub fn qualified_name(descriptor: &str, owner_id: &str) -> String {
    if let Some(rest) = descriptor.strip_prefix(HOME_PREFIX) {
        format!("{HOME_PREFIX}{owner_id}/{rest}")
    } else {
        descriptor.to_string()
    }
}

/// The full registry key: `<type>:<qualifiedName>` so the same qualified
/// name does not collide across resource types.
#[must_use]
pub fn registry_key(resource_type: &str, qualified: &str) -> String {
    format!("{resource_type}:{qualified}")
}
