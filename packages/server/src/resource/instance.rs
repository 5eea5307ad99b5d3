//! A live resource instance: the core resource state plus the server-side
//! concerns the pure core types deliberately omit -- locking and
//! subscription membership (spec §4.4, §4.8).

use std::collections::HashMap;

use hub_core::{
    ImageCollectionResource, ListResource, ObjectResource, ResourceType, SettingsObjectResource,
    IS_ADMIN,
};
use parking_lot::RwLock;

use crate::session::AnyIdentity;

/// The core resource state a [`ResourceInstance`] wraps.
pub enum ResourceKind {
    List(ListResource),
    Object(ObjectResource),
    Settings(SettingsObjectResource),
    ImageCollection(ImageCollectionResource),
}

impl ResourceKind {
    #[must_use]
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::List(_) => ResourceType::SyncList,
            Self::Object(_) | Self::Settings(_) => ResourceType::Object,
            Self::ImageCollection(_) => ResourceType::ImageCollection,
        }
    }
}

/// One attached channel's membership record (spec §4.8 "membership").
#[derive(Debug, Clone)]
pub struct Subscription {
    pub token: Option<String>,
}

/// A registry-held resource: state, the set of attached channels, and
/// whether it is eligible for caching (dynamic resources are rebuilt fresh
/// per attach and never cached, spec §4.4 step 4).
pub struct ResourceInstance {
    pub registry_key: String,
    pub qualified_name: String,
    pub state: RwLock<ResourceKind>,
    pub members: RwLock<HashMap<String, Subscription>>,
    pub cacheable: bool,
}

impl ResourceInstance {
    #[must_use]
    pub fn new(registry_key: String, qualified_name: String, state: ResourceKind, cacheable: bool) -> Self {
        Self {
            registry_key,
            qualified_name,
            state: RwLock::new(state),
            members: RwLock::new(HashMap::new()),
            cacheable,
        }
    }

    /// Read gate (spec §4.6): every kind but `settings` (when not publicly
    /// readable) accepts any identity holding a valid token.
    #[must_use]
    pub fn can_read(&self, identity: Option<&AnyIdentity>) -> bool {
        match &*self.state.read() {
            ResourceKind::Settings(settings) => {
                settings.publicly_readable || identity.is_some()
            }
            _ => identity.is_some(),
        }
    }

    /// Write gate (spec §4.6): `settings` requires `is-admin`; everything
    /// else accepts any valid token.
    #[must_use]
    pub fn can_write(&self, identity: Option<&AnyIdentity>) -> bool {
        use hub_core::Identity;
        match &*self.state.read() {
            ResourceKind::Settings(_) => identity.is_some_and(|i| i.is_authorized_to(IS_ADMIN)),
            _ => identity.is_some(),
        }
    }

    /// True once no channel remains attached (spec §4.8 step 4).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn attach(&self, channel_id: &str, token: Option<String>) {
        self.members
            .write()
            .insert(channel_id.to_string(), Subscription { token });
    }

    pub fn detach(&self, channel_id: &str) {
        self.members.write().remove(channel_id);
    }

    /// Detaches every channel whose recorded token matches, returning their
    /// ids (spec §4.8 step 5, driven by `sessionClosed`).
    pub fn detach_by_token(&self, token: &str) -> Vec<String> {
        let mut members = self.members.write();
        let to_remove: Vec<String> = members
            .iter()
            .filter(|(_, sub)| sub.token.as_deref() == Some(token))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &to_remove {
            members.remove(id);
        }
        to_remove
    }

    #[must_use]
    pub fn member_ids(&self) -> Vec<String> {
        self.members.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_instance() -> ResourceInstance {
        ResourceInstance::new(
            "synclist:home/admin/todo".to_string(),
            "home/admin/todo".to_string(),
            ResourceKind::List(ListResource::new(false)),
            true,
        )
    }

    #[test]
    fn attach_and_detach_tracks_membership() {
        let instance = list_instance();
        assert!(instance.is_empty());
        instance.attach("C1", Some("tok".to_string()));
        assert!(!instance.is_empty());
        instance.detach("C1");
        assert!(instance.is_empty());
    }

    #[test]
    fn detach_by_token_removes_matching_channels_only() {
        let instance = list_instance();
        instance.attach("C1", Some("tokA".to_string()));
        instance.attach("C2", Some("tokB".to_string()));
        let removed = instance.detach_by_token("tokA");
        assert_eq!(removed, vec!["C1".to_string()]);
        assert_eq!(instance.member_ids(), vec!["C2".to_string()]);
    }

    #[test]
    fn non_settings_resource_allows_read_with_any_identity() {
        let instance = list_instance();
        assert!(!instance.can_read(None));
    }
}
