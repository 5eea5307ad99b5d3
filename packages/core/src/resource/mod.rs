//! Resource kinds: synchronized list, synchronized object, image collection.
//!
//! Each submodule holds pure in-memory state with `&mut self` mutators; the
//! server crate's resource registry and subscription handler own the
//! locking, caching, and fan-out built on top.

pub mod image;
pub mod list;
pub mod object;

pub use image::ImageCollectionResource;
pub use list::{ListDelta, ListItem, ListResource};
pub use object::{ObjectDelta, ObjectProperty, ObjectResource, SettingsObjectResource};

/// The resource type namespace a descriptor is attached under, as used in
/// `<type>:attach` command prefixes (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    SyncList,
    Object,
    ImageCollection,
    Device,
}

impl ResourceType {
    #[must_use]
    pub fn command_prefix(self) -> &'static str {
        match self {
            Self::SyncList => "synclist",
            Self::Object => "object",
            Self::ImageCollection => "imgcoll",
            Self::Device => "device",
        }
    }

    #[must_use]
    pub fn from_command_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "synclist" | "list" => Some(Self::SyncList),
            "object" => Some(Self::Object),
            "imgcoll" => Some(Self::ImageCollection),
            "device" => Some(Self::Device),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_roundtrip() {
        for ty in [
            ResourceType::SyncList,
            ResourceType::Object,
            ResourceType::ImageCollection,
            ResourceType::Device,
        ] {
            let prefix = ty.command_prefix();
            assert_eq!(ResourceType::from_command_prefix(prefix), Some(ty));
        }
    }

    #[test]
    fn legacy_list_alias_maps_to_synclist() {
        assert_eq!(
            ResourceType::from_command_prefix("list"),
            Some(ResourceType::SyncList)
        );
    }
}
