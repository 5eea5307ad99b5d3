//! Collaborator seams: interfaces the server depends on but does not fully
//! implement (spec §1 "Out of scope ... modeled as trait seams").

use async_trait::async_trait;

/// Looks up whether a newer firmware image is available for a device type.
///
/// No concrete HTTP client against an external firmware index is provided
/// here -- that lookup is explicitly out of scope. A deployment wires in its
/// own implementation (e.g. an HTTP client hitting a vendor index).
#[async_trait]
pub trait FirmwareLookup: Send + Sync {
    /// Returns the latest known firmware version for `device_type`, encoded
    /// as `major * 1000 + minor` to match [`hub_core::DeviceTwin::firmware_version`].
    async fn latest_version(&self, device_type: &str) -> anyhow::Result<Option<u32>>;
}

/// A [`FirmwareLookup`] that never reports an update available. Used when no
/// `FIRMWARE_UPDATE_LOOKUP` endpoint is configured (spec §4.12).
pub struct NoFirmwareLookup;

#[async_trait]
impl FirmwareLookup for NoFirmwareLookup {
    async fn latest_version(&self, _device_type: &str) -> anyhow::Result<Option<u32>> {
        Ok(None)
    }
}

/// Per-device-type permission checker consulted before a client write to a
/// device property is accepted (spec §4.9 "Client writes to a property").
///
/// Optional: a device type with no registered checker allows any write from
/// a caller that already holds a valid session token.
pub trait PermissionChecker: Send + Sync {
    fn can_write_property(&self, device_type: &str, property: &str, permissions: &[String]) -> bool;
}

/// A [`PermissionChecker`] that allows every write. The default when a
/// device type has no stricter policy registered.
pub struct AllowAll;

impl PermissionChecker for AllowAll {
    fn can_write_property(&self, _device_type: &str, _property: &str, _permissions: &[String]) -> bool {
        true
    }
}
