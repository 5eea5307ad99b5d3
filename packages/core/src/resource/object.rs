//! Synchronized object (key/value) resource (spec §3 "Object resource", §4.6).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubError;

/// One property's value plus its provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectProperty {
    pub data: Value,
    pub userid: String,
    pub lastupdate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDelta {
    pub name: String,
    pub property: ObjectProperty,
}

/// Mapping property-name → `{data, userid, lastupdate}`, plus optional
/// object-level metadata. `lastupdate` is enforced monotonic per property.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectResource {
    pub properties: HashMap<String, ObjectProperty>,
    pub metadata: Option<Value>,
}

impl ObjectResource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one property. Rejects updates whose `lastupdate` would move
    /// backwards relative to the stored value (monotonicity invariant);
    /// since the server always calls this with the current clock, this only
    /// guards against a server clock ever going backwards.
    pub fn set_property(
        &mut self,
        name: &str,
        value: Value,
        userid: &str,
        now_millis: u64,
    ) -> Result<ObjectDelta, HubError> {
        if let Some(existing) = self.properties.get(name) {
            if now_millis < existing.lastupdate {
                return Err(HubError::InvalidData(
                    "lastupdate must be monotonic per property".to_string(),
                ));
            }
        }
        let property = ObjectProperty {
            data: value,
            userid: userid.to_string(),
            lastupdate: now_millis,
        };
        self.properties.insert(name.to_string(), property.clone());
        Ok(ObjectDelta {
            name: name.to_string(),
            property,
        })
    }

    pub fn set_metadata(&mut self, metadata: Value) {
        self.metadata = Some(metadata);
    }

    #[must_use]
    pub fn object_data(&self) -> &HashMap<String, ObjectProperty> {
        &self.properties
    }

    #[must_use]
    pub fn meta_data(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }
}

/// Gate applied on top of a base `ObjectResource` by the `settings`
/// specialization (spec §4.6): writes require `is-admin`; reads are gated
/// on a `publicly_readable` flag rather than always being open.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsObjectResource {
    pub inner: ObjectResource,
    pub publicly_readable: bool,
}

impl SettingsObjectResource {
    #[must_use]
    pub fn new(publicly_readable: bool) -> Self {
        Self {
            inner: ObjectResource::new(),
            publicly_readable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_property_records_userid_and_lastupdate() {
        let mut obj = ObjectResource::new();
        let delta = obj
            .set_property("brightness", Value::from(80), "admin", 1000)
            .unwrap();
        assert_eq!(delta.name, "brightness");
        assert_eq!(delta.property.userid, "admin");
        assert_eq!(obj.properties.len(), 1);
    }

    #[test]
    fn property_names_are_unique_last_write_wins() {
        let mut obj = ObjectResource::new();
        obj.set_property("x", Value::from(1), "a", 1).unwrap();
        obj.set_property("x", Value::from(2), "a", 2).unwrap();
        assert_eq!(obj.properties.len(), 1);
        assert_eq!(obj.properties["x"].data, Value::from(2));
    }

    #[test]
    fn lastupdate_must_be_monotonic() {
        let mut obj = ObjectResource::new();
        obj.set_property("x", Value::from(1), "a", 100).unwrap();
        let err = obj.set_property("x", Value::from(2), "a", 50).unwrap_err();
        assert!(matches!(err, HubError::InvalidData(_)));
    }

    #[test]
    fn settings_object_defaults_to_private() {
        let settings = SettingsObjectResource::new(false);
        assert!(!settings.publicly_readable);
    }
}
