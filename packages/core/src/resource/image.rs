//! Image-collection resource (spec §3 "Image collection", §4.7).
//!
//! Blob storage is opaque to this module: the blob bytes are handed to the
//! persistence seam unexamined and returned unexamined.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEntry {
    pub metadata: Value,
    #[serde(with = "serde_bytes_as_base64")]
    pub blob: Vec<u8>,
}

/// Mapping image-uid → `{metadata, blob}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageCollectionResource {
    images: HashMap<String, ImageEntry>,
}

impl ImageCollectionResource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uid: &str, image: Vec<u8>, metadata: Value) {
        self.images.insert(
            uid.to_string(),
            ImageEntry {
                metadata,
                blob: image,
            },
        );
    }

    pub fn delete_image(&mut self, uid: &str) -> Result<(), HubError> {
        self.images.remove(uid).map(|_| ()).ok_or(HubError::UnknownItem)
    }

    #[must_use]
    pub fn all_metadata(&self) -> HashMap<String, Value> {
        self.images
            .iter()
            .map(|(uid, entry)| (uid.clone(), entry.metadata.clone()))
            .collect()
    }

    #[must_use]
    pub fn image(&self, uid: &str) -> Option<&[u8]> {
        self.images.get(uid).map(|e| e.blob.as_slice())
    }

    #[must_use]
    pub fn meta_data(&self, uid: &str) -> Option<&Value> {
        self.images.get(uid).map(|e| &e.metadata)
    }
}

/// Serializes `Vec<u8>` blobs as base64 strings so the persisted JSON
/// document stays human-inspectable text rather than a numeric array.
mod serde_bytes_as_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_fetch_roundtrip() {
        let mut coll = ImageCollectionResource::new();
        coll.insert("img1", vec![1, 2, 3], Value::from("thumb"));
        assert_eq!(coll.image("img1"), Some(&[1u8, 2, 3][..]));
        assert_eq!(coll.meta_data("img1"), Some(&Value::from("thumb")));
    }

    #[test]
    fn delete_unknown_image_errors() {
        let mut coll = ImageCollectionResource::new();
        assert!(matches!(coll.delete_image("nope"), Err(HubError::UnknownItem)));
    }

    #[test]
    fn all_metadata_covers_every_entry() {
        let mut coll = ImageCollectionResource::new();
        coll.insert("a", vec![], Value::Null);
        coll.insert("b", vec![], Value::Null);
        assert_eq!(coll.all_metadata().len(), 2);
    }
}
