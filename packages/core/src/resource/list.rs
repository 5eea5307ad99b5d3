//! Synchronized list resource (spec §3 "List resource", §4.5).
//!
//! Pure in-memory state with `&mut self` mutators; no locking here -- the
//! server wraps an instance the same way the teacher crate wraps its `HLC`
//! in an external `Mutex`. Structural errors (`UnknownItem`,
//! `InvalidParameters`) are raised here; permission and storage failures are
//! the caller's concern (gate-checked, or raised by the persistence seam,
//! before/after this state is touched).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::HubError;

/// A single list entry. `uuid` is server-assigned and is the authoritative
/// identity of the item -- index positions shift as the list mutates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListItem {
    pub uuid: String,
    pub timestamp: u64,
    pub userid: String,
    pub lastupdate: u64,
    pub data: Value,
}

/// The delta produced by a successful mutation, forwarded verbatim as the
/// server→clients broadcast payload (spec §4.8 "delta protocol").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ListDelta {
    Append { item: ListItem },
    InsertAt { index: usize, item: ListItem },
    AppendList { items: Vec<ListItem> },
    Remove { index: usize, uuid: String },
    Clear,
    Delete,
    Set { index: usize, item: ListItem },
    SetProperty {
        index: usize,
        uuid: String,
        property: String,
        data: Value,
        lastupdate: u64,
    },
    SetMetadata { metadata: Value },
}

/// Synchronized, ordered list of opaque items plus optional list-level metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResource {
    pub items: Vec<ListItem>,
    pub metadata: Option<Value>,
    /// Dynamic (per-subscriber, uncached) lists may accept `setFilter`.
    pub dynamic: bool,
}

impl ListResource {
    #[must_use]
    pub fn new(dynamic: bool) -> Self {
        Self {
            items: Vec::new(),
            metadata: None,
            dynamic,
        }
    }

    /// Resolves an `(index, uuid)` pair per the tie-break rule in §4.5:
    /// use `index` if it agrees with the current layout, else search by
    /// `uuid`. Returns `None` (→ `UnknownItem`) if neither resolves.
    #[must_use]
    pub fn resolve(&self, index: usize, uuid: &str) -> Option<usize> {
        if self.items.get(index).is_some_and(|it| it.uuid == uuid) {
            return Some(index);
        }
        self.items.iter().position(|it| it.uuid == uuid)
    }

    pub fn append(&mut self, data: Value, userid: &str, now_millis: u64) -> ListDelta {
        let item = ListItem {
            uuid: Uuid::new_v4().to_string(),
            timestamp: now_millis,
            userid: userid.to_string(),
            lastupdate: now_millis,
            data,
        };
        self.items.push(item.clone());
        ListDelta::Append { item }
    }

    pub fn insert_at(
        &mut self,
        data: Value,
        index: usize,
        userid: &str,
        now_millis: u64,
    ) -> ListDelta {
        let item = ListItem {
            uuid: Uuid::new_v4().to_string(),
            timestamp: now_millis,
            userid: userid.to_string(),
            lastupdate: now_millis,
            data,
        };
        if index >= self.items.len() {
            self.items.push(item.clone());
            return ListDelta::Append { item };
        }
        self.items.insert(index, item.clone());
        ListDelta::InsertAt { index, item }
    }

    pub fn append_list(&mut self, data_list: Vec<Value>, userid: &str, now_millis: u64) -> ListDelta {
        let items: Vec<ListItem> = data_list
            .into_iter()
            .map(|data| ListItem {
                uuid: Uuid::new_v4().to_string(),
                timestamp: now_millis,
                userid: userid.to_string(),
                lastupdate: now_millis,
                data,
            })
            .collect();
        self.items.extend(items.clone());
        ListDelta::AppendList { items }
    }

    pub fn remove(&mut self, index: usize, uuid: &str) -> Result<ListDelta, HubError> {
        let resolved = self.resolve(index, uuid).ok_or(HubError::UnknownItem)?;
        let removed = self.items.remove(resolved);
        Ok(ListDelta::Remove {
            index: resolved,
            uuid: removed.uuid,
        })
    }

    pub fn clear(&mut self) -> ListDelta {
        self.items.clear();
        ListDelta::Clear
    }

    pub fn delete(&mut self) -> ListDelta {
        self.items.clear();
        self.metadata = None;
        ListDelta::Delete
    }

    pub fn set(
        &mut self,
        data: Value,
        index: usize,
        uuid: &str,
        userid: &str,
        now_millis: u64,
    ) -> Result<ListDelta, HubError> {
        let resolved = self.resolve(index, uuid).ok_or(HubError::UnknownItem)?;
        let item = &mut self.items[resolved];
        item.data = data;
        item.userid = userid.to_string();
        item.lastupdate = now_millis;
        Ok(ListDelta::Set {
            index: resolved,
            item: item.clone(),
        })
    }

    pub fn set_property(
        &mut self,
        name: &str,
        value: Value,
        index: usize,
        uuid: &str,
        now_millis: u64,
    ) -> Result<ListDelta, HubError> {
        let resolved = self.resolve(index, uuid).ok_or(HubError::UnknownItem)?;
        let item = &mut self.items[resolved];
        match item.data.as_object_mut() {
            Some(map) => {
                map.insert(name.to_string(), value.clone());
            }
            None => {
                let mut map = serde_json::Map::new();
                map.insert(name.to_string(), value.clone());
                item.data = Value::Object(map);
            }
        }
        item.lastupdate = now_millis;
        Ok(ListDelta::SetProperty {
            index: resolved,
            uuid: item.uuid.clone(),
            property: name.to_string(),
            data: value,
            lastupdate: now_millis,
        })
    }

    pub fn set_metadata(&mut self, metadata: Value) -> ListDelta {
        self.metadata = Some(metadata.clone());
        ListDelta::SetMetadata { metadata }
    }

    pub fn set_filter(&mut self) -> Result<(), HubError> {
        if self.dynamic {
            Ok(())
        } else {
            Err(HubError::InvalidParameters(
                "setFilter is only supported on dynamic resources".to_string(),
            ))
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Threshold above which the subscription handler prefers `init` +
    /// paged `get` over a full `dump` (spec §4.8: "count > 0 and ... 1").
    pub const LARGE_LIST_THRESHOLD: usize = 1;

    #[must_use]
    pub fn page(&self, from: usize, count: usize) -> &[ListItem] {
        let end = (from + count).min(self.items.len());
        if from >= self.items.len() {
            &[]
        } else {
            &self.items[from..end]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_uuid_and_timestamps() {
        let mut list = ListResource::new(false);
        let delta = list.append(Value::String("milk".into()), "admin", 1000);
        match delta {
            ListDelta::Append { item } => {
                assert!(!item.uuid.is_empty());
                assert_eq!(item.timestamp, 1000);
                assert_eq!(item.userid, "admin");
            }
            _ => panic!("wrong delta"),
        }
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn uuids_are_unique_within_a_list() {
        let mut list = ListResource::new(false);
        list.append(Value::Null, "a", 1);
        list.append(Value::Null, "a", 2);
        let ids: std::collections::HashSet<_> = list.items.iter().map(|i| &i.uuid).collect();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn insert_at_beyond_end_appends() {
        let mut list = ListResource::new(false);
        let delta = list.insert_at(Value::Null, 50, "a", 1);
        assert!(matches!(delta, ListDelta::Append { .. }));
    }

    #[test]
    fn insert_at_middle_shifts_items() {
        let mut list = ListResource::new(false);
        list.append(Value::from(1), "a", 1);
        list.append(Value::from(2), "a", 1);
        list.insert_at(Value::from(99), 1, "a", 1);
        assert_eq!(list.items[1].data, Value::from(99));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn remove_by_uuid_when_index_is_stale() {
        let mut list = ListResource::new(false);
        list.append(Value::from(1), "a", 1);
        list.append(Value::from(2), "a", 1);
        let uuid = list.items[0].uuid.clone();
        // index 1 does not hold this uuid; uuid must still resolve it.
        let delta = list.remove(1, &uuid).unwrap();
        match delta {
            ListDelta::Remove { index, .. } => assert_eq!(index, 0),
            _ => panic!("wrong delta"),
        }
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn remove_unknown_uuid_errors() {
        let mut list = ListResource::new(false);
        list.append(Value::Null, "a", 1);
        let err = list.remove(0, "nonexistent").unwrap_err();
        assert!(matches!(err, HubError::UnknownItem));
    }

    #[test]
    fn clear_keeps_metadata_delete_removes_it() {
        let mut list = ListResource::new(false);
        list.append(Value::Null, "a", 1);
        list.set_metadata(Value::from("meta"));
        list.clear();
        assert!(list.is_empty());
        assert!(list.metadata.is_some());

        list.append(Value::Null, "a", 1);
        list.delete();
        assert!(list.is_empty());
        assert!(list.metadata.is_none());
    }

    #[test]
    fn set_property_merges_into_existing_object() {
        let mut list = ListResource::new(false);
        list.append(serde_json::json!({"title": "milk"}), "a", 1);
        let uuid = list.items[0].uuid.clone();
        list.set_property("done", Value::Bool(true), 0, &uuid, 2).unwrap();
        assert_eq!(list.items[0].data["done"], Value::Bool(true));
        assert_eq!(list.items[0].lastupdate, 2);
    }

    #[test]
    fn set_filter_rejected_on_non_dynamic_list() {
        let mut list = ListResource::new(false);
        assert!(list.set_filter().is_err());
    }

    #[test]
    fn set_filter_allowed_on_dynamic_list() {
        let mut list = ListResource::new(true);
        assert!(list.set_filter().is_ok());
    }

    #[test]
    fn page_returns_requested_slice() {
        let mut list = ListResource::new(false);
        for i in 0..5 {
            list.append(Value::from(i), "a", 1);
        }
        let page = list.page(2, 2);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].data, Value::from(2));
    }
}
