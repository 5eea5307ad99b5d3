//! Persistence seam (spec §4.13, §6 "Persisted layout").
//!
//! `PersistedStore` is the only interface resources and device twins use to
//! survive a process restart. Concrete backends (in-memory, JSON-file) live
//! in the server crate; genuine database drivers are out of scope.

use async_trait::async_trait;
use serde_json::Value;

/// Loads, stores, and deletes a single JSON document keyed by its qualified
/// name (e.g. `home/admin/todo_synclist`, a twin's uuid, `config/users`).
#[async_trait]
pub trait PersistedStore: Send + Sync {
    async fn load(&self, key: &str) -> anyhow::Result<Option<Value>>;
    async fn store(&self, key: &str, document: &Value) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Document shape persisted for a device twin (spec §6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TwinDocument {
    pub properties: std::collections::HashMap<String, TwinPropertyDocument>,
    pub functions: Vec<crate::device::FunctionDescriptor>,
    #[serde(rename = "type")]
    pub device_type: String,
    pub last_online: u64,
    pub description: Option<String>,
    pub authkey: Option<u32>,
    pub enableauthkey: bool,
    #[serde(rename = "shortID")]
    pub short_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TwinPropertyDocument {
    pub val: Option<Value>,
    #[serde(rename = "setVal")]
    pub set_val: Option<Value>,
    pub timestamp: u64,
    pub dirty: bool,
    pub metadata: Option<Value>,
}

impl From<&crate::device::DeviceTwin> for TwinDocument {
    fn from(twin: &crate::device::DeviceTwin) -> Self {
        Self {
            properties: twin
                .properties
                .iter()
                .map(|(name, p)| {
                    (
                        name.clone(),
                        TwinPropertyDocument {
                            val: p.real_value.clone(),
                            set_val: p.set_value.clone(),
                            timestamp: p.timestamp,
                            dirty: p.dirty,
                            metadata: p.metadata.clone(),
                        },
                    )
                })
                .collect(),
            functions: twin.functions.clone(),
            device_type: twin.device_type.clone(),
            last_online: twin.last_online,
            description: twin.description.clone(),
            authkey: twin.auth_key,
            enableauthkey: twin.enable_secure_check,
            short_id: twin.short_id.clone(),
        }
    }
}

impl TwinDocument {
    /// Rehydrates a [`crate::device::DeviceTwin`] for the given uuid.
    #[must_use]
    pub fn into_twin(self, uuid: impl Into<String>) -> crate::device::DeviceTwin {
        use crate::device::{DeviceProperty, DeviceTwin};

        let mut twin = DeviceTwin::new(uuid);
        twin.device_type = self.device_type;
        twin.functions = self.functions;
        twin.last_online = self.last_online;
        twin.description = self.description;
        twin.auth_key = self.authkey;
        twin.enable_secure_check = self.enableauthkey;
        twin.short_id = self.short_id;
        twin.properties = self
            .properties
            .into_iter()
            .map(|(name, doc)| {
                (
                    name,
                    DeviceProperty {
                        real_value: doc.val,
                        set_value: doc.set_val,
                        dirty: doc.dirty,
                        timestamp: doc.timestamp,
                        metadata: doc.metadata,
                    },
                )
            })
            .collect();
        twin
    }
}

/// An in-memory store for tests and for single-process deployments that
/// don't need cross-restart persistence.
#[derive(Default)]
pub struct InMemoryStore {
    documents: std::sync::RwLock<std::collections::HashMap<String, Value>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistedStore for InMemoryStore {
    async fn load(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self
            .documents
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn store(&self, key: &str, document: &Value) -> anyhow::Result<()> {
        self.documents
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), document.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.documents
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// JSON-file-per-document backend: one file per qualified name under a
/// configurable storage root (spec §6 "Persisted layout", e.g.
/// `data/<qualifiedName>.json`).
pub struct FileStore {
    root: std::path::PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `root`. The directory is created lazily on
    /// first write, not here.
    #[must_use]
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> anyhow::Result<std::path::PathBuf> {
        if key.split('/').any(|segment| segment == "..") {
            anyhow::bail!("refusing to persist a key with a `..` path segment: {key}");
        }
        let mut path = self.root.join(key);
        path.set_extension("json");
        Ok(path)
    }
}

#[async_trait]
impl PersistedStore for FileStore {
    async fn load(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn store(&self, key: &str, document: &Value) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
