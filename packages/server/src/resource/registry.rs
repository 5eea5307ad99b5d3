//! Resource registry: qualified-name -> live instance, at most one shared
//! instance per name, factory selection by longest descriptor-prefix match
//! (spec §4.4).

use std::sync::Arc;

use dashmap::DashMap;
use hub_core::{qualified_name, registry_key, HubError, ResourceType};

use super::instance::{ResourceInstance, ResourceKind};

/// Builds a fresh [`ResourceKind`] for a newly-created resource.
pub type ResourceBuilder = fn() -> ResourceKind;

/// One registered factory: the descriptor prefix it claims, whether the
/// resource it builds is dynamic (never cached), and the builder itself.
pub struct ResourceFactory {
    pub descriptor_prefix: &'static str,
    pub dynamic: bool,
    pub build: ResourceBuilder,
}

/// Registry of live resource instances, keyed by `<type>:<qualifiedName>`.
///
/// Holds weak-cache semantics only in spirit: instances are kept alive by
/// `Arc` strong references from attached subscriptions; when a resource's
/// member set empties the subscription layer calls [`Self::evict`] to drop
/// the registry's own reference (spec §4.4 "destruction signal").
pub struct ResourceRegistry {
    instances: DashMap<String, Arc<ResourceInstance>>,
    factories: DashMap<ResourceType, Vec<ResourceFactory>>,
    /// The instance each channel is currently attached to, per resource
    /// type, so a mutation that omits `descriptor` (as every scenario after
    /// the initial attach does) routes through the same instance the attach
    /// resolved rather than re-resolving an empty descriptor (spec §4.5,
    /// §5 "for every mutation broadcast, all subscribed channels observe
    /// it").
    bindings: DashMap<(String, ResourceType), String>,
}

impl ResourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            factories: DashMap::new(),
            bindings: DashMap::new(),
        }
    }

    /// Records that `channel_id` is now attached to `registry_key` for
    /// `resource_type`, replacing any previous binding for the same pair.
    pub fn bind(&self, channel_id: &str, resource_type: ResourceType, registry_key: &str) {
        self.bindings
            .insert((channel_id.to_string(), resource_type), registry_key.to_string());
    }

    /// Resolves the instance a channel most recently attached to for this
    /// resource type, if any.
    #[must_use]
    pub fn bound(&self, channel_id: &str, resource_type: ResourceType) -> Option<Arc<ResourceInstance>> {
        let key = self.bindings.get(&(channel_id.to_string(), resource_type))?;
        self.get(key.value())
    }

    pub fn unbind(&self, channel_id: &str, resource_type: ResourceType) {
        self.bindings.remove(&(channel_id.to_string(), resource_type));
    }

    /// Registers a factory for `resource_type`. Factories for the same type
    /// are tried longest-prefix-first at resolution time.
    pub fn register_factory(&self, resource_type: ResourceType, factory: ResourceFactory) {
        self.factories.entry(resource_type).or_default().push(factory);
    }

    /// Resolves or creates the instance for `(resource_type, descriptor)`
    /// owned by `owner_id` (spec §4.4 `getOrCreateResource`).
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownType`] if no factory matches.
    pub fn get_or_create(
        &self,
        resource_type: ResourceType,
        descriptor: &str,
        owner_id: &str,
    ) -> Result<Arc<ResourceInstance>, HubError> {
        let qualified = qualified_name(descriptor, owner_id);
        let key = registry_key(resource_type.command_prefix(), &qualified);

        if let Some(existing) = self.instances.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }

        let factory = self.select_factory(resource_type, descriptor)?;
        let state = (factory.build)();
        let instance = Arc::new(ResourceInstance::new(key.clone(), qualified, state, !factory.dynamic));

        if instance.cacheable {
            self.instances.insert(key, Arc::clone(&instance));
        }
        Ok(instance)
    }

    fn select_factory(
        &self,
        resource_type: ResourceType,
        descriptor: &str,
    ) -> Result<ResourceFactoryRef<'_>, HubError> {
        let factories = self.factories.get(&resource_type).ok_or(HubError::UnknownType)?;
        let best = factories
            .value()
            .iter()
            .filter(|f| descriptor.starts_with(f.descriptor_prefix))
            .max_by_key(|f| f.descriptor_prefix.len())
            .ok_or(HubError::UnknownType)?;
        Ok(ResourceFactoryRef {
            descriptor_prefix: best.descriptor_prefix,
            dynamic: best.dynamic,
            build: best.build,
        })
    }

    /// Drops the registry's strong reference once a resource's last
    /// subscriber detaches (spec §4.4 destruction signal).
    pub fn evict(&self, key: &str) {
        self.instances.remove(key);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<ResourceInstance>> {
        self.instances.get(key).map(|e| Arc::clone(e.value()))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.instances.len()
    }

    /// Detaches every channel attached under `token`, across every live
    /// instance, evicting any instance left empty (spec §4.8 step 5, forced
    /// session close).
    pub fn detach_all_by_token(&self, token: &str) {
        let mut emptied = Vec::new();
        for entry in &self.instances {
            entry.value().detach_by_token(token);
            if entry.value().is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for key in emptied {
            self.instances.remove(&key);
        }
    }

    /// Detaches `channel_id` from every live instance, evicting any instance
    /// left empty. Driven by transport disconnect (spec §5 "when a channel
    /// disconnects, all resources detach it").
    pub fn detach_all_by_channel(&self, channel_id: &str) {
        let mut emptied = Vec::new();
        for entry in &self.instances {
            entry.value().detach(channel_id);
            if entry.value().is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for key in emptied {
            self.instances.remove(&key);
        }
        self.bindings.retain(|(bound_channel, _), _| bound_channel != channel_id);
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A copied-out snapshot of a matched factory so the `DashMap` read guard
/// doesn't outlive `select_factory`.
struct ResourceFactoryRef<'a> {
    #[allow(dead_code)]
    descriptor_prefix: &'a str,
    dynamic: bool,
    build: ResourceBuilder,
}
