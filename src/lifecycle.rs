//! Revocable references and their owners
//!
//! Every buffer handed out for display (originals, previews, outputs, cache
//! entries) is exposed through an [`ObjectUrl`] created by the
//! [`ObjectUrlRegistry`]. The [`LifecycleManager`] records which task or
//! cache entry owns each reference and releases all of them exactly once
//! when the owner goes away.

use crate::cache::Fingerprint;
use crate::error::{PipelineError, Result};
use crate::types::TaskId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Opaque `blob:` style reference to an in-memory buffer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUrl(String);

impl ObjectUrl {
    fn generate() -> Self {
        Self(format!("blob:bgremove/{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Counters describing registry usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub created: usize,
    pub revoked: usize,
    pub live: usize,
}

/// Table of live object URLs
#[derive(Debug, Default)]
pub struct ObjectUrlRegistry {
    entries: Mutex<HashMap<ObjectUrl, Arc<Vec<u8>>>>,
    created: AtomicUsize,
    revoked: AtomicUsize,
}

impl ObjectUrlRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ObjectUrl, Arc<Vec<u8>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a reference to `data` without copying it
    pub fn create(&self, data: Arc<Vec<u8>>) -> ObjectUrl {
        let url = ObjectUrl::generate();
        self.entries().insert(url.clone(), data);
        self.created.fetch_add(1, Ordering::Relaxed);
        url
    }

    /// Look up the buffer behind a live reference
    #[must_use]
    pub fn resolve(&self, url: &ObjectUrl) -> Option<Arc<Vec<u8>>> {
        self.entries().get(url).cloned()
    }

    /// Revoke a reference
    ///
    /// # Errors
    /// - `AlreadyReleased` when the reference was revoked before or never existed
    pub fn revoke(&self, url: &ObjectUrl) -> Result<()> {
        if self.entries().remove(url).is_none() {
            return Err(PipelineError::AlreadyReleased(url.to_string()));
        }
        self.revoked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            created: self.created.load(Ordering::Relaxed),
            revoked: self.revoked.load(Ordering::Relaxed),
            live: self.live_count(),
        }
    }
}

/// Owner of a set of references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceOwner {
    Task(TaskId),
    Cache(Fingerprint),
}

impl fmt::Display for ResourceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(id) => write!(f, "{id}"),
            Self::Cache(fingerprint) => write!(f, "cache:{}", fingerprint.short()),
        }
    }
}

/// How long a reference lives relative to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefScope {
    /// Lives as long as the owner (original and preview renditions)
    Owner,
    /// Lives for one processing attempt (outputs)
    Attempt,
}

#[derive(Debug, Default)]
struct Ownership {
    refs: HashMap<ResourceOwner, Vec<(ObjectUrl, RefScope)>>,
    /// Owners retired since the last teardown
    retired: HashSet<ResourceOwner>,
}

/// Tracks reference ownership and releases references exactly once
#[derive(Debug, Default)]
pub struct LifecycleManager {
    registry: Arc<ObjectUrlRegistry>,
    ownership: Mutex<Ownership>,
}

impl LifecycleManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing registry
    #[must_use]
    pub fn with_registry(registry: Arc<ObjectUrlRegistry>) -> Self {
        Self {
            registry,
            ownership: Mutex::default(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ObjectUrlRegistry> {
        &self.registry
    }

    fn ownership(&self) -> MutexGuard<'_, Ownership> {
        self.ownership.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a reference for `data` and record it under `owner`
    ///
    /// Creation and registration happen under one lock so a concurrent
    /// `retire` cannot leave an unowned reference behind.
    ///
    /// # Errors
    /// - `Cancelled` when the owner has been retired
    pub fn allocate(&self, owner: ResourceOwner, scope: RefScope, data: Arc<Vec<u8>>) -> Result<ObjectUrl> {
        let mut ownership = self.ownership();
        if ownership.retired.contains(&owner) {
            return Err(PipelineError::cancelled(format!(
                "{owner} was released; refusing new reference"
            )));
        }
        let url = self.registry.create(data);
        ownership
            .refs
            .entry(owner)
            .or_default()
            .push((url.clone(), scope));
        Ok(url)
    }

    /// Record an externally created reference under `owner`
    ///
    /// # Errors
    /// - `Cancelled` when the owner has been retired; the reference is revoked
    pub fn register(&self, owner: ResourceOwner, scope: RefScope, url: ObjectUrl) -> Result<()> {
        let mut ownership = self.ownership();
        if ownership.retired.contains(&owner) {
            drop(ownership);
            self.revoke_logged(&url);
            return Err(PipelineError::cancelled(format!(
                "{owner} was released; refusing new reference"
            )));
        }
        ownership.refs.entry(owner).or_default().push((url, scope));
        Ok(())
    }

    /// Release references belonging to the owner's previous attempt
    ///
    /// Returns the number of references revoked.
    pub fn release_attempt(&self, owner: ResourceOwner) -> usize {
        let stale: Vec<ObjectUrl> = {
            let mut ownership = self.ownership();
            let Some(refs) = ownership.refs.get_mut(&owner) else {
                return 0;
            };
            let (stale, kept): (Vec<_>, Vec<_>) = refs
                .drain(..)
                .partition(|(_, scope)| *scope == RefScope::Attempt);
            *refs = kept;
            stale.into_iter().map(|(url, _)| url).collect()
        };
        self.revoke_all(owner, &stale)
    }

    /// Release every reference registered under `owner`
    ///
    /// The owner stays usable and may register new references afterwards.
    pub fn release_all(&self, owner: ResourceOwner) -> usize {
        let refs = self.ownership().refs.remove(&owner).unwrap_or_default();
        let urls: Vec<ObjectUrl> = refs.into_iter().map(|(url, _)| url).collect();
        self.revoke_all(owner, &urls)
    }

    /// Release every reference of `owner` and refuse future allocations
    pub fn retire(&self, owner: ResourceOwner) -> usize {
        let refs = {
            let mut ownership = self.ownership();
            ownership.retired.insert(owner);
            ownership.refs.remove(&owner).unwrap_or_default()
        };
        let urls: Vec<ObjectUrl> = refs.into_iter().map(|(url, _)| url).collect();
        self.revoke_all(owner, &urls)
    }

    /// Release everything, for session teardown
    ///
    /// Retirements are forgotten too; task ids are never reused, so a
    /// retired task cannot come back after teardown.
    pub fn release_everything(&self) -> usize {
        let all: Vec<(ResourceOwner, Vec<(ObjectUrl, RefScope)>)> = {
            let mut ownership = self.ownership();
            ownership.retired.clear();
            ownership.refs.drain().collect()
        };
        all.into_iter()
            .map(|(owner, refs)| {
                let urls: Vec<ObjectUrl> = refs.into_iter().map(|(url, _)| url).collect();
                self.revoke_all(owner, &urls)
            })
            .sum()
    }

    /// Number of references currently held by `owner`
    #[must_use]
    pub fn live_refs(&self, owner: ResourceOwner) -> usize {
        self.ownership().refs.get(&owner).map_or(0, Vec::len)
    }

    /// Number of owners retired since the last teardown
    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.ownership().retired.len()
    }

    /// Whether `owner` has been retired
    #[must_use]
    pub fn is_retired(&self, owner: ResourceOwner) -> bool {
        self.ownership().retired.contains(&owner)
    }

    fn revoke_all(&self, owner: ResourceOwner, urls: &[ObjectUrl]) -> usize {
        let released = urls.iter().filter(|url| self.revoke_logged(url)).count();
        if released > 0 {
            tracing::debug!(%owner, released, "released references");
        }
        released
    }

    fn revoke_logged(&self, url: &ObjectUrl) -> bool {
        match self.registry.revoke(url) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("{e}");
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> Arc<Vec<u8>> {
        Arc::new(vec![1, 2, 3, 4])
    }

    #[test]
    fn test_registry_create_resolve_revoke() {
        let registry = ObjectUrlRegistry::new();
        let payload = data();
        let url = registry.create(Arc::clone(&payload));

        assert!(url.as_str().starts_with("blob:bgremove/"));
        let resolved = registry.resolve(&url).unwrap();
        assert!(Arc::ptr_eq(&resolved, &payload));

        registry.revoke(&url).unwrap();
        assert!(registry.resolve(&url).is_none());
        let err = registry.revoke(&url).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyReleased(_)));

        let stats = registry.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.revoked, 1);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn test_release_all_releases_each_reference_once() {
        let lifecycle = LifecycleManager::new();
        let owner = ResourceOwner::Task(TaskId(1));
        lifecycle.allocate(owner, RefScope::Owner, data()).unwrap();
        lifecycle.allocate(owner, RefScope::Attempt, data()).unwrap();

        assert_eq!(lifecycle.live_refs(owner), 2);
        assert_eq!(lifecycle.release_all(owner), 2);
        assert_eq!(lifecycle.release_all(owner), 0);
        assert_eq!(lifecycle.registry().live_count(), 0);
        assert_eq!(lifecycle.registry().stats().revoked, 2);
    }

    #[test]
    fn test_release_attempt_keeps_owner_scoped_refs() {
        let lifecycle = LifecycleManager::new();
        let owner = ResourceOwner::Task(TaskId(2));
        let display = lifecycle.allocate(owner, RefScope::Owner, data()).unwrap();
        let output = lifecycle.allocate(owner, RefScope::Attempt, data()).unwrap();

        assert_eq!(lifecycle.release_attempt(owner), 1);
        assert!(lifecycle.registry().resolve(&display).is_some());
        assert!(lifecycle.registry().resolve(&output).is_none());
        assert_eq!(lifecycle.live_refs(owner), 1);
    }

    #[test]
    fn test_retired_owner_refuses_allocation() {
        let lifecycle = LifecycleManager::new();
        let owner = ResourceOwner::Task(TaskId(3));
        lifecycle.allocate(owner, RefScope::Owner, data()).unwrap();

        assert_eq!(lifecycle.retire(owner), 1);
        assert!(lifecycle.is_retired(owner));
        let err = lifecycle
            .allocate(owner, RefScope::Attempt, data())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(_)));
        assert_eq!(lifecycle.registry().live_count(), 0);
    }

    #[test]
    fn test_register_on_retired_owner_revokes_reference() {
        let lifecycle = LifecycleManager::new();
        let owner = ResourceOwner::Task(TaskId(4));
        lifecycle.retire(owner);

        let url = lifecycle.registry().create(data());
        assert!(lifecycle.register(owner, RefScope::Owner, url.clone()).is_err());
        assert!(lifecycle.registry().resolve(&url).is_none());
    }

    #[test]
    fn test_release_everything() {
        let lifecycle = LifecycleManager::new();
        for id in 0..4 {
            lifecycle
                .allocate(ResourceOwner::Task(TaskId(id)), RefScope::Owner, data())
                .unwrap();
        }
        lifecycle
            .allocate(
                ResourceOwner::Cache(Fingerprint::of(b"x")),
                RefScope::Owner,
                data(),
            )
            .unwrap();

        assert_eq!(lifecycle.release_everything(), 5);
        assert_eq!(lifecycle.registry().live_count(), 0);
    }

    #[test]
    fn test_release_everything_forgets_retired_owners() {
        let lifecycle = LifecycleManager::new();
        for id in 0..3 {
            let owner = ResourceOwner::Task(TaskId(id));
            lifecycle.allocate(owner, RefScope::Owner, data()).unwrap();
            lifecycle.retire(owner);
        }
        assert!(lifecycle.is_retired(ResourceOwner::Task(TaskId(1))));
        assert_eq!(lifecycle.retired_count(), 3);

        lifecycle.release_everything();

        assert_eq!(lifecycle.retired_count(), 0);
        assert!(!lifecycle.is_retired(ResourceOwner::Task(TaskId(1))));
    }
}
