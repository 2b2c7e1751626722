//! Keyed cache of shared entities.
//!
//! [`ObjectCache`] guarantees at most one live entity per key. Lookups and insertions for all
//! keys go through one short critical section, and the factory runs inside it, so concurrent
//! `get_or_create` calls for the same key construct the entity exactly once.
//!
//! Entities decide their own validity through [`Entity::is_valid_and_dirty`]; an entity that
//! reports itself invalid is a cache miss on the next lookup and gets replaced.
use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Weak},
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use tracing::debug;

pub mod expirator;
pub use expirator::{ControlledObject, Expirator, ExpiratorState};

/// A shared domain object that can live in an [`ObjectCache`].
pub trait Entity: Send + Sync + 'static {
    /// Whether the entity may still be handed out. Logically deleted entities return false.
    fn is_valid_and_dirty(&self) -> bool {
        true
    }
}

/// An entity with a default way to build itself from its key.
pub trait KeyedEntity<K>: Entity + Sized {
    /// Runs under the lock of the cache asking for it, see [`ObjectCache::get_or_create`].
    fn create(key: &K) -> Arc<Self>;
}

/// How a cache holds its entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// The cache owns the entities.
    #[default]
    Strong,
    /// The cache only deduplicates entities somebody else keeps alive.
    Weak,
}

enum Slot<E> {
    Strong(Arc<E>),
    Weak(Weak<E>),
}

impl<E: Entity> Slot<E> {
    fn new(retention: Retention, entity: &Arc<E>) -> Self {
        match retention {
            Retention::Strong => Slot::Strong(entity.clone()),
            Retention::Weak => Slot::Weak(Arc::downgrade(entity)),
        }
    }

    fn live(&self) -> Option<Arc<E>> {
        let entity = match self {
            Slot::Strong(entity) => Some(entity.clone()),
            Slot::Weak(entity) => entity.upgrade(),
        };
        entity.filter(|entity| entity.is_valid_and_dirty())
    }
}

pub struct ObjectCache<K, E> {
    retention: Retention,
    entries: Mutex<HashMap<K, Slot<E>>>,
    keep_alive: Option<(Arc<Expirator>, Duration)>,
}

impl<K, E> Default for ObjectCache<K, E>
where
    K: Eq + Hash + Clone,
    E: Entity,
{
    fn default() -> Self {
        Self::new(Retention::default())
    }
}

impl<K, E> ObjectCache<K, E>
where
    K: Eq + Hash + Clone,
    E: Entity,
{
    pub fn new(retention: Retention) -> Self {
        ObjectCache {
            retention,
            entries: Mutex::new(HashMap::new()),
            keep_alive: None,
        }
    }

    pub fn strong() -> Self {
        Self::new(Retention::Strong)
    }

    pub fn weak() -> Self {
        Self::new(Retention::Weak)
    }

    /// Hands every entity this cache creates or receives to `expirator`, keeping it alive for
    /// at least `keep_alive` regardless of other owners.
    #[must_use]
    pub fn with_expirator(mut self, expirator: Arc<Expirator>, keep_alive: Duration) -> Self {
        self.keep_alive = Some((expirator, keep_alive));
        self
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    /// Returns the live entity for `key`, building it with `factory` on a miss.
    ///
    /// `factory` runs under the cache lock, so construction is serialized across all keys of
    /// this cache. It must not call back into the same cache: the lock is not reentrant and
    /// the call deadlocks. Resolve sub-entities from other caches only.
    pub fn get_or_create<F>(&self, key: &K, factory: F) -> Arc<E>
    where
        F: FnOnce(&K) -> Arc<E>,
    {
        let (entity, stale) = {
            let mut entries = self.entries.lock();
            if let Some(entity) = entries.get(key).and_then(Slot::live) {
                return entity;
            }
            let entity = factory(key);
            let stale = entries.insert(key.clone(), Slot::new(self.retention, &entity));
            (entity, stale)
        };
        if stale.is_some() {
            debug!("object cache replaced a stale entry");
        }
        drop(stale);
        self.extend_lifetime(&entity);
        entity
    }

    pub fn get_or_create_default(&self, key: &K) -> Arc<E>
    where
        E: KeyedEntity<K>,
    {
        self.get_or_create(key, E::create)
    }

    pub fn get(&self, key: &K) -> Option<Arc<E>> {
        self.entries.lock().get(key).and_then(Slot::live)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Stores `entity` under `key`, returning the live entity it replaced, if any.
    pub fn insert(&self, key: K, entity: Arc<E>) -> Option<Arc<E>> {
        let previous = self
            .entries
            .lock()
            .insert(key, Slot::new(self.retention, &entity));
        self.extend_lifetime(&entity);
        previous.and_then(|slot| slot.live())
    }

    pub fn remove(&self, key: &K) -> Option<Arc<E>> {
        let removed = self.entries.lock().remove(key);
        removed.and_then(|slot| slot.live())
    }

    /// Number of slots, including dead or invalid ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Keys of the live, valid entries.
    pub fn keys(&self) -> Vec<K> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, slot)| slot.live().is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        drop(entries);
        debug!("object cache cleared");
    }

    /// Drops dead weak slots and invalid entities. Returns how many slots were removed.
    pub fn purge(&self) -> usize {
        let purged: Vec<(K, Slot<E>)> = {
            let mut entries = self.entries.lock();
            let dead: Vec<K> = entries
                .iter()
                .filter(|(_, slot)| slot.live().is_none())
                .map(|(key, _)| key.clone())
                .collect();
            dead.into_iter()
                .filter_map(|key| entries.remove_entry(&key))
                .collect()
        };
        // Invalid strong entries are dropped here, outside the lock.
        purged.len()
    }

    fn extend_lifetime(&self, entity: &Arc<E>) {
        if let Some((expirator, keep_alive)) = &self.keep_alive {
            expirator.add_object(entity.clone(), SystemTime::now() + *keep_alive);
        }
    }
}
