//! Rebinding of sub-entity references through the [`ObjectCache`].
//!
//! A composite entity refers to shared sub-entities either weakly, through a [`WeakField`], or
//! strongly, through an `Option<Arc<E>>`. Every access re-validates the reference against the
//! key the caller currently wants: a dead, invalid or differently keyed reference is replaced by
//! the cache's entity for that key, and subscribers of the field's [`ChangeNotifier`] hear about
//! the new entity when its identity actually changed.
use std::{
    fmt,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;

use crate::cache::{Entity, KeyedEntity, ObjectCache};

/// A weak reference to a sub-entity together with the key it was last resolved for.
pub struct WeakField<K, E> {
    entity: Weak<E>,
    key: Option<K>,
}

impl<K, E> Default for WeakField<K, E> {
    fn default() -> Self {
        WeakField {
            entity: Weak::new(),
            key: None,
        }
    }
}

impl<K: fmt::Debug, E> fmt::Debug for WeakField<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakField")
            .field("key", &self.key)
            .field("alive", &(self.entity.strong_count() > 0))
            .finish()
    }
}

impl<K, E> WeakField<K, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key of the last resolution, if the field was ever resolved.
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    /// The referenced entity, if it is still alive. Does not re-validate.
    pub fn get(&self) -> Option<Arc<E>> {
        self.entity.upgrade()
    }
}

pub type ChangeObserver<E> = Arc<dyn Fn(&Arc<E>) + Send + Sync>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Observer list fired when a field is rebound to a different entity.
pub struct ChangeNotifier<E> {
    next_id: AtomicU64,
    observers: Mutex<Vec<(SubscriptionId, ChangeObserver<E>)>>,
}

impl<E> Default for ChangeNotifier<E> {
    fn default() -> Self {
        ChangeNotifier {
            next_id: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl<E> ChangeNotifier<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&Arc<E>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(subscribed, _)| *subscribed != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.lock().is_empty()
    }

    /// Calls every observer with `entity`. Observers run outside the list lock and may
    /// (un)subscribe.
    pub fn notify(&self, entity: &Arc<E>) {
        let observers: Vec<ChangeObserver<E>> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer(entity);
        }
    }
}

/// Resolves a weakly held sub-entity for `key`.
///
/// The stored reference is kept when it is alive, valid and `key_of` still yields `key`.
/// Otherwise the entity is fetched from `cache` (built by `factory` on a miss) and stored. The
/// notifier fires only when the key differs from the previous one; re-validating an invalid or
/// dropped entity under the same key is silent. `key_of` is only called on live entities, the
/// stored key stands in for a dropped one.
pub fn resolve_weak_field<K, E, F>(
    field: &mut WeakField<K, E>,
    key: &K,
    cache: &ObjectCache<K, E>,
    key_of: impl Fn(&E) -> K,
    notifier: &ChangeNotifier<E>,
    factory: F,
) -> Arc<E>
where
    K: Eq + Hash + Clone,
    E: Entity,
    F: FnOnce(&K) -> Arc<E>,
{
    let current = field.entity.upgrade();
    let previous_key = match &current {
        Some(entity) => Some(key_of(entity)),
        None => field.key.clone(),
    };
    let key_changed = previous_key.as_ref() != Some(key);

    match current {
        Some(entity) if !key_changed && entity.is_valid_and_dirty() => entity,
        _ => {
            let entity = cache.get_or_create(key, factory);
            field.entity = Arc::downgrade(&entity);
            field.key = Some(key_of(&entity));
            if key_changed {
                notifier.notify(&entity);
            }
            entity
        }
    }
}

pub fn resolve_weak_field_default<K, E>(
    field: &mut WeakField<K, E>,
    key: &K,
    cache: &ObjectCache<K, E>,
    key_of: impl Fn(&E) -> K,
    notifier: &ChangeNotifier<E>,
) -> Arc<E>
where
    K: Eq + Hash + Clone,
    E: KeyedEntity<K>,
{
    resolve_weak_field(field, key, cache, key_of, notifier, E::create)
}

/// Resolves a strongly held sub-entity for `key`.
///
/// Same comparison as [`resolve_weak_field`], but every replacement is announced.
pub fn resolve_strong_field<K, E, F>(
    field: &mut Option<Arc<E>>,
    key: &K,
    cache: &ObjectCache<K, E>,
    key_of: impl Fn(&E) -> K,
    notifier: &ChangeNotifier<E>,
    factory: F,
) -> Arc<E>
where
    K: Eq + Hash + Clone,
    E: Entity,
    F: FnOnce(&K) -> Arc<E>,
{
    if let Some(entity) = field
        .as_ref()
        .filter(|entity| entity.is_valid_and_dirty() && key_of(entity) == *key)
    {
        return entity.clone();
    }
    let entity = cache.get_or_create(key, factory);
    *field = Some(entity.clone());
    notifier.notify(&entity);
    entity
}

pub fn resolve_strong_field_default<K, E>(
    field: &mut Option<Arc<E>>,
    key: &K,
    cache: &ObjectCache<K, E>,
    key_of: impl Fn(&E) -> K,
    notifier: &ChangeNotifier<E>,
) -> Arc<E>
where
    K: Eq + Hash + Clone,
    E: KeyedEntity<K>,
{
    resolve_strong_field(field, key, cache, key_of, notifier, E::create)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    struct User {
        id: u32,
        valid: AtomicBool,
    }

    impl Entity for User {
        fn is_valid_and_dirty(&self) -> bool {
            self.valid.load(Ordering::SeqCst)
        }
    }

    impl KeyedEntity<u32> for User {
        fn create(key: &u32) -> Arc<Self> {
            Arc::new(User {
                id: *key,
                valid: AtomicBool::new(true),
            })
        }
    }

    fn user_id(user: &User) -> u32 {
        user.id
    }

    fn recording_notifier() -> (ChangeNotifier<User>, Arc<Mutex<Vec<u32>>>) {
        let notifier = ChangeNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        notifier.subscribe(move |user: &Arc<User>| s.lock().push(user.id));
        (notifier, seen)
    }

    #[test]
    fn test_weak_field_notifies_on_key_change_only() {
        let cache = ObjectCache::<u32, User>::strong();
        let (notifier, seen) = recording_notifier();
        let mut author = WeakField::new();

        let a = resolve_weak_field_default(&mut author, &1, &cache, user_id, &notifier);
        assert_eq!(vec![1], *seen.lock());

        let again = resolve_weak_field_default(&mut author, &1, &cache, user_id, &notifier);
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(1, seen.lock().len());

        let b = resolve_weak_field_default(&mut author, &2, &cache, user_id, &notifier);
        assert_eq!(2, b.id);
        assert_eq!(vec![1, 2], *seen.lock());
        assert_eq!(Some(&2), author.key());

        resolve_weak_field_default(&mut author, &2, &cache, user_id, &notifier);
        assert_eq!(2, seen.lock().len());
    }

    #[test]
    fn test_weak_field_revalidates_silently() {
        let cache = ObjectCache::<u32, User>::strong();
        let (notifier, seen) = recording_notifier();
        let mut author = WeakField::new();

        let first = resolve_weak_field_default(&mut author, &1, &cache, user_id, &notifier);
        first.valid.store(false, Ordering::SeqCst);
        let second = resolve_weak_field_default(&mut author, &1, &cache, user_id, &notifier);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &author.get().unwrap()));
        assert_eq!(vec![1], *seen.lock());
    }

    #[test]
    fn test_weak_field_never_inspects_dropped_entity() {
        let cache = ObjectCache::<u32, User>::weak();
        let (notifier, seen) = recording_notifier();
        let mut author = WeakField::new();

        drop(resolve_weak_field_default(&mut author, &4, &cache, user_id, &notifier));
        assert!(author.get().is_none());

        // The stored key stands in for the dropped entity: same key, no notification.
        let built = AtomicU64::new(0);
        let user = resolve_weak_field(
            &mut author,
            &4,
            &cache,
            |user: &User| {
                assert!(user.is_valid_and_dirty());
                user.id
            },
            &notifier,
            |key| {
                built.fetch_add(1, Ordering::SeqCst);
                User::create(key)
            },
        );
        assert_eq!(4, user.id);
        assert_eq!(1, built.load(Ordering::SeqCst));
        assert_eq!(vec![4], *seen.lock());
    }

    #[test]
    fn test_strong_field_always_announces_replacement() {
        let cache = ObjectCache::<u32, User>::strong();
        let (notifier, seen) = recording_notifier();
        let mut owner = None;

        let a = resolve_strong_field_default(&mut owner, &1, &cache, user_id, &notifier);
        let again = resolve_strong_field_default(&mut owner, &1, &cache, user_id, &notifier);
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(vec![1], *seen.lock());

        // Invalid under the same key still counts as a replacement here.
        a.valid.store(false, Ordering::SeqCst);
        resolve_strong_field_default(&mut owner, &1, &cache, user_id, &notifier);
        resolve_strong_field_default(&mut owner, &3, &cache, user_id, &notifier);
        assert_eq!(vec![1, 1, 3], *seen.lock());
    }

    #[test]
    fn test_unsubscribe() {
        let (notifier, seen) = recording_notifier();
        let extra = notifier.subscribe(|_| {});
        assert_eq!(2, notifier.len());
        assert!(notifier.unsubscribe(extra));
        assert!(!notifier.unsubscribe(extra));
        notifier.notify(&User::create(&9));
        assert_eq!(vec![9], *seen.lock());
    }
}
