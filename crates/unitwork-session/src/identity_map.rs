//! Identity Map pattern for tracking unique entity instances per identity.
//!
//! The Identity Map ensures that each database row corresponds to exactly one
//! entity instance within a session. This provides:
//!
//! - **Uniqueness**: Same identity always returns the same `EntityRef`
//! - **Consistency**: Changes to an instance are visible everywhere it's used
//!
//! Keys use the inheritance root type, so a `Student` and a `Person` with the
//! same primary key are the same row and cannot both be registered.
//!
//! # Example
//!
//! ```
//! use unitwork_core::{Entity, EntityRef, PrimaryKey};
//! use unitwork_session::identity_map::{EntityKey, IdentityMap};
//!
//! let mut map = IdentityMap::new();
//! let user = EntityRef::new(Entity::new("User").with("id", 1_i64));
//! let key = EntityKey::new("User", PrimaryKey::single(1_i64));
//!
//! map.register(key.clone(), &user).unwrap();
//! assert_eq!(map.lookup(&key), Some(user));
//! ```

use std::collections::HashMap;
use std::fmt;
use unitwork_core::error::IdentityConflict;
use unitwork_core::{EntityRef, Error, PrimaryKey, Result};

/// Unique key for an entity in the identity map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    /// Inheritance root of the entity type.
    pub root_type: String,
    /// Primary key values.
    pub identity: PrimaryKey,
}

impl EntityKey {
    pub fn new(root_type: impl Into<String>, identity: PrimaryKey) -> Self {
        Self {
            root_type: root_type.into(),
            identity,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.root_type, self.identity)
    }
}

/// Session-scoped map from identity to the one in-memory instance.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, EntityRef>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entity` under `key`.
    ///
    /// Registering the same instance twice is a no-op. Registering a
    /// different instance under an occupied key fails with
    /// [`Error::ConflictingIdentity`].
    pub fn register(&mut self, key: EntityKey, entity: &EntityRef) -> Result<()> {
        self.check(&key, entity)?;
        if self.holds(&key, entity) {
            return Ok(());
        }
        tracing::trace!(entity_type = %key.root_type, identity = %key.identity, "Identity registered");
        self.entries.insert(key, entity.clone());
        Ok(())
    }

    /// Whether `entity` could be registered under `key`, without
    /// registering it.
    pub fn check(&self, key: &EntityKey, entity: &EntityRef) -> Result<()> {
        match self.entries.get(key) {
            Some(existing) if !existing.ptr_eq(entity) => {
                tracing::warn!(
                    entity_type = %key.root_type,
                    identity = %key.identity,
                    "Conflicting identity registration"
                );
                Err(Error::ConflictingIdentity(IdentityConflict {
                    entity_type: key.root_type.clone(),
                    identity: key.identity.clone(),
                }))
            }
            _ => Ok(()),
        }
    }

    /// The instance registered under `key`.
    pub fn lookup(&self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.get(key).cloned()
    }

    /// Remove `key`; no-op when absent.
    pub fn remove(&mut self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.remove(key)
    }

    /// Whether `key` is registered.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether `entity` is the instance registered under `key`.
    pub fn holds(&self, key: &EntityKey, entity: &EntityRef) -> bool {
        self.entries.get(key).is_some_and(|e| e.ptr_eq(entity))
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered keys, for debugging.
    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entries.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitwork_core::Entity;

    fn user(id: i64) -> EntityRef {
        EntityRef::new(Entity::new("User").with("id", id))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut map = IdentityMap::new();
        let alice = user(1);
        let key = EntityKey::new("User", PrimaryKey::single(1_i64));

        map.register(key.clone(), &alice).unwrap();
        assert!(map.contains(&key));
        assert!(map.holds(&key, &alice));
        assert_eq!(map.lookup(&key), Some(alice));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_register_same_instance_is_idempotent() {
        let mut map = IdentityMap::new();
        let alice = user(1);
        let key = EntityKey::new("User", PrimaryKey::single(1_i64));
        map.register(key.clone(), &alice).unwrap();
        map.register(key, &alice).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_register_conflicting_instance_fails() {
        let mut map = IdentityMap::new();
        let key = EntityKey::new("User", PrimaryKey::single(1_i64));
        map.register(key.clone(), &user(1)).unwrap();

        let err = map.register(key, &user(1)).unwrap_err();
        match err {
            Error::ConflictingIdentity(conflict) => {
                assert_eq!(conflict.entity_type, "User");
                assert_eq!(conflict.identity, PrimaryKey::single(1_i64));
            }
            other => std::panic::panic_any(format!("unexpected error: {other:?}")),
        }
    }

    #[test]
    fn test_check_does_not_register() {
        let mut map = IdentityMap::new();
        let alice = user(1);
        let key = EntityKey::new("User", PrimaryKey::single(1_i64));
        map.check(&key, &alice).unwrap();
        assert!(map.is_empty());

        map.register(key.clone(), &alice).unwrap();
        map.check(&key, &alice).unwrap();
        assert!(matches!(
            map.check(&key, &user(1)),
            Err(Error::ConflictingIdentity(_))
        ));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_same_identity_different_root_types() {
        let mut map = IdentityMap::new();
        map.register(EntityKey::new("User", PrimaryKey::single(1_i64)), &user(1))
            .unwrap();
        map.register(EntityKey::new("Team", PrimaryKey::single(1_i64)), &user(1))
            .unwrap();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut map = IdentityMap::new();
        let key = EntityKey::new("User", PrimaryKey::single(1_i64));
        map.register(key.clone(), &user(1)).unwrap();

        assert!(map.remove(&key).is_some());
        assert!(map.remove(&key).is_none());
        assert!(map.is_empty());

        map.register(key, &user(1)).unwrap();
        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn test_entity_key_display() {
        let key = EntityKey::new("User", PrimaryKey::single(7_i64));
        assert_eq!(key.to_string(), "User[7]");
    }
}
