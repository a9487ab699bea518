//! Dynamic entity instances and their relationship slots.
//!
//! An [`Entity`] is a record of scalar [`Value`]s plus named relationship
//! slots. Instances are shared through [`EntityRef`] handles; two handles are
//! the same instance exactly when they point at the same allocation, which is
//! what the identity map and the change tracker compare.

use crate::value::Value;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

/// Lifecycle state of an entity as seen by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Not yet known to the session.
    New,
    /// Tracked; will be inserted or dirty-checked on commit.
    Managed,
    /// Scheduled for deletion on commit.
    Removed,
    /// Was managed, now untracked.
    Detached,
}

/// Stable identifier of one in-memory instance.
///
/// Valid while some handle to the instance is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(usize);

/// A single-valued relationship slot.
#[derive(Debug, Clone, Default)]
pub enum Reference {
    /// The target was never loaded; the slot must not be diffed.
    #[default]
    NotLoaded,
    /// The target is known (possibly absent).
    Loaded(Option<EntityRef>),
}

impl Reference {
    /// Whether the slot holds loaded data.
    pub const fn is_loaded(&self) -> bool {
        matches!(self, Reference::Loaded(_))
    }

    /// The loaded target, if any.
    pub fn target(&self) -> Option<&EntityRef> {
        match self {
            Reference::Loaded(Some(target)) => Some(target),
            _ => None,
        }
    }
}

/// A collection-valued relationship slot.
///
/// Tracks members added and removed since the last snapshot, so changes to a
/// collection that was never loaded can still be flushed.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    loaded: bool,
    members: Vec<EntityRef>,
    added: Vec<EntityRef>,
    removed: Vec<EntityRef>,
}

impl Collection {
    /// An empty, loaded collection.
    pub fn new() -> Self {
        Self {
            loaded: true,
            ..Self::default()
        }
    }

    /// A loaded collection with the given members.
    pub fn from_members(members: Vec<EntityRef>) -> Self {
        let mut collection = Self::new();
        for member in members {
            if !collection.members.contains(&member) {
                collection.members.push(member);
            }
        }
        collection
    }

    /// A collection whose members were never loaded.
    pub fn not_loaded() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// The full member list, when loaded.
    pub fn members(&self) -> Option<&[EntityRef]> {
        self.loaded.then_some(self.members.as_slice())
    }

    /// Members added since the last snapshot.
    pub fn added(&self) -> &[EntityRef] {
        &self.added
    }

    /// Members removed since the last snapshot.
    pub fn removed(&self) -> &[EntityRef] {
        &self.removed
    }

    /// Every member this side knows about: all members if loaded, else the
    /// pending additions.
    pub fn known_members(&self) -> &[EntityRef] {
        if self.loaded {
            &self.members
        } else {
            &self.added
        }
    }

    /// Whether `entity` is a known member.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.known_members().contains(entity)
    }

    /// Add a member. Returns `false` if it was already present.
    pub fn push(&mut self, entity: EntityRef) -> bool {
        if self.loaded {
            if self.members.contains(&entity) {
                return false;
            }
            self.members.push(entity.clone());
        }
        if let Some(pos) = self.removed.iter().position(|e| e == &entity) {
            self.removed.remove(pos);
        } else if !self.added.contains(&entity) {
            self.added.push(entity);
        } else {
            return false;
        }
        true
    }

    /// Remove a member. Returns `false` if a loaded collection did not hold it.
    pub fn remove(&mut self, entity: &EntityRef) -> bool {
        if self.loaded {
            let Some(pos) = self.members.iter().position(|e| e == entity) else {
                return false;
            };
            self.members.remove(pos);
        }
        if let Some(pos) = self.added.iter().position(|e| e == entity) {
            self.added.remove(pos);
        } else if !self.removed.contains(entity) {
            self.removed.push(entity.clone());
        }
        true
    }

    /// Replace the member list, recording the difference.
    pub fn set_members(&mut self, members: Vec<EntityRef>) {
        let old = std::mem::take(&mut self.members);
        let was_loaded = self.loaded;
        self.loaded = true;
        if was_loaded {
            for member in &old {
                if !members.contains(member) {
                    self.remove_tracked(member);
                }
            }
        }
        for member in members {
            if self.members.contains(&member) {
                continue;
            }
            if !old.contains(&member) {
                self.add_tracked(&member);
            }
            self.members.push(member);
        }
    }

    /// Move the member at `from` to position `to` (ordered collections).
    pub fn move_member(&mut self, from: usize, to: usize) {
        if self.loaded && from < self.members.len() && to < self.members.len() {
            let member = self.members.remove(from);
            self.members.insert(to, member);
        }
    }

    /// Forget the added/removed bookkeeping after a successful commit.
    pub fn mark_clean(&mut self) {
        self.added.clear();
        self.removed.clear();
    }

    fn add_tracked(&mut self, entity: &EntityRef) {
        if let Some(pos) = self.removed.iter().position(|e| e == entity) {
            self.removed.remove(pos);
        } else if !self.added.contains(entity) {
            self.added.push(entity.clone());
        }
    }

    fn remove_tracked(&mut self, entity: &EntityRef) {
        if let Some(pos) = self.added.iter().position(|e| e == entity) {
            self.added.remove(pos);
        } else if !self.removed.contains(entity) {
            self.removed.push(entity.clone());
        }
    }
}

/// A relationship slot on an entity.
#[derive(Debug, Clone)]
pub enum Relation {
    Reference(Reference),
    Collection(Collection),
}

/// A dynamically-typed entity instance.
#[derive(Clone, Default)]
pub struct Entity {
    entity_type: String,
    fields: BTreeMap<String, Value>,
    relations: BTreeMap<String, Relation>,
}

impl Entity {
    /// Create an empty instance of `entity_type`.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            fields: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Builder: set a scalar field.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Builder: set a loaded to-one reference.
    #[must_use]
    pub fn with_reference(mut self, name: impl Into<String>, target: Option<EntityRef>) -> Self {
        self.set_reference(name, target);
        self
    }

    /// Builder: set a loaded collection.
    #[must_use]
    pub fn with_collection(mut self, name: impl Into<String>, members: Vec<EntityRef>) -> Self {
        self.relations.insert(
            name.into(),
            Relation::Collection(Collection::from_members(members)),
        );
        self
    }

    /// Builder: set an arbitrary relationship slot.
    #[must_use]
    pub fn with_relation(mut self, name: impl Into<String>, relation: Relation) -> Self {
        self.relations.insert(name.into(), relation);
        self
    }

    /// The entity's type name.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// A scalar field's value; absent fields are NULL.
    pub fn get(&self, field: &str) -> &Value {
        const NULL: &Value = &Value::Null;
        self.fields.get(field).unwrap_or(NULL)
    }

    /// Set a scalar field.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// All explicitly set scalar fields.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// A relationship slot.
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    /// Replace a relationship slot.
    pub fn set_relation(&mut self, name: impl Into<String>, relation: Relation) {
        self.relations.insert(name.into(), relation);
    }

    /// A to-one slot; missing slots read as [`Reference::NotLoaded`].
    pub fn reference(&self, name: &str) -> &Reference {
        const NOT_LOADED: &Reference = &Reference::NotLoaded;
        match self.relations.get(name) {
            Some(Relation::Reference(reference)) => reference,
            _ => NOT_LOADED,
        }
    }

    /// The loaded target of a to-one slot, cloned out of the entity.
    pub fn target(&self, name: &str) -> Option<EntityRef> {
        self.reference(name).target().cloned()
    }

    /// Load a to-one slot with `target`.
    pub fn set_reference(&mut self, name: impl Into<String>, target: Option<EntityRef>) {
        self.relations
            .insert(name.into(), Relation::Reference(Reference::Loaded(target)));
    }

    /// A to-many slot.
    pub fn collection(&self, name: &str) -> Option<&Collection> {
        match self.relations.get(name) {
            Some(Relation::Collection(collection)) => Some(collection),
            _ => None,
        }
    }

    /// A to-many slot for mutation; created empty and loaded when missing.
    pub fn collection_mut(&mut self, name: &str) -> &mut Collection {
        let slot = self
            .relations
            .entry(name.to_string())
            .or_insert_with(|| Relation::Collection(Collection::new()));
        if !matches!(slot, Relation::Collection(_)) {
            *slot = Relation::Collection(Collection::new());
        }
        match slot {
            Relation::Collection(collection) => collection,
            Relation::Reference(_) => unreachable!("slot was just replaced by a collection"),
        }
    }

    /// Clear collection bookkeeping on every slot.
    pub fn mark_collections_clean(&mut self) {
        for relation in self.relations.values_mut() {
            if let Relation::Collection(collection) = relation {
                collection.mark_clean();
            }
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Relationship targets are printed by handle to keep cycles finite.
        f.debug_struct("Entity")
            .field("entity_type", &self.entity_type)
            .field("fields", &self.fields)
            .field("relations", &self.relations)
            .finish()
    }
}

/// Shared handle to an entity instance.
///
/// Relationship slots hold strong handles, and so do a session's snapshots.
/// An object graph with a cycle (a parent and its children pointing back, a
/// self-referencing row) keeps itself alive after the session is cleared;
/// break the cycle by clearing one side when the graph is no longer needed.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Entity>>);

impl EntityRef {
    /// Wrap a new instance.
    pub fn new(entity: Entity) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// A handle that does not keep the instance alive.
    pub fn downgrade(&self) -> WeakEntityRef {
        WeakEntityRef(Arc::downgrade(&self.0))
    }

    /// Instance identifier.
    pub fn id(&self) -> EntityId {
        EntityId(Arc::as_ptr(&self.0) as usize)
    }

    /// Whether two handles refer to the same instance.
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Acquire a read guard.
    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read()
    }

    /// Acquire a write guard.
    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.write()
    }

    /// The instance's type name.
    pub fn entity_type(&self) -> String {
        self.0.read().entity_type().to_string()
    }

    /// Clone a scalar field's value.
    pub fn get(&self, field: &str) -> Value {
        self.0.read().get(field).clone()
    }

    /// Set a scalar field.
    pub fn set(&self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.write().set(field, value);
    }

    /// Clone the target of a to-one slot.
    pub fn target(&self, name: &str) -> Option<EntityRef> {
        self.0.read().target(name)
    }

    /// Load a to-one slot.
    pub fn set_reference(&self, name: impl Into<String>, target: Option<EntityRef>) {
        self.0.write().set_reference(name, target);
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Some(entity) => write!(f, "EntityRef({}@{:#x})", entity.entity_type(), self.id().0),
            None => write!(f, "EntityRef(<locked>@{:#x})", self.id().0),
        }
    }
}

/// Non-owning handle to an entity instance.
#[derive(Clone)]
pub struct WeakEntityRef(Weak<RwLock<Entity>>);

impl WeakEntityRef {
    /// The instance, if still alive.
    pub fn upgrade(&self) -> Option<EntityRef> {
        self.0.upgrade().map(EntityRef)
    }

    /// Whether this handle points at `entity`.
    pub fn is(&self, entity: &EntityRef) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&entity.0))
    }
}

impl fmt::Debug for WeakEntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakEntityRef({:#x})", self.0.as_ptr() as usize)
    }
}

impl From<Entity> for EntityRef {
    fn from(entity: Entity) -> Self {
        Self::new(entity)
    }
}
