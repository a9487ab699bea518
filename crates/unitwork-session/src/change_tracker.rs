//! Change tracking and dirty detection for the unit of work.
//!
//! This module provides snapshot-based change tracking to detect when
//! entities have been modified since they were last synchronized with the
//! backend. Snapshots hold field values and relationship *instances*; to-one
//! relationships compare by instance identity, collections by membership.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use unitwork_core::{Entity, EntityId, EntityMapping, EntityRef, Reference, Value};

/// Snapshotted value of one persistent field or relationship.
#[derive(Debug, Clone)]
pub enum FieldSnapshot {
    Scalar(Value),
    /// Loaded to-one target (or none).
    Reference(Option<EntityRef>),
    /// Loaded collection members, in order.
    Collection(Vec<EntityRef>),
}

/// Snapshot of an entity's state at a point in time.
///
/// Relationship slots that were not loaded are simply absent.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    fields: BTreeMap<String, FieldSnapshot>,
    taken_at: Instant,
}

impl EntitySnapshot {
    /// Capture `entity` as described by `mapping`.
    pub fn capture(entity: &Entity, mapping: &EntityMapping) -> Self {
        let mut fields = BTreeMap::new();
        for field in &mapping.fields {
            fields.insert(
                field.meta.name.clone(),
                FieldSnapshot::Scalar(entity.get(&field.meta.name).clone()),
            );
        }
        for rel in &mapping.relationships {
            let name = &rel.meta.name;
            if rel.meta.cardinality.is_to_one() {
                if let Reference::Loaded(target) = entity.reference(name) {
                    fields.insert(name.clone(), FieldSnapshot::Reference(target.clone()));
                }
            } else if let Some(members) = entity.collection(name).and_then(|c| c.members()) {
                fields.insert(name.clone(), FieldSnapshot::Collection(members.to_vec()));
            }
        }
        Self {
            fields,
            taken_at: Instant::now(),
        }
    }

    /// Snapshotted scalar value.
    pub fn value(&self, field: &str) -> Option<&Value> {
        match self.fields.get(field) {
            Some(FieldSnapshot::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    /// Snapshotted to-one target; `None` if the slot was not loaded.
    pub fn reference(&self, name: &str) -> Option<Option<&EntityRef>> {
        match self.fields.get(name) {
            Some(FieldSnapshot::Reference(target)) => Some(target.as_ref()),
            _ => None,
        }
    }

    /// Snapshotted collection members; `None` if the slot was not loaded.
    pub fn collection(&self, name: &str) -> Option<&[EntityRef]> {
        match self.fields.get(name) {
            Some(FieldSnapshot::Collection(members)) => Some(members),
            _ => None,
        }
    }

    /// Get the timestamp when the snapshot was taken.
    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// One changed field.
#[derive(Debug, Clone)]
pub enum Change {
    /// Scalar value changed.
    Scalar { old: Value, new: Value },
    /// To-one target changed. `old` is `NotLoaded` when the slot was loaded
    /// after the snapshot was taken.
    Reference { old: Reference, new: Option<EntityRef> },
    /// Collection membership or order changed.
    Collection {
        added: Vec<EntityRef>,
        removed: Vec<EntityRef>,
        reordered: bool,
    },
}

/// Field name → change, for one entity.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: BTreeMap<String, Change>,
}

impl ChangeSet {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Change of one field.
    pub fn get(&self, field: &str) -> Option<&Change> {
        self.changes.get(field)
    }

    /// Whether `field` changed.
    pub fn contains(&self, field: &str) -> bool {
        self.changes.contains_key(field)
    }

    /// Changed field names, sorted.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    /// All changes.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Change)> {
        self.changes.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn insert(&mut self, field: &str, change: Change) {
        self.changes.insert(field.to_string(), change);
    }
}

fn diff_members(old: &[EntityRef], new: &[EntityRef]) -> (Vec<EntityRef>, Vec<EntityRef>) {
    let added = new.iter().filter(|e| !old.contains(e)).cloned().collect();
    let removed = old.iter().filter(|e| !new.contains(e)).cloned().collect();
    (added, removed)
}

/// Compute the change set of `entity` against `snapshot`.
///
/// Identity and version fields are not part of the change set; the unit of
/// work owns them. Relationship slots that are not loaded are never diffed,
/// except that a not-loaded collection reports its tracked additions and
/// removals.
pub fn compute_changes(
    entity: &Entity,
    snapshot: &EntitySnapshot,
    mapping: &EntityMapping,
) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for field in &mapping.fields {
        let name = field.meta.name.as_str();
        if mapping.version_field.as_deref() == Some(name) {
            continue;
        }
        let current = entity.get(name);
        let Some(old) = snapshot.value(name) else {
            continue;
        };
        if old.same_as(current) {
            continue;
        }
        if mapping.is_identity_field(name) {
            tracing::warn!(
                entity_type = %mapping.name,
                field = name,
                "Identity field modified on a persistent entity; ignoring"
            );
            continue;
        }
        changes.insert(
            name,
            Change::Scalar {
                old: old.clone(),
                new: current.clone(),
            },
        );
    }

    for rel in &mapping.relationships {
        let name = rel.meta.name.as_str();
        if rel.meta.cardinality.is_to_one() {
            let Reference::Loaded(current) = entity.reference(name) else {
                continue;
            };
            match snapshot.reference(name) {
                Some(old) => {
                    let same = match (old, current.as_ref()) {
                        (Some(a), Some(b)) => a.ptr_eq(b),
                        (None, None) => true,
                        _ => false,
                    };
                    if !same {
                        changes.insert(
                            name,
                            Change::Reference {
                                old: Reference::Loaded(old.cloned()),
                                new: current.clone(),
                            },
                        );
                    }
                }
                None => changes.insert(
                    name,
                    Change::Reference {
                        old: Reference::NotLoaded,
                        new: current.clone(),
                    },
                ),
            }
            continue;
        }

        let Some(collection) = entity.collection(name) else {
            continue;
        };
        let (added, removed, reordered) = match (collection.members(), snapshot.collection(name))
        {
            (Some(current), Some(old)) => {
                let (added, removed) = diff_members(old, current);
                let reordered = rel.meta.ordered
                    && added.is_empty()
                    && removed.is_empty()
                    && old.iter().zip(current).any(|(a, b)| !a.ptr_eq(b));
                (added, removed, reordered)
            }
            _ => (
                collection.added().to_vec(),
                collection.removed().to_vec(),
                false,
            ),
        };
        if !added.is_empty() || !removed.is_empty() || reordered {
            changes.insert(
                name,
                Change::Collection {
                    added,
                    removed,
                    reordered,
                },
            );
        }
    }

    changes
}

/// Tracks snapshots of managed entities.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    /// Original snapshots by instance.
    snapshots: HashMap<EntityId, EntitySnapshot>,
}

impl ChangeTracker {
    /// Create a new empty change tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take (or refresh) the snapshot of an entity.
    #[tracing::instrument(level = "trace", skip(self, entity, mapping))]
    pub fn snapshot(&mut self, id: EntityId, entity: &Entity, mapping: &EntityMapping) {
        let snapshot = EntitySnapshot::capture(entity, mapping);
        tracing::trace!(
            entity_type = %mapping.name,
            snapshot_fields = snapshot.fields.len(),
            "Taking entity snapshot"
        );
        self.snapshots.insert(id, snapshot);
    }

    /// Changes since the snapshot; `None` when there is no snapshot.
    #[tracing::instrument(level = "trace", skip(self, entity, mapping))]
    pub fn changes(
        &self,
        id: EntityId,
        entity: &Entity,
        mapping: &EntityMapping,
    ) -> Option<ChangeSet> {
        let snapshot = self.snapshots.get(&id)?;
        let changes = compute_changes(entity, snapshot, mapping);
        tracing::trace!(
            entity_type = %mapping.name,
            changed_count = changes.len(),
            "Dirty check result"
        );
        Some(changes)
    }

    /// Whether the entity differs from its snapshot (no snapshot = dirty).
    pub fn is_dirty(&self, id: EntityId, entity: &Entity, mapping: &EntityMapping) -> bool {
        self.changes(id, entity, mapping)
            .is_none_or(|changes| !changes.is_empty())
    }

    /// Check if a snapshot exists for the given instance.
    pub fn has_snapshot(&self, id: EntityId) -> bool {
        self.snapshots.contains_key(&id)
    }

    /// Get the snapshot for an instance.
    pub fn get_snapshot(&self, id: EntityId) -> Option<&EntitySnapshot> {
        self.snapshots.get(&id)
    }

    /// Drop the snapshot of one instance.
    pub fn forget(&mut self, id: EntityId) {
        self.snapshots.remove(&id);
    }

    /// Clear all snapshots.
    pub fn clear_all(&mut self) {
        self.snapshots.clear();
    }

    /// Number of snapshotted instances.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
