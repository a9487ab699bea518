//! Unit of Work pattern implementation.
//!
//! The Unit of Work tracks every managed entity of a session and commits the
//! pending changes in dependency order.
//!
//! # Overview
//!
//! The Unit of Work:
//! - Keeps one instance per identity (identity map)
//! - Promotes new entities reachable through cascade-persist relationships
//! - Schedules orphans and cascade-removed entities for deletion
//! - Diffs managed entities against their snapshots (change sets)
//! - Orders inserts parent-first and deletes child-first, deferring foreign
//!   keys that lie inside a dependency cycle
//! - Dispatches the plan to a [`PersistenceBackend`] and reconciles each
//!   successful operation
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(registry);
//!
//! uow.persist(&user)?;
//! let report = uow.commit(&cx, &backend).await;
//! ```
//!
//! A commit moves through `Idle -> Computing -> Ordering -> Flushing ->
//! Reconciling -> Idle`. A backend failure leaves the operations that already
//! ran applied and moves the unit of work to `Failed`; it then refuses
//! further work until [`UnitOfWork::clear`] is called.

use crate::SessionConfig;
use crate::change_tracker::{Change, ChangeSet, ChangeTracker};
use crate::flush::{CommitPlan, CommitReport, DependencyOrderer, PendingOp};
use crate::identity_map::{EntityKey, IdentityMap};
use asupersync::{Cx, Outcome};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use unitwork_core::{
    BackendOperationError, Columns, DeleteRequest, DependencyError, DependencyFailure, Entity,
    EntityId, EntityMapping, EntityRef, Error, IdGenerator, InheritanceStrategy, InsertRequest,
    LifecycleState, LinkRequest, MappedRelationship, MetadataRegistry, OperationKind,
    PersistenceBackend, PrimaryKey, Reference, Result, UpdateRequest, Value, VersionCheck,
    WeakEntityRef,
};

/// Phase of the commit state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    /// Accepting caller operations.
    Idle,
    /// Cascades, orphan detection and change sets.
    Computing,
    /// Dependency validation and plan construction.
    Ordering,
    /// Dispatching operations to the backend.
    Flushing,
    /// Refreshing snapshots after a successful flush.
    Reconciling,
    /// A commit failed part-way; only `clear` is accepted.
    Failed,
}

/// Internal tracking state. Both `PendingInsert` and `Persistent` report
/// [`LifecycleState::Managed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    PendingInsert,
    Persistent,
    Removed,
}

#[derive(Debug, Clone)]
struct Record {
    entity: EntityRef,
    entity_type: String,
    state: RecordState,
    /// Identity map key, once the identity is known.
    key: Option<EntityKey>,
    /// Tracking order, for deterministic plans.
    seq: u64,
}

/// Bookkeeping captured before a commit computes its plan. Restored when
/// the plan cannot be built, so a failed computation changes nothing.
#[derive(Debug)]
struct Checkpoint {
    records: HashMap<EntityId, Record>,
    identity_map: IdentityMap,
    sequences: HashMap<String, i64>,
    next_seq: u64,
    /// Contents of every entity the computation wrote, as first seen.
    entities: HashMap<EntityId, (EntityRef, Entity)>,
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Entities pending INSERT.
    pub new: usize,
    /// Persistent entities with a non-empty change set.
    pub dirty: usize,
    /// Entities pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    /// Total number of pending operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    /// Check if there are no pending operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new == 0 && self.dirty == 0 && self.deleted == 0
    }
}

/// Identity of `entity` if every identity field is set.
fn identity_of(entity: &Entity, mapping: &EntityMapping) -> Option<PrimaryKey> {
    let pk = PrimaryKey::new(
        mapping
            .identity
            .iter()
            .map(|field| entity.get(field).clone())
            .collect(),
    );
    pk.is_complete().then_some(pk)
}

fn identity_values(entity: &EntityRef, mapping: &EntityMapping) -> Vec<Value> {
    let guard = entity.read();
    mapping
        .identity
        .iter()
        .map(|field| guard.get(field).clone())
        .collect()
}

fn key_columns(mapping: &EntityMapping, values: &[Value]) -> Columns {
    mapping
        .identity_columns
        .iter()
        .cloned()
        .zip(values.iter().cloned())
        .collect()
}

/// Relationship targets of `entity` selected by `select`: the loaded target
/// of to-one slots and the known members of collections.
fn related(
    entity: &EntityRef,
    mapping: &EntityMapping,
    select: impl Fn(&MappedRelationship) -> bool,
) -> Vec<EntityRef> {
    let guard = entity.read();
    let mut targets = Vec::new();
    for rel in mapping.relationships.iter().filter(|r| select(r)) {
        if rel.meta.cardinality.is_to_one() {
            targets.extend(guard.target(&rel.meta.name));
        } else if let Some(collection) = guard.collection(&rel.meta.name) {
            targets.extend(collection.known_members().iter().cloned());
        }
    }
    targets
}

fn missing_assigned_identity(mapping: &EntityMapping) -> Error {
    Error::metadata(
        &mapping.name,
        format!(
            "assigned identity ({}) must be set before persist",
            mapping.identity.join(", ")
        ),
    )
}

fn backend_error(
    operation: OperationKind,
    entity: &EntityRef,
    mapping: &EntityMapping,
    source: Error,
) -> Error {
    Error::BackendOperation(BackendOperationError {
        operation,
        entity_type: mapping.name.clone(),
        identity: identity_of(&entity.read(), mapping),
        source: Box::new(source),
    })
}

/// Tracks and manages all pending changes in a session.
pub struct UnitOfWork {
    registry: Arc<MetadataRegistry>,
    orderer: DependencyOrderer,
    config: SessionConfig,
    identity_map: IdentityMap,
    change_tracker: ChangeTracker,
    records: HashMap<EntityId, Record>,
    /// Instances this unit of work detached (or cleared).
    detached: HashMap<EntityId, WeakEntityRef>,
    /// Last value drawn from each named sequence.
    sequences: HashMap<String, i64>,
    next_seq: u64,
    phase: CommitPhase,
    /// Operations reconciled by the last commit, for entity hooks.
    reconciled: Vec<(OperationKind, EntityRef)>,
    /// Set while a commit computes its plan.
    checkpoint: Option<Checkpoint>,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("phase", &self.phase)
            .field("tracked", &self.records.len())
            .field("identity_map", &self.identity_map.len())
            .field("pending", &self.pending_counts())
            .finish_non_exhaustive()
    }
}

impl UnitOfWork {
    /// Create a unit of work with the default configuration.
    pub fn new(registry: MetadataRegistry) -> Self {
        Self::with_config(registry, SessionConfig::default())
    }

    /// Create a unit of work with `config`.
    pub fn with_config(registry: MetadataRegistry, config: SessionConfig) -> Self {
        let orderer = DependencyOrderer::new(&registry);
        Self {
            registry: Arc::new(registry),
            orderer,
            config,
            identity_map: IdentityMap::new(),
            change_tracker: ChangeTracker::new(),
            records: HashMap::new(),
            detached: HashMap::new(),
            sequences: HashMap::new(),
            next_seq: 0,
            phase: CommitPhase::Idle,
            reconciled: Vec::new(),
            checkpoint: None,
        }
    }

    /// The metadata registry.
    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    /// The configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current commit phase.
    pub fn phase(&self) -> CommitPhase {
        self.phase
    }

    /// The identity map.
    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    /// The change tracker.
    pub fn change_tracker(&self) -> &ChangeTracker {
        &self.change_tracker
    }

    /// The dependency orderer.
    pub fn orderer(&self) -> &DependencyOrderer {
        &self.orderer
    }

    /// Number of tracked entities (including removed ones).
    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.phase == CommitPhase::Failed {
            return Err(Error::SessionFailed);
        }
        Ok(())
    }

    fn record_state(&self, entity: &EntityRef) -> Option<RecordState> {
        self.records.get(&entity.id()).map(|r| r.state)
    }

    /// Tracked entities in tracking order.
    fn tracked_in_order(&self, include: impl Fn(RecordState) -> bool) -> Vec<EntityRef> {
        let mut records: Vec<&Record> = self
            .records
            .values()
            .filter(|r| include(r.state))
            .collect();
        records.sort_by_key(|r| r.seq);
        records.iter().map(|r| r.entity.clone()).collect()
    }

    fn was_detached(&self, entity: &EntityRef) -> bool {
        self.detached
            .get(&entity.id())
            .is_some_and(|weak| weak.is(entity))
    }

    // ------------------------------------------------------------------
    // Caller API
    // ------------------------------------------------------------------

    /// Lifecycle state of `entity` as seen by this unit of work.
    pub fn state_of(&self, entity: &EntityRef) -> LifecycleState {
        if let Some(record) = self.records.get(&entity.id()) {
            return match record.state {
                RecordState::PendingInsert | RecordState::Persistent => LifecycleState::Managed,
                RecordState::Removed => LifecycleState::Removed,
            };
        }
        if self.was_detached(entity) {
            return LifecycleState::Detached;
        }
        let entity_type = entity.entity_type();
        let Ok(mapping) = self.registry.mapping(&entity_type) else {
            return LifecycleState::New;
        };
        // A generated identity means the row was written by someone.
        if mapping.id_generator != IdGenerator::Assigned
            && identity_of(&entity.read(), mapping).is_some()
        {
            return LifecycleState::Detached;
        }
        LifecycleState::New
    }

    /// Whether `entity` is managed and not scheduled for removal.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        matches!(
            self.record_state(entity),
            Some(RecordState::PendingInsert | RecordState::Persistent)
        )
    }

    /// The managed instance with the given identity.
    pub fn find(
        &self,
        entity_type: &str,
        identity: impl Into<PrimaryKey>,
    ) -> Result<Option<EntityRef>> {
        let mapping = self.registry.mapping(entity_type)?;
        let key = EntityKey::new(mapping.root.clone(), identity.into());
        let found = self.identity_map.lookup(&key).filter(|entity| {
            self.record_state(entity) != Some(RecordState::Removed)
                && self.registry.is_a(&entity.entity_type(), entity_type)
        });
        Ok(found)
    }

    /// Make a new entity managed, cascading along cascade-persist
    /// relationships.
    ///
    /// Managed entities are left alone but still cascade; removed entities
    /// are un-scheduled. Detached entities cannot be persisted. Either every
    /// entity the cascade reaches is scheduled or, on error, none is.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_usable()?;
        let registry = Arc::clone(&self.registry);
        let closure = self.persist_closure(&registry, std::slice::from_ref(entity), true)?;
        self.check_insertable(&registry, &closure)?;
        for member in &closure {
            self.apply_persist(&registry, member)?;
        }
        Ok(())
    }

    /// Schedule a managed entity for removal, cascading along cascade-remove
    /// (and orphan-removal) relationships.
    ///
    /// An entity that was only pending insert goes back to `New`.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_usable()?;
        match self.record_state(entity) {
            Some(RecordState::PendingInsert | RecordState::Persistent) => {}
            Some(RecordState::Removed) => {
                return Err(Error::invalid_transition(
                    entity.entity_type(),
                    LifecycleState::Removed,
                    "remove",
                ));
            }
            None => {
                return Err(Error::invalid_transition(
                    entity.entity_type(),
                    self.state_of(entity),
                    "remove",
                ));
            }
        }
        let registry = Arc::clone(&self.registry);
        self.schedule_removal(&registry, vec![entity.clone()])
    }

    /// Stop tracking `entity`. Returns `false` for entities that were not
    /// tracked.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn detach(&mut self, entity: &EntityRef) -> bool {
        let Some(record) = self.records.remove(&entity.id()) else {
            return false;
        };
        if let Some(key) = &record.key {
            if self.identity_map.holds(key, entity) {
                self.identity_map.remove(key);
            }
        }
        self.change_tracker.forget(entity.id());
        if self.config.track_detached {
            self.detached.retain(|_, weak| weak.upgrade().is_some());
            self.detached.insert(entity.id(), entity.downgrade());
        }
        tracing::debug!(entity_type = %record.entity_type, state = ?record.state, "Entity detached");
        true
    }

    /// Adopt an entity loaded by the caller as persistent, snapshotting its
    /// current state.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn register_managed(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_usable()?;
        match self.record_state(entity) {
            Some(RecordState::PendingInsert | RecordState::Persistent) => return Ok(()),
            Some(RecordState::Removed) => {
                return Err(Error::invalid_transition(
                    entity.entity_type(),
                    LifecycleState::Removed,
                    "register as managed",
                ));
            }
            None => {}
        }

        let registry = Arc::clone(&self.registry);
        let entity_type = entity.entity_type();
        let mapping = registry.mapping(&entity_type)?;
        let Some(identity) = identity_of(&entity.read(), mapping) else {
            return Err(Error::invalid_transition(
                entity_type,
                LifecycleState::New,
                "register as managed",
            ));
        };

        let key = EntityKey::new(mapping.root.clone(), identity);
        self.identity_map.register(key.clone(), entity)?;
        self.track(entity, entity_type, RecordState::Persistent, Some(key));
        self.detached.remove(&entity.id());
        self.change_tracker
            .snapshot(entity.id(), &entity.read(), mapping);
        entity.write().mark_collections_clean();
        Ok(())
    }

    /// Drop every tracked entity, snapshot and schedule. Never touches the
    /// backend; resets a failed unit of work.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn clear(&mut self) {
        self.detached.retain(|_, weak| weak.upgrade().is_some());
        if self.config.track_detached {
            for (id, record) in &self.records {
                self.detached.insert(*id, record.entity.downgrade());
            }
        }
        let dropped = self.records.len();
        self.records.clear();
        self.identity_map.clear();
        self.change_tracker.clear_all();
        self.reconciled.clear();
        self.phase = CommitPhase::Idle;
        tracing::info!(dropped, "Unit of work cleared");
    }

    /// Read-only change set of a persistent entity.
    pub fn change_set(&self, entity: &EntityRef) -> Result<Option<ChangeSet>> {
        if self.record_state(entity) != Some(RecordState::Persistent) {
            return Ok(None);
        }
        let mapping = self.registry.mapping(&entity.entity_type())?;
        Ok(self
            .change_tracker
            .changes(entity.id(), &entity.read(), mapping))
    }

    /// Pending work as of now (without running cascades).
    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for record in self.records.values() {
            match record.state {
                RecordState::PendingInsert => counts.new += 1,
                RecordState::Removed => counts.deleted += 1,
                RecordState::Persistent => {
                    let dirty = self
                        .registry
                        .mapping(&record.entity_type)
                        .ok()
                        .and_then(|m| {
                            self.change_tracker
                                .changes(record.entity.id(), &record.entity.read(), m)
                        })
                        .is_some_and(|c| !c.is_empty());
                    if dirty {
                        counts.dirty += 1;
                    }
                }
            }
        }
        counts
    }

    /// Operations reconciled by the last commit.
    pub fn take_reconciled(&mut self) -> Vec<(OperationKind, EntityRef)> {
        std::mem::take(&mut self.reconciled)
    }

    // ------------------------------------------------------------------
    // Persist / remove internals
    // ------------------------------------------------------------------

    fn track(
        &mut self,
        entity: &EntityRef,
        entity_type: String,
        state: RecordState,
        key: Option<EntityKey>,
    ) {
        self.next_seq += 1;
        self.records.insert(
            entity.id(),
            Record {
                entity: entity.clone(),
                entity_type,
                state,
                key,
                seq: self.next_seq,
            },
        );
    }

    /// Everything `persist` acts on: `roots` plus whatever cascade-persist
    /// reaches from them. Fails before any state changes.
    ///
    /// `explicit` is false for the commit-time cascade, which neither revives
    /// removed entities nor cascades through them.
    fn persist_closure(
        &self,
        registry: &MetadataRegistry,
        roots: &[EntityRef],
        explicit: bool,
    ) -> Result<Vec<EntityRef>> {
        let mut visited: HashSet<EntityId> = HashSet::new();
        let mut closure = Vec::new();
        let mut stack: Vec<EntityRef> = roots.iter().rev().cloned().collect();

        while let Some(entity) = stack.pop() {
            if !visited.insert(entity.id()) {
                continue;
            }
            let entity_type = entity.entity_type();
            let mapping = registry.mapping(&entity_type)?;

            match self.record_state(&entity) {
                Some(RecordState::Removed) if !explicit => continue,
                Some(_) => {}
                None if self.was_detached(&entity) => {
                    return Err(Error::invalid_transition(
                        entity_type,
                        LifecycleState::Detached,
                        "persist",
                    ));
                }
                None => {}
            }

            let targets = related(&entity, mapping, |r| r.meta.cascade.persist);
            closure.push(entity);
            stack.extend(targets.into_iter().rev());
        }
        Ok(closure)
    }

    fn apply_persist(&mut self, registry: &MetadataRegistry, entity: &EntityRef) -> Result<()> {
        match self.records.get_mut(&entity.id()) {
            Some(record) if record.state == RecordState::Removed => {
                record.state = RecordState::Persistent;
                tracing::debug!(entity_type = %record.entity_type, "Removal cancelled by persist");
                Ok(())
            }
            Some(_) => Ok(()),
            None => self.schedule_insert(registry, entity),
        }
    }

    fn sequence_after(&self, last: Option<i64>) -> i64 {
        match last {
            Some(last) => last + self.config.sequence_increment,
            None => self.config.sequence_start,
        }
    }

    fn next_sequence_value(&mut self, name: &str) -> i64 {
        let next = self.sequence_after(self.sequences.get(name).copied());
        self.sequences.insert(name.to_string(), next);
        next
    }

    /// Fail if some untracked member of `closure` could not be scheduled for
    /// insert. Changes nothing.
    fn check_insertable(&self, registry: &MetadataRegistry, closure: &[EntityRef]) -> Result<()> {
        let mut drawn: HashMap<&str, i64> = HashMap::new();
        let mut claimed = IdentityMap::new();
        for entity in closure.iter().filter(|e| self.record_state(e).is_none()) {
            let mapping = registry.mapping(&entity.entity_type())?;
            let known = identity_of(&entity.read(), mapping);
            let identity = match (known, &mapping.id_generator) {
                (Some(identity), _) => identity,
                (None, IdGenerator::Assigned) => return Err(missing_assigned_identity(mapping)),
                (None, IdGenerator::Sequence(name)) => {
                    let last = drawn
                        .get(name.as_str())
                        .or_else(|| self.sequences.get(name))
                        .copied();
                    let next = self.sequence_after(last);
                    drawn.insert(name.as_str(), next);
                    PrimaryKey::new(vec![Value::BigInt(next)])
                }
                (None, IdGenerator::Identity) => continue,
            };
            let key = EntityKey::new(mapping.root.clone(), identity);
            self.identity_map.check(&key, entity)?;
            claimed.register(key, entity)?;
        }
        Ok(())
    }

    fn schedule_insert(&mut self, registry: &MetadataRegistry, entity: &EntityRef) -> Result<()> {
        let entity_type = entity.entity_type();
        let mapping = registry.mapping(&entity_type)?;

        match &mapping.id_generator {
            IdGenerator::Assigned => {
                if identity_of(&entity.read(), mapping).is_none() {
                    return Err(missing_assigned_identity(mapping));
                }
            }
            IdGenerator::Sequence(name) => {
                if identity_of(&entity.read(), mapping).is_none() {
                    self.touch(entity);
                    let value = self.next_sequence_value(name);
                    entity.set(mapping.identity[0].clone(), Value::BigInt(value));
                    tracing::trace!(entity_type = %entity_type, sequence = %name, value, "Drew sequence value");
                }
            }
            IdGenerator::Identity => {}
        }

        let key = identity_of(&entity.read(), mapping)
            .map(|identity| EntityKey::new(mapping.root.clone(), identity));
        if let Some(key) = &key {
            self.identity_map.register(key.clone(), entity)?;
        }
        tracing::debug!(
            entity_type = %entity_type,
            identity = ?key.as_ref().map(|k| k.identity.to_string()),
            "Entity scheduled for insert"
        );
        self.track(entity, entity_type, RecordState::PendingInsert, key);
        Ok(())
    }

    /// Forget a pending insert; the entity goes back to `New`.
    fn cancel_insert(&mut self, registry: &MetadataRegistry, entity: &EntityRef) {
        let Some(record) = self.records.remove(&entity.id()) else {
            return;
        };
        if let Some(key) = &record.key {
            if self.identity_map.holds(key, entity) {
                self.identity_map.remove(key);
            }
        }
        self.change_tracker.forget(entity.id());
        if let Ok(mapping) = registry.mapping(&record.entity_type) {
            if mapping.id_generator != IdGenerator::Assigned {
                self.touch(entity);
                let mut guard = entity.write();
                for field in &mapping.identity {
                    guard.set(field.clone(), Value::Null);
                }
            }
        }
        tracing::debug!(entity_type = %record.entity_type, "Pending insert cancelled");
    }

    /// Remove `roots` and everything cascade-remove reaches through managed
    /// entities.
    fn schedule_removal(&mut self, registry: &MetadataRegistry, roots: Vec<EntityRef>) -> Result<()> {
        let mut visited: HashSet<EntityId> = HashSet::new();
        let mut closure = Vec::new();
        let mut stack: Vec<EntityRef> = roots.into_iter().rev().collect();

        while let Some(entity) = stack.pop() {
            if !visited.insert(entity.id()) {
                continue;
            }
            if !self.contains(&entity) {
                continue;
            }
            let mapping = registry.mapping(&entity.entity_type())?;
            let targets = related(&entity, mapping, |r| r.meta.cascades_remove());
            closure.push(entity);
            stack.extend(targets.into_iter().rev());
        }

        for entity in closure {
            match self.record_state(&entity) {
                Some(RecordState::PendingInsert) => self.cancel_insert(registry, &entity),
                Some(RecordState::Persistent) => {
                    if let Some(record) = self.records.get_mut(&entity.id()) {
                        record.state = RecordState::Removed;
                        tracing::debug!(entity_type = %record.entity_type, "Entity scheduled for removal");
                    }
                }
                Some(RecordState::Removed) | None => {}
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit: computing
    // ------------------------------------------------------------------

    /// Save `entity`'s contents before the commit computation first writes
    /// it. No-op outside a computation.
    fn touch(&mut self, entity: &EntityRef) {
        if let Some(checkpoint) = &mut self.checkpoint {
            checkpoint
                .entities
                .entry(entity.id())
                .or_insert_with(|| (entity.clone(), entity.read().clone()));
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        let rewritten = checkpoint.entities.len();
        for (entity, saved) in checkpoint.entities.into_values() {
            *entity.write() = saved;
        }
        self.records = checkpoint.records;
        self.identity_map = checkpoint.identity_map;
        self.sequences = checkpoint.sequences;
        self.next_seq = checkpoint.next_seq;
        tracing::debug!(rewritten, "Commit computation rolled back");
    }

    /// Fill unset owning sides of managed members from inverse sides.
    fn sync_inverse_sides(&mut self, registry: &MetadataRegistry) -> Result<()> {
        for owner in self.tracked_in_order(|s| s != RecordState::Removed) {
            let mapping = registry.mapping(&owner.entity_type())?;
            for rel in &mapping.relationships {
                let Some(mapped_by) = rel.meta.mapped_by.as_deref().filter(|_| !rel.meta.owning)
                else {
                    continue;
                };
                let members: Vec<EntityRef> =
                    related(&owner, mapping, |r| r.meta.name == rel.meta.name)
                        .into_iter()
                        .filter(|m| self.contains(m))
                        .collect();
                for member in &members {
                    let member_mapping = registry.mapping(&member.entity_type())?;
                    let Some(owning) = member_mapping.relationship(mapped_by) else {
                        continue;
                    };
                    let to_one = owning.meta.cardinality.is_to_one();
                    let unset = {
                        let guard = member.read();
                        if to_one {
                            guard.reference(mapped_by).target().is_none()
                        } else {
                            !guard.collection(mapped_by).is_some_and(|c| c.contains(&owner))
                        }
                    };
                    if !unset {
                        continue;
                    }
                    self.touch(member);
                    let mut guard = member.write();
                    if to_one {
                        guard.set_reference(mapped_by, Some(owner.clone()));
                        tracing::trace!(
                            entity_type = %member_mapping.name,
                            relationship = mapped_by,
                            "Owning reference filled from inverse side"
                        );
                    } else {
                        guard.collection_mut(mapped_by).push(owner.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Every entity a managed entity points at, through any relationship,
    /// must be tracked, detached, or carry an identity.
    fn check_reachable_scheduled(&self, registry: &MetadataRegistry) -> Result<()> {
        for entity in self.tracked_in_order(|s| s != RecordState::Removed) {
            let mapping = registry.mapping(&entity.entity_type())?;
            for rel in &mapping.relationships {
                let name = rel.meta.name.as_str();
                for target in related(&entity, mapping, |r| r.meta.name == name) {
                    if self.record_state(&target).is_some() || self.was_detached(&target) {
                        continue;
                    }
                    let target_mapping = registry.mapping(&target.entity_type())?;
                    if identity_of(&target.read(), target_mapping).is_none() {
                        tracing::warn!(
                            entity_type = %mapping.name,
                            relationship = name,
                            "New entity reached through a relationship that does not cascade persist"
                        );
                        return Err(Self::dependency_error(
                            mapping,
                            &entity,
                            rel,
                            DependencyFailure::TargetNotScheduled,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether some managed, non-removed entity other than `child` still
    /// references it.
    fn is_referenced(&self, registry: &MetadataRegistry, child: &EntityRef) -> bool {
        self.records.values().any(|record| {
            if record.state == RecordState::Removed || record.entity.ptr_eq(child) {
                return false;
            }
            let Ok(mapping) = registry.mapping(&record.entity_type) else {
                return false;
            };
            related(&record.entity, mapping, |_| true).contains(child)
        })
    }

    fn schedule_orphans(&mut self, registry: &MetadataRegistry) -> Result<()> {
        let mut candidates: Vec<EntityRef> = Vec::new();
        for parent in self.tracked_in_order(|s| s == RecordState::Persistent) {
            let mapping = registry.mapping(&parent.entity_type())?;
            if !mapping.relationships.iter().any(|r| r.meta.orphan_removal) {
                continue;
            }
            let Some(changes) = self
                .change_tracker
                .changes(parent.id(), &parent.read(), mapping)
            else {
                continue;
            };
            for rel in mapping.relationships.iter().filter(|r| r.meta.orphan_removal) {
                match changes.get(&rel.meta.name) {
                    Some(Change::Reference {
                        old: Reference::Loaded(Some(old)),
                        ..
                    }) => candidates.push(old.clone()),
                    Some(Change::Collection { removed, .. }) => {
                        candidates.extend(removed.iter().cloned());
                    }
                    _ => {}
                }
            }
        }

        let mut seen = HashSet::new();
        for child in candidates {
            if !seen.insert(child.id()) || !self.contains(&child) {
                continue;
            }
            if self.is_referenced(registry, &child) {
                tracing::debug!(
                    entity_type = %child.entity_type(),
                    "Severed child is still referenced; not an orphan"
                );
                continue;
            }
            tracing::debug!(entity_type = %child.entity_type(), "Orphan scheduled for removal");
            self.schedule_removal(registry, vec![child])?;
        }
        Ok(())
    }

    fn dependency_error(
        mapping: &EntityMapping,
        entity: &EntityRef,
        rel: &MappedRelationship,
        reason: DependencyFailure,
    ) -> Error {
        Error::UnresolvableDependency(DependencyError {
            entity_type: mapping.name.clone(),
            identity: identity_of(&entity.read(), mapping),
            field: rel.meta.name.clone(),
            target_type: rel.meta.target.clone(),
            reason,
        })
    }

    /// Check that `target` can be written as a foreign key value (or link
    /// row member) of `entity.rel`.
    fn check_target(
        &self,
        registry: &MetadataRegistry,
        mapping: &EntityMapping,
        entity: &EntityRef,
        rel: &MappedRelationship,
        target: &EntityRef,
    ) -> Result<()> {
        let target_type = target.entity_type();
        if !registry.is_a(&target_type, &rel.meta.target) {
            return Err(Error::metadata(
                &mapping.name,
                format!(
                    "relationship '{}' expects {}, found {}",
                    rel.meta.name, rel.meta.target, target_type
                ),
            ));
        }
        match self.record_state(target) {
            Some(RecordState::PendingInsert | RecordState::Persistent) => Ok(()),
            Some(RecordState::Removed) => {
                if rel.meta.nullable || rel.meta.cardinality.is_to_many() {
                    tracing::warn!(
                        entity_type = %mapping.name,
                        relationship = %rel.meta.name,
                        "Reference to an entity scheduled for removal"
                    );
                    Ok(())
                } else {
                    Err(Self::dependency_error(
                        mapping,
                        entity,
                        rel,
                        DependencyFailure::TargetRemoved,
                    ))
                }
            }
            None => {
                let target_mapping = registry.mapping(&target_type)?;
                if identity_of(&target.read(), target_mapping).is_some() {
                    Ok(())
                } else {
                    Err(Self::dependency_error(
                        mapping,
                        entity,
                        rel,
                        DependencyFailure::TargetNotScheduled,
                    ))
                }
            }
        }
    }

    fn validate_dependencies(
        &self,
        registry: &MetadataRegistry,
        changes: &HashMap<EntityId, ChangeSet>,
    ) -> Result<()> {
        for entity in self.tracked_in_order(|s| s != RecordState::Removed) {
            let pending = self.record_state(&entity) == Some(RecordState::PendingInsert);
            let mapping = registry.mapping(&entity.entity_type())?;
            for rel in &mapping.relationships {
                let name = rel.meta.name.as_str();
                if rel.meta.writes_foreign_key() {
                    let reference = entity.read().reference(name).clone();
                    let changed = changes.get(&entity.id()).is_some_and(|c| c.contains(name));
                    match reference {
                        Reference::NotLoaded if pending && !rel.meta.nullable => {
                            return Err(Self::dependency_error(
                                mapping,
                                &entity,
                                rel,
                                DependencyFailure::RequiredNull,
                            ));
                        }
                        Reference::Loaded(None) if (pending || changed) && !rel.meta.nullable => {
                            return Err(Self::dependency_error(
                                mapping,
                                &entity,
                                rel,
                                DependencyFailure::RequiredNull,
                            ));
                        }
                        Reference::Loaded(Some(target)) => {
                            self.check_target(registry, mapping, &entity, rel, &target)?;
                        }
                        _ => {}
                    }
                } else if rel.meta.owning && rel.meta.link_table.is_some() {
                    let members = related(&entity, mapping, |r| r.meta.name == name);
                    for member in &members {
                        if self.record_state(member) == Some(RecordState::Removed) {
                            continue;
                        }
                        self.check_target(registry, mapping, &entity, rel, member)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Computing + Ordering. Leaves the phase at `Ordering` on success; on
    /// error every promotion, removal and entity write it made is undone.
    fn compute_plan(&mut self) -> Result<CommitPlan> {
        self.checkpoint = Some(Checkpoint {
            records: self.records.clone(),
            identity_map: self.identity_map.clone(),
            sequences: self.sequences.clone(),
            next_seq: self.next_seq,
            entities: HashMap::new(),
        });
        let plan = self.compute_plan_steps();
        if let Some(checkpoint) = self.checkpoint.take() {
            if plan.is_err() {
                self.restore(checkpoint);
            }
        }
        plan
    }

    fn compute_plan_steps(&mut self) -> Result<CommitPlan> {
        let registry = Arc::clone(&self.registry);

        self.phase = CommitPhase::Computing;
        let roots = self.tracked_in_order(|s| s != RecordState::Removed);
        let closure = self.persist_closure(&registry, &roots, false)?;
        for entity in &closure {
            if self.record_state(entity).is_none() {
                tracing::debug!(entity_type = %entity.entity_type(), "Persist cascaded at commit");
                self.schedule_insert(&registry, entity)?;
            }
        }
        if self.config.sync_inverse_sides {
            self.sync_inverse_sides(&registry)?;
        }
        self.check_reachable_scheduled(&registry)?;
        self.schedule_orphans(&registry)?;

        let mut changes: HashMap<EntityId, ChangeSet> = HashMap::new();
        for entity in self.tracked_in_order(|s| s == RecordState::Persistent) {
            let mapping = registry.mapping(&entity.entity_type())?;
            if let Some(change_set) =
                self.change_tracker
                    .changes(entity.id(), &entity.read(), mapping)
            {
                if !change_set.is_empty() {
                    changes.insert(entity.id(), change_set);
                }
            }
        }

        self.phase = CommitPhase::Ordering;
        self.validate_dependencies(&registry, &changes)?;
        self.build_plan(&registry, changes)
    }

    /// Compute the commit plan without executing it.
    ///
    /// Runs the cascades and orphan detection of a commit, so entities may be
    /// promoted or scheduled for removal as a side effect. Nothing changes
    /// when it fails.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn prepare_commit(&mut self) -> Result<CommitPlan> {
        self.ensure_usable()?;
        let plan = self.compute_plan();
        self.phase = CommitPhase::Idle;
        plan
    }

    // ------------------------------------------------------------------
    // Commit: ordering
    // ------------------------------------------------------------------

    fn node_of(&self, registry: &MetadataRegistry, entity: &EntityRef) -> Result<String> {
        Ok(registry.mapping(&entity.entity_type())?.graph_node.clone())
    }

    fn build_plan(
        &self,
        registry: &MetadataRegistry,
        mut changes: HashMap<EntityId, ChangeSet>,
    ) -> Result<CommitPlan> {
        let mut plan = CommitPlan::new();

        // Inserts: type rank, then tracking order.
        let mut pending: Vec<(usize, u64, EntityRef)> = Vec::new();
        for record in self.records.values() {
            if record.state == RecordState::PendingInsert {
                let node = &registry.mapping(&record.entity_type)?.graph_node;
                pending.push((
                    self.orderer.insert_rank(node),
                    record.seq,
                    record.entity.clone(),
                ));
            }
        }
        pending.sort_by_key(|(rank, seq, _)| (*rank, *seq));
        let pending_ids: HashSet<EntityId> = pending.iter().map(|(_, _, e)| e.id()).collect();

        for (_, _, entity) in &pending {
            let mapping = registry.mapping(&entity.entity_type())?;
            let mut deferred = Vec::new();
            for rel in mapping.relationships.iter().filter(|r| r.meta.writes_foreign_key()) {
                let Some(target) = entity.target(&rel.meta.name) else {
                    continue;
                };
                if !pending_ids.contains(&target.id()) {
                    continue;
                }
                let target_node = self.node_of(registry, &target)?;
                if self.orderer.is_cyclic_edge(&mapping.graph_node, &target_node) {
                    deferred.push(rel.meta.name.clone());
                }
            }
            if !deferred.is_empty() {
                tracing::debug!(
                    entity_type = %mapping.name,
                    relationships = ?deferred,
                    "Foreign keys deferred to break a dependency cycle"
                );
                plan.deferred_updates.push(PendingOp::DeferredUpdate {
                    entity: entity.clone(),
                    entity_type: mapping.name.clone(),
                    relationships: deferred.clone(),
                });
            }
            plan.inserts.push(PendingOp::Insert {
                entity: entity.clone(),
                entity_type: mapping.name.clone(),
                deferred,
            });
        }

        self.plan_links(registry, &changes, &mut plan)?;

        // Updates: only entities with column changes.
        for entity in self.tracked_in_order(|s| s == RecordState::Persistent) {
            let Some(change_set) = changes.remove(&entity.id()) else {
                continue;
            };
            let mapping = registry.mapping(&entity.entity_type())?;
            let writes_columns = change_set.iter().any(|(name, change)| match change {
                Change::Scalar { .. } => true,
                Change::Reference { .. } => mapping
                    .relationship(name)
                    .is_some_and(|r| r.meta.writes_foreign_key()),
                Change::Collection { .. } => false,
            });
            if writes_columns {
                plan.updates.push(PendingOp::Update {
                    entity,
                    entity_type: mapping.name.clone(),
                    changes: change_set,
                });
            }
        }

        plan.deletes = self.ordered_deletes(registry)?;

        tracing::info!(
            inserts = plan.inserts.len(),
            deferred_updates = plan.deferred_updates.len(),
            link_deletes = plan.link_deletes.len(),
            link_inserts = plan.link_inserts.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            "Commit plan built"
        );
        Ok(plan)
    }

    fn plan_links(
        &self,
        registry: &MetadataRegistry,
        changes: &HashMap<EntityId, ChangeSet>,
        plan: &mut CommitPlan,
    ) -> Result<()> {
        let mut deleted: HashSet<(EntityId, String, EntityId)> = HashSet::new();
        let mut link_delete = |plan: &mut CommitPlan, owner: &EntityRef, ty: &str, rel: &str, target: &EntityRef| {
            if deleted.insert((owner.id(), rel.to_string(), target.id())) {
                plan.link_deletes.push(PendingOp::LinkDelete {
                    owner: owner.clone(),
                    entity_type: ty.to_string(),
                    relationship: rel.to_string(),
                    target: target.clone(),
                });
            }
        };
        let link_insert = |plan: &mut CommitPlan, owner: &EntityRef, ty: &str, rel: &str, target: &EntityRef, position: Option<usize>| {
            plan.link_inserts.push(PendingOp::LinkInsert {
                owner: owner.clone(),
                entity_type: ty.to_string(),
                relationship: rel.to_string(),
                target: target.clone(),
                position,
            });
        };

        let removed: Vec<EntityRef> = self.tracked_in_order(|s| s == RecordState::Removed);

        for owner in self.tracked_in_order(|_| true) {
            let state = self.record_state(&owner);
            let mapping = registry.mapping(&owner.entity_type())?;
            for rel in &mapping.relationships {
                let Some(link) = rel.meta.link_table.as_ref().filter(|_| rel.meta.owning) else {
                    continue;
                };
                let name = rel.meta.name.as_str();
                let positioned = rel.meta.ordered && link.position_column.is_some();
                let current: Vec<EntityRef> = related(&owner, mapping, |r| r.meta.name == name)
                    .into_iter()
                    .filter(|m| self.record_state(m) != Some(RecordState::Removed))
                    .collect();

                // Link rows pointing at removed entities go with them.
                if state == Some(RecordState::Persistent) {
                    let known = related(&owner, mapping, |r| r.meta.name == name);
                    for target in removed.iter().filter(|r| known.contains(r)) {
                        link_delete(plan, &owner, &mapping.name, name, target);
                    }
                }

                match state {
                    Some(RecordState::PendingInsert) => {
                        for (i, member) in current.iter().enumerate() {
                            link_insert(plan, &owner, &mapping.name, name, member, positioned.then_some(i));
                        }
                    }
                    Some(RecordState::Persistent) => {
                        let Some(Change::Collection { added, removed: dropped, reordered }) =
                            changes.get(&owner.id()).and_then(|c| c.get(name))
                        else {
                            continue;
                        };
                        let snapshot = self
                            .change_tracker
                            .get_snapshot(owner.id())
                            .and_then(|s| s.collection(name));
                        match snapshot {
                            Some(old) if positioned => {
                                // Positions shift; rewrite every row.
                                for member in old {
                                    link_delete(plan, &owner, &mapping.name, name, member);
                                }
                                for (i, member) in current.iter().enumerate() {
                                    link_insert(plan, &owner, &mapping.name, name, member, Some(i));
                                }
                                tracing::trace!(entity_type = %mapping.name, relationship = name, reordered, "Ordered collection rewritten");
                            }
                            _ => {
                                for member in dropped {
                                    link_delete(plan, &owner, &mapping.name, name, member);
                                }
                                for member in added {
                                    if self.record_state(member) == Some(RecordState::Removed) {
                                        continue;
                                    }
                                    let position = current.iter().position(|m| m == member);
                                    link_insert(plan, &owner, &mapping.name, name, member, position.filter(|_| positioned));
                                }
                            }
                        }
                    }
                    Some(RecordState::Removed) => {
                        let members: Vec<EntityRef> = self
                            .change_tracker
                            .get_snapshot(owner.id())
                            .and_then(|s| s.collection(name))
                            .map_or_else(
                                || related(&owner, mapping, |r| r.meta.name == name),
                                <[EntityRef]>::to_vec,
                            );
                        for member in &members {
                            link_delete(plan, &owner, &mapping.name, name, member);
                        }
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }

    /// Removed entities, child-first. Within a self-referencing type,
    /// referencing rows come first.
    fn ordered_deletes(&self, registry: &MetadataRegistry) -> Result<Vec<PendingOp>> {
        let mut removed: Vec<(usize, u64, EntityRef, String)> = Vec::new();
        for record in self.records.values() {
            if record.state == RecordState::Removed {
                let node = registry.mapping(&record.entity_type)?.graph_node.clone();
                removed.push((
                    self.orderer.insert_rank(&node),
                    record.seq,
                    record.entity.clone(),
                    node,
                ));
            }
        }
        removed.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut deletes = Vec::with_capacity(removed.len());
        let mut start = 0;
        while start < removed.len() {
            let rank = removed[start].0;
            let end = removed[start..]
                .iter()
                .position(|r| r.0 != rank)
                .map_or(removed.len(), |offset| start + offset);
            let group: Vec<EntityRef> = removed[start..end].iter().map(|r| r.2.clone()).collect();
            let node = &removed[start].3;
            let group = if self.orderer.is_self_referencing(node) {
                self.referencing_first(registry, group)?
            } else {
                group
            };
            for entity in group {
                deletes.push(PendingOp::Delete {
                    entity_type: entity.entity_type(),
                    entity,
                });
            }
            start = end;
        }
        Ok(deletes)
    }

    /// Order `group` so that an entity comes before every entity it
    /// references. Cycles fall back to tracking order.
    fn referencing_first(
        &self,
        registry: &MetadataRegistry,
        group: Vec<EntityRef>,
    ) -> Result<Vec<EntityRef>> {
        let mut referenced_by: HashMap<EntityId, usize> = HashMap::new();
        let mut references: Vec<Vec<EntityId>> = Vec::with_capacity(group.len());
        for entity in &group {
            let mapping = registry.mapping(&entity.entity_type())?;
            let snapshot = self.change_tracker.get_snapshot(entity.id());
            let mut targets = Vec::new();
            for rel in mapping.relationships.iter().filter(|r| r.meta.writes_foreign_key()) {
                let target = match entity.read().reference(&rel.meta.name) {
                    Reference::Loaded(target) => target.clone(),
                    Reference::NotLoaded => snapshot
                        .and_then(|s| s.reference(&rel.meta.name))
                        .flatten()
                        .cloned(),
                };
                if let Some(target) = target.filter(|t| group.contains(t) && !t.ptr_eq(entity)) {
                    *referenced_by.entry(target.id()).or_insert(0) += 1;
                    targets.push(target.id());
                }
            }
            references.push(targets);
        }

        let mut ordered = Vec::with_capacity(group.len());
        let mut done = vec![false; group.len()];
        loop {
            let next = (0..group.len()).find(|&i| {
                !done[i] && referenced_by.get(&group[i].id()).copied().unwrap_or(0) == 0
            });
            let Some(i) = next.or_else(|| (0..group.len()).find(|&i| !done[i])) else {
                break;
            };
            done[i] = true;
            for target in &references[i] {
                if let Some(count) = referenced_by.get_mut(target) {
                    *count = count.saturating_sub(1);
                }
            }
            referenced_by.remove(&group[i].id());
            ordered.push(group[i].clone());
        }
        Ok(ordered)
    }

    // ------------------------------------------------------------------
    // Commit: flushing and reconciliation
    // ------------------------------------------------------------------

    /// Commit all pending changes to `backend`.
    ///
    /// Errors raised before the first backend call (cascade, dependency or
    /// metadata errors) leave the unit of work usable. Once dispatching has
    /// started, any failure or cancellation stops the batch, leaves executed
    /// operations applied and moves the unit of work to
    /// [`CommitPhase::Failed`].
    #[tracing::instrument(level = "info", skip(self, cx, backend))]
    pub async fn commit<B: PersistenceBackend>(
        &mut self,
        cx: &Cx,
        backend: &B,
    ) -> Outcome<CommitReport, Error> {
        if let Err(e) = self.ensure_usable() {
            return Outcome::Err(e);
        }
        let start = Instant::now();
        self.reconciled.clear();

        let plan = match self.compute_plan() {
            Ok(plan) => plan,
            Err(e) => {
                self.phase = CommitPhase::Idle;
                tracing::warn!(error = %e, "Commit aborted before dispatch");
                return Outcome::Err(e);
            }
        };

        self.phase = CommitPhase::Flushing;
        let mut report = CommitReport::default();
        for op in plan.iter() {
            if let Some(reason) = cx.cancel_reason() {
                self.phase = CommitPhase::Failed;
                tracing::warn!(executed = report.total(), "Commit cancelled mid-batch");
                return Outcome::Cancelled(reason);
            }
            match self.dispatch(cx, backend, op).await {
                Outcome::Ok(()) => report.record(op.kind()),
                Outcome::Err(e) => {
                    self.phase = CommitPhase::Failed;
                    tracing::error!(
                        operation = %op.kind(),
                        entity_type = %op.entity_type(),
                        executed = report.total(),
                        error = %e,
                        "Commit failed; executed operations stand"
                    );
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.phase = CommitPhase::Failed;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.phase = CommitPhase::Failed;
                    return Outcome::Panicked(p);
                }
            }
        }

        self.phase = CommitPhase::Reconciling;
        let registry = Arc::clone(&self.registry);
        for entity in self.tracked_in_order(|s| s == RecordState::Persistent) {
            if let Ok(mapping) = registry.mapping(&entity.entity_type()) {
                self.change_tracker
                    .snapshot(entity.id(), &entity.read(), mapping);
                entity.write().mark_collections_clean();
            }
        }
        self.phase = CommitPhase::Idle;

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = report.inserted,
            deferred_updates = report.deferred_updates,
            updated = report.updated,
            deleted = report.deleted,
            links_inserted = report.links_inserted,
            links_deleted = report.links_deleted,
            "Commit complete"
        );
        Outcome::Ok(report)
    }

    async fn dispatch<B: PersistenceBackend>(
        &mut self,
        cx: &Cx,
        backend: &B,
        op: &PendingOp,
    ) -> Outcome<(), Error> {
        let registry = Arc::clone(&self.registry);
        let mapping = match registry.mapping(op.entity_type()) {
            Ok(mapping) => mapping,
            Err(e) => return Outcome::Err(e),
        };
        tracing::debug!(operation = %op.kind(), entity_type = %mapping.name, "Dispatching operation");

        match op {
            PendingOp::Insert {
                entity, deferred, ..
            } => self.execute_insert(cx, backend, mapping, entity, deferred).await,
            PendingOp::DeferredUpdate {
                entity,
                relationships,
                ..
            } => {
                let requests =
                    match Self::foreign_key_updates(&registry, mapping, entity, relationships) {
                        Ok(requests) => requests,
                        Err(e) => return Outcome::Err(e),
                    };
                for request in &requests {
                    match backend.update(cx, request).await {
                        Outcome::Ok(()) => {}
                        Outcome::Err(e) => {
                            return Outcome::Err(backend_error(
                                OperationKind::DeferredUpdate,
                                entity,
                                mapping,
                                e,
                            ));
                        }
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                Outcome::Ok(())
            }
            PendingOp::Update {
                entity, changes, ..
            } => self.execute_update(cx, backend, mapping, entity, changes).await,
            PendingOp::LinkInsert {
                owner,
                relationship,
                target,
                position,
                ..
            } => {
                let request =
                    match Self::link_request(&registry, mapping, owner, relationship, target, *position)
                    {
                        Ok(request) => request,
                        Err(e) => return Outcome::Err(e),
                    };
                match backend.insert_link(cx, &request).await {
                    Outcome::Ok(()) => Outcome::Ok(()),
                    Outcome::Err(e) => Outcome::Err(backend_error(
                        OperationKind::LinkInsert,
                        owner,
                        mapping,
                        e,
                    )),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
            PendingOp::LinkDelete {
                owner,
                relationship,
                target,
                ..
            } => {
                let request =
                    match Self::link_request(&registry, mapping, owner, relationship, target, None) {
                        Ok(request) => request,
                        Err(e) => return Outcome::Err(e),
                    };
                match backend.delete_link(cx, &request).await {
                    Outcome::Ok(()) => Outcome::Ok(()),
                    Outcome::Err(e) => Outcome::Err(backend_error(
                        OperationKind::LinkDelete,
                        owner,
                        mapping,
                        e,
                    )),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
            PendingOp::Delete { entity, .. } => {
                self.execute_delete(cx, backend, mapping, entity).await
            }
        }
    }

    /// Foreign key columns of `rel` pointing at `target` (NULL when absent).
    fn foreign_key_columns(
        registry: &MetadataRegistry,
        rel: &MappedRelationship,
        target: Option<&EntityRef>,
    ) -> Result<Columns> {
        let values = match target {
            Some(target) => {
                let target_mapping = registry.mapping(&target.entity_type())?;
                identity_values(target, target_mapping)
            }
            None => vec![Value::Null; rel.meta.join_columns.len()],
        };
        Ok(rel.meta.join_columns.iter().cloned().zip(values).collect())
    }

    fn insert_requests(
        registry: &MetadataRegistry,
        mapping: &EntityMapping,
        entity: &EntityRef,
        deferred: &[String],
    ) -> Result<Vec<InsertRequest>> {
        let mut tables: Vec<(String, Columns)> = mapping
            .tables
            .iter()
            .map(|t| (t.clone(), Vec::new()))
            .collect();
        let push = |tables: &mut Vec<(String, Columns)>, table: &str, column: String, value: Value| {
            if let Some((_, columns)) = tables.iter_mut().find(|(t, _)| t == table) {
                columns.push((column, value));
            }
        };

        let identity = identity_values(entity, mapping);
        for (_, columns) in tables.iter_mut().skip(1) {
            columns.extend(key_columns(mapping, &identity));
        }

        let targets: Vec<(&MappedRelationship, Option<EntityRef>)> = {
            let guard = entity.read();
            for field in &mapping.fields {
                push(
                    &mut tables,
                    &field.table,
                    field.meta.column.clone(),
                    guard.get(&field.meta.name).clone(),
                );
            }
            mapping
                .relationships
                .iter()
                .filter(|r| r.meta.writes_foreign_key())
                .map(|r| {
                    let target = if deferred.contains(&r.meta.name) {
                        None
                    } else {
                        guard.target(&r.meta.name)
                    };
                    (r, target)
                })
                .collect()
        };

        for (rel, target) in targets {
            for (column, value) in Self::foreign_key_columns(registry, rel, target.as_ref())? {
                push(&mut tables, &rel.table, column, value);
            }
        }

        if let Some(discriminator) = &mapping.discriminator {
            if matches!(
                mapping.strategy,
                InheritanceStrategy::SingleTable | InheritanceStrategy::Joined
            ) {
                if let Some((_, columns)) = tables.first_mut() {
                    columns.push((discriminator.column.clone(), Value::from(discriminator.value.as_str())));
                }
            }
        }

        let generated = mapping.id_generator.is_post_insert() && identity.iter().any(Value::is_null);
        Ok(tables
            .into_iter()
            .enumerate()
            .map(|(i, (table, values))| InsertRequest {
                entity_type: mapping.name.clone(),
                table,
                key_columns: mapping.identity_columns.clone(),
                values,
                generated_column: (generated && i == 0)
                    .then(|| mapping.identity_columns[0].clone()),
            })
            .collect())
    }

    async fn execute_insert<B: PersistenceBackend>(
        &mut self,
        cx: &Cx,
        backend: &B,
        mapping: &EntityMapping,
        entity: &EntityRef,
        deferred: &[String],
    ) -> Outcome<(), Error> {
        if let Some(version) = &mapping.version_field {
            entity.set(version.clone(), Value::BigInt(self.config.initial_version));
        }
        let requests = match Self::insert_requests(&self.registry, mapping, entity, deferred) {
            Ok(requests) => requests,
            Err(e) => return Outcome::Err(e),
        };

        let mut generated: Option<Value> = None;
        for (i, mut request) in requests.into_iter().enumerate() {
            if let Some(id) = &generated {
                for (column, value) in &mut request.values {
                    if mapping.identity_columns.first() == Some(column) {
                        *value = id.clone();
                    }
                }
            }
            match backend.insert(cx, &request).await {
                Outcome::Ok(Some(id)) if i == 0 && request.generated_column.is_some() => {
                    generated = Some(id);
                }
                Outcome::Ok(_) => {}
                Outcome::Err(e) => {
                    return Outcome::Err(backend_error(OperationKind::Insert, entity, mapping, e));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        if let Some(id) = generated {
            entity.set(mapping.identity[0].clone(), id);
        }
        let Some(identity) = identity_of(&entity.read(), mapping) else {
            return Outcome::Err(backend_error(
                OperationKind::Insert,
                entity,
                mapping,
                Error::Custom("backend returned no generated identity".to_string()),
            ));
        };

        let key = EntityKey::new(mapping.root.clone(), identity);
        if let Err(e) = self.identity_map.register(key.clone(), entity) {
            return Outcome::Err(e);
        }
        if let Some(record) = self.records.get_mut(&entity.id()) {
            record.state = RecordState::Persistent;
            record.key = Some(key.clone());
        }
        self.change_tracker
            .snapshot(entity.id(), &entity.read(), mapping);
        entity.write().mark_collections_clean();
        self.reconciled.push((OperationKind::Insert, entity.clone()));
        tracing::debug!(entity_type = %mapping.name, identity = %key.identity, "Insert reconciled");
        Outcome::Ok(())
    }

    /// One update per table holding foreign keys of `relationships`.
    fn foreign_key_updates(
        registry: &MetadataRegistry,
        mapping: &EntityMapping,
        entity: &EntityRef,
        relationships: &[String],
    ) -> Result<Vec<UpdateRequest>> {
        let identity = identity_values(entity, mapping);
        let mut requests: Vec<UpdateRequest> = Vec::new();
        for rel in mapping
            .relationships
            .iter()
            .filter(|r| relationships.contains(&r.meta.name))
        {
            let target = entity.target(&rel.meta.name);
            let columns = Self::foreign_key_columns(registry, rel, target.as_ref())?;
            match requests.iter_mut().find(|r| r.table == rel.table) {
                Some(request) => request.values.extend(columns),
                None => requests.push(UpdateRequest {
                    entity_type: mapping.name.clone(),
                    table: rel.table.clone(),
                    key: key_columns(mapping, &identity),
                    values: columns,
                    version: None,
                }),
            }
        }
        Ok(requests)
    }

    fn update_requests(
        registry: &MetadataRegistry,
        mapping: &EntityMapping,
        entity: &EntityRef,
        changes: &ChangeSet,
    ) -> Result<(Vec<UpdateRequest>, Option<Value>)> {
        let identity = identity_values(entity, mapping);
        let mut per_table: Vec<(String, Columns)> = mapping
            .tables
            .iter()
            .map(|t| (t.clone(), Vec::new()))
            .collect();

        for (name, change) in changes.iter() {
            match change {
                Change::Scalar { .. } => {
                    if let Some(field) = mapping.field(name) {
                        let value = entity.get(name);
                        if let Some((_, columns)) =
                            per_table.iter_mut().find(|(t, _)| *t == field.table)
                        {
                            columns.push((field.meta.column.clone(), value));
                        }
                    }
                }
                Change::Reference { .. } => {
                    let Some(rel) = mapping
                        .relationship(name)
                        .filter(|r| r.meta.writes_foreign_key())
                    else {
                        continue;
                    };
                    let target = entity.target(name);
                    let columns = Self::foreign_key_columns(registry, rel, target.as_ref())?;
                    if let Some((_, existing)) =
                        per_table.iter_mut().find(|(t, _)| *t == rel.table)
                    {
                        existing.extend(columns);
                    }
                }
                Change::Collection { .. } => {}
            }
        }

        let mut check: Option<(String, VersionCheck)> = None;
        let mut next_version = None;
        if let Some(version) = &mapping.version_field {
            if let Some(field) = mapping.field(version) {
                let expected = entity.get(version);
                let next = Value::BigInt(expected.as_i64().unwrap_or(0) + 1);
                if let Some((_, columns)) = per_table.iter_mut().find(|(t, _)| *t == field.table) {
                    columns.push((field.meta.column.clone(), next.clone()));
                }
                check = Some((
                    field.table.clone(),
                    VersionCheck {
                        column: field.meta.column.clone(),
                        expected,
                    },
                ));
                next_version = Some(next);
            }
        }

        let requests = per_table
            .into_iter()
            .filter(|(_, columns)| !columns.is_empty())
            .map(|(table, values)| UpdateRequest {
                entity_type: mapping.name.clone(),
                version: check
                    .as_ref()
                    .filter(|(t, _)| *t == table)
                    .map(|(_, c)| c.clone()),
                table,
                key: key_columns(mapping, &identity),
                values,
            })
            .collect();
        Ok((requests, next_version))
    }

    async fn execute_update<B: PersistenceBackend>(
        &mut self,
        cx: &Cx,
        backend: &B,
        mapping: &EntityMapping,
        entity: &EntityRef,
        changes: &ChangeSet,
    ) -> Outcome<(), Error> {
        let (requests, next_version) =
            match Self::update_requests(&self.registry, mapping, entity, changes) {
                Ok(built) => built,
                Err(e) => return Outcome::Err(e),
            };

        for request in &requests {
            match backend.update(cx, request).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    return Outcome::Err(backend_error(OperationKind::Update, entity, mapping, e));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        if let (Some(version), Some(next)) = (&mapping.version_field, next_version) {
            entity.set(version.clone(), next);
        }
        self.change_tracker
            .snapshot(entity.id(), &entity.read(), mapping);
        self.reconciled.push((OperationKind::Update, entity.clone()));
        tracing::debug!(
            entity_type = %mapping.name,
            changed = ?changes.fields().collect::<Vec<_>>(),
            "Update reconciled"
        );
        Outcome::Ok(())
    }

    fn link_request(
        registry: &MetadataRegistry,
        mapping: &EntityMapping,
        owner: &EntityRef,
        relationship: &str,
        target: &EntityRef,
        position: Option<usize>,
    ) -> Result<LinkRequest> {
        let Some(link) = mapping
            .relationship(relationship)
            .and_then(|r| r.meta.link_table.as_ref())
        else {
            return Err(Error::metadata(
                &mapping.name,
                format!("relationship '{}' has no link table", relationship),
            ));
        };
        let target_mapping = registry.mapping(&target.entity_type())?;
        let position = match (&link.position_column, position) {
            (Some(column), Some(index)) => {
                Some((column.clone(), Value::BigInt(i64::try_from(index).unwrap_or(i64::MAX))))
            }
            _ => None,
        };
        Ok(LinkRequest {
            entity_type: mapping.name.clone(),
            relationship: relationship.to_string(),
            table: link.table.clone(),
            owner: link
                .owner_columns
                .iter()
                .cloned()
                .zip(identity_values(owner, mapping))
                .collect(),
            target: link
                .target_columns
                .iter()
                .cloned()
                .zip(identity_values(target, target_mapping))
                .collect(),
            position,
        })
    }

    async fn execute_delete<B: PersistenceBackend>(
        &mut self,
        cx: &Cx,
        backend: &B,
        mapping: &EntityMapping,
        entity: &EntityRef,
    ) -> Outcome<(), Error> {
        let identity = identity_values(entity, mapping);
        let version = mapping.version_field.as_ref().and_then(|v| {
            mapping.field(v).map(|field| {
                (
                    field.table.clone(),
                    VersionCheck {
                        column: field.meta.column.clone(),
                        expected: entity.get(v),
                    },
                )
            })
        });

        // Subtype tables first, root table last.
        for table in mapping.tables.iter().rev() {
            let request = DeleteRequest {
                entity_type: mapping.name.clone(),
                table: table.clone(),
                key: key_columns(mapping, &identity),
                version: version
                    .as_ref()
                    .filter(|(t, _)| t == table)
                    .map(|(_, check)| check.clone()),
            };
            match backend.delete(cx, &request).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    return Outcome::Err(backend_error(OperationKind::Delete, entity, mapping, e));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        if let Some(record) = self.records.remove(&entity.id()) {
            if let Some(key) = &record.key {
                if self.identity_map.holds(key, entity) {
                    self.identity_map.remove(key);
                }
            }
        }
        self.change_tracker.forget(entity.id());
        if mapping.id_generator != IdGenerator::Assigned {
            let mut guard = entity.write();
            for field in &mapping.identity {
                guard.set(field.clone(), Value::Null);
            }
        }
        self.reconciled.push((OperationKind::Delete, entity.clone()));
        tracing::debug!(entity_type = %mapping.name, "Delete reconciled");
        Outcome::Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use unitwork_core::{
        CascadeSet, EntityMeta, FieldMeta, LinkTable, MemoryBackend, RelationshipMeta, SqlType,
    };

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn registry() -> MetadataRegistry {
        MetadataRegistry::builder()
            .register(
                EntityMeta::new("User", "users")
                    .identity(["id"])
                    .version("version")
                    .field(FieldMeta::new("id", SqlType::BigInt))
                    .field(FieldMeta::new("name", SqlType::Text))
                    .field(FieldMeta::new("version", SqlType::BigInt))
                    .relationship(
                        RelationshipMeta::one_to_one_inverse("address", "Address", "user")
                            .cascade(CascadeSet::PERSIST),
                    )
                    .relationship(
                        RelationshipMeta::many_to_many(
                            "groups",
                            "Group",
                            LinkTable::new("user_groups", "user_id", "group_id"),
                        )
                        .cascade(CascadeSet::PERSIST),
                    ),
            )
            .unwrap()
            .register(
                EntityMeta::new("Address", "addresses")
                    .identity(["id"])
                    .field(FieldMeta::new("id", SqlType::BigInt))
                    .field(FieldMeta::new("city", SqlType::Text))
                    .relationship(RelationshipMeta::one_to_one("user", "User").required()),
            )
            .unwrap()
            .register(
                EntityMeta::new("Group", "groups")
                    .identity(["code"])
                    .id_generator(IdGenerator::Assigned)
                    .field(FieldMeta::new("code", SqlType::Text)),
            )
            .unwrap()
            .register(
                EntityMeta::new("Ticket", "tickets")
                    .identity(["id"])
                    .id_generator(IdGenerator::Sequence("ticket_seq".to_string()))
                    .field(FieldMeta::new("id", SqlType::BigInt)),
            )
            .unwrap()
            .build()
            .unwrap()
    }

    fn user(name: &str) -> EntityRef {
        EntityRef::new(Entity::new("User").with("name", name))
    }

    #[test]
    fn test_fresh_entity_is_new() {
        let uow = UnitOfWork::new(registry());
        assert_eq!(uow.state_of(&user("a")), LifecycleState::New);
    }

    #[test]
    fn test_persist_and_remove_pending_insert() {
        let mut uow = UnitOfWork::new(registry());
        let alice = user("alice");
        uow.persist(&alice).unwrap();
        assert_eq!(uow.state_of(&alice), LifecycleState::Managed);
        assert_eq!(uow.pending_counts().new, 1);

        uow.remove(&alice).unwrap();
        assert_eq!(uow.state_of(&alice), LifecycleState::New);
        assert!(uow.pending_counts().is_empty());
    }

    #[test]
    fn test_remove_untracked_is_invalid() {
        let mut uow = UnitOfWork::new(registry());
        let err = uow.remove(&user("a")).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_persist_detached_is_invalid() {
        let mut uow = UnitOfWork::new(registry());
        let alice = EntityRef::new(Entity::new("User").with("id", 1_i64).with("name", "a"));
        uow.register_managed(&alice).unwrap();
        assert!(uow.detach(&alice));
        assert_eq!(uow.state_of(&alice), LifecycleState::Detached);
        assert!(!uow.detach(&alice));

        let err = uow.persist(&alice).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStateTransition(ref e) if e.state == LifecycleState::Detached
        ));
    }

    #[test]
    fn test_entity_with_generated_identity_reports_detached() {
        let uow = UnitOfWork::new(registry());
        let loaded_elsewhere = EntityRef::new(Entity::new("User").with("id", 9_i64));
        assert_eq!(uow.state_of(&loaded_elsewhere), LifecycleState::Detached);

        let group = EntityRef::new(Entity::new("Group").with("code", "admins"));
        assert_eq!(uow.state_of(&group), LifecycleState::New);
    }

    #[test]
    fn test_persist_removed_cancels_removal() {
        let mut uow = UnitOfWork::new(registry());
        let alice = EntityRef::new(Entity::new("User").with("id", 1_i64));
        uow.register_managed(&alice).unwrap();
        uow.remove(&alice).unwrap();
        assert_eq!(uow.state_of(&alice), LifecycleState::Removed);
        assert!(uow.remove(&alice).is_err());

        uow.persist(&alice).unwrap();
        assert_eq!(uow.state_of(&alice), LifecycleState::Managed);
    }

    #[test]
    fn test_assigned_identity_required() {
        let mut uow = UnitOfWork::new(registry());
        let group = EntityRef::new(Entity::new("Group"));
        assert!(matches!(uow.persist(&group), Err(Error::Metadata(_))));
    }

    #[test]
    fn test_sequence_identity_assigned_at_persist() {
        let config = SessionConfig::default().sequence_start(100).sequence_increment(10);
        let mut uow = UnitOfWork::with_config(registry(), config);
        let first = EntityRef::new(Entity::new("Ticket"));
        let second = EntityRef::new(Entity::new("Ticket"));
        uow.persist(&first).unwrap();
        uow.persist(&second).unwrap();
        assert_eq!(first.get("id"), Value::BigInt(100));
        assert_eq!(second.get("id"), Value::BigInt(110));
        assert_eq!(uow.find("Ticket", PrimaryKey::single(110_i64)).unwrap(), Some(second.clone()));

        // Cancelling the insert clears the drawn identity.
        uow.remove(&second).unwrap();
        assert!(second.get("id").is_null());
        assert_eq!(uow.state_of(&second), LifecycleState::New);
    }

    #[test]
    fn test_register_managed_conflict() {
        let mut uow = UnitOfWork::new(registry());
        let a = EntityRef::new(Entity::new("User").with("id", 1_i64));
        let b = EntityRef::new(Entity::new("User").with("id", 1_i64));
        uow.register_managed(&a).unwrap();
        uow.register_managed(&a).unwrap();
        assert!(matches!(
            uow.register_managed(&b),
            Err(Error::ConflictingIdentity(_))
        ));
    }

    #[test]
    fn test_clear_detaches_everything() {
        let mut uow = UnitOfWork::new(registry());
        let a = EntityRef::new(Entity::new("User").with("id", 1_i64));
        uow.register_managed(&a).unwrap();
        uow.clear();
        assert_eq!(uow.tracked_count(), 0);
        assert!(uow.identity_map().is_empty());
        assert_eq!(uow.state_of(&a), LifecycleState::Detached);
    }

    #[test]
    fn test_detach_prunes_dropped_instances() {
        let mut uow = UnitOfWork::new(registry());
        for id in 1..=3_i64 {
            let user = EntityRef::new(Entity::new("User").with("id", id));
            uow.register_managed(&user).unwrap();
            assert!(uow.detach(&user));
        }
        assert_eq!(uow.detached.len(), 1);
    }

    #[test]
    fn test_clear_releases_acyclic_entities() {
        let mut uow = UnitOfWork::new(registry());
        let alice = EntityRef::new(Entity::new("User").with("id", 1_i64).with("name", "a"));
        uow.register_managed(&alice).unwrap();
        let weak = alice.downgrade();
        drop(alice);
        assert!(weak.upgrade().is_some());

        uow.clear();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_failed_cascading_persist_schedules_nothing() {
        let mut uow = UnitOfWork::new(registry());
        let admins = EntityRef::new(Entity::new("Group").with("code", "admins"));
        uow.register_managed(&admins).unwrap();

        // The second group collides with the managed one.
        let alice = user("alice");
        let staff = EntityRef::new(Entity::new("Group").with("code", "staff"));
        let copy = EntityRef::new(Entity::new("Group").with("code", "admins"));
        alice
            .write()
            .collection_mut("groups")
            .set_members(vec![staff.clone(), copy.clone()]);

        assert!(matches!(
            uow.persist(&alice),
            Err(Error::ConflictingIdentity(_))
        ));
        assert_eq!(uow.state_of(&alice), LifecycleState::New);
        assert_eq!(uow.state_of(&staff), LifecycleState::New);
        assert!(uow.pending_counts().is_empty());
        assert!(uow.find("Group", PrimaryKey::single("staff")).unwrap().is_none());
    }

    #[test]
    fn test_persist_rejects_sequence_value_already_managed() {
        let mut uow = UnitOfWork::new(registry());
        let loaded = EntityRef::new(Entity::new("Ticket").with("id", 1_i64));
        uow.register_managed(&loaded).unwrap();

        let fresh = EntityRef::new(Entity::new("Ticket"));
        assert!(matches!(
            uow.persist(&fresh),
            Err(Error::ConflictingIdentity(_))
        ));
        assert!(fresh.get("id").is_null());
        assert_eq!(uow.state_of(&fresh), LifecycleState::New);
    }

    #[test]
    fn test_prepare_commit_cascades_without_dispatch() {
        let mut uow = UnitOfWork::new(registry());
        let alice = user("alice");
        let admins = EntityRef::new(Entity::new("Group").with("code", "admins"));
        alice.write().collection_mut("groups").push(admins.clone());
        uow.persist(&alice).unwrap();

        let plan = uow.prepare_commit().unwrap();
        assert_eq!(plan.inserts.len(), 2);
        assert_eq!(plan.link_inserts.len(), 1);
        assert_eq!(uow.phase(), CommitPhase::Idle);
        assert_eq!(uow.state_of(&admins), LifecycleState::Managed);
    }

    #[test]
    fn test_commit_assigns_identity_and_version() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let backend = MemoryBackend::new();
        let mut uow = UnitOfWork::new(registry());
        let alice = user("alice");
        uow.persist(&alice).unwrap();

        rt.block_on(async {
            let report = unwrap_outcome(uow.commit(&cx, &backend).await);
            assert_eq!(report.inserted, 1);

            alice.set("name", "Alice");
            let report = unwrap_outcome(uow.commit(&cx, &backend).await);
            assert_eq!(report.updated, 1);
        });

        assert_eq!(alice.get("id"), Value::BigInt(1));
        assert_eq!(alice.get("version"), Value::BigInt(2));
        let row = backend.find("users", "id", &Value::BigInt(1)).unwrap();
        assert_eq!(row.get("name"), Some(&Value::from("Alice")));
        assert_eq!(row.get("version"), Some(&Value::BigInt(2)));
        let taken = uow.take_reconciled();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].0, OperationKind::Update);
    }

    #[test]
    fn test_failed_commit_poisons_until_clear() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let backend = MemoryBackend::new();
        backend.fail_operation(1);
        let mut uow = UnitOfWork::new(registry());
        uow.persist(&user("a")).unwrap();

        rt.block_on(async {
            match uow.commit(&cx, &backend).await {
                Outcome::Err(Error::BackendOperation(e)) => {
                    assert_eq!(e.operation, OperationKind::Insert);
                    assert_eq!(e.entity_type, "User");
                }
                other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
            }
            assert_eq!(uow.phase(), CommitPhase::Failed);
            assert!(matches!(uow.persist(&user("b")), Err(Error::SessionFailed)));
            assert!(matches!(
                uow.commit(&cx, &backend).await,
                Outcome::Err(Error::SessionFailed)
            ));
        });

        uow.clear();
        assert_eq!(uow.phase(), CommitPhase::Idle);
        uow.persist(&user("c")).unwrap();
    }
}
