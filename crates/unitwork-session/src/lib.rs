//! Session and Unit of Work for unitwork.
//!
//! `unitwork-session` is the **unit-of-work layer**. It coordinates entity
//! identity, change tracking and ordered persistence of dynamically-typed
//! entity graphs against a [`PersistenceBackend`].
//!
//! # Role In The Architecture
//!
//! - **Identity map**: a single in-memory instance per (root type, identity).
//! - **Change tracking**: snapshots taken when an entity becomes persistent,
//!   diffed at commit time.
//! - **Commit ordering**: parent rows before child rows, cycles broken with
//!   deferred foreign key updates, deletes child-first.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: nothing reaches the backend before `commit`.
//! - **Ownership clarity**: the session owns its backend and its unit of work.
//! - **Fail loudly**: a partial commit leaves the session `Failed` until
//!   `clear()`.
//! - **Cancel-correct**: commit uses `Cx` + `Outcome` and checks for
//!   cancellation between operations.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(registry, MemoryBackend::new());
//!
//! // New entities become managed (INSERTed on commit)
//! session.persist(&user)?;
//!
//! // Mark for deletion
//! session.remove(&old_address)?;
//!
//! // Write everything in dependency order
//! let report = session.commit(&cx).await;
//! ```

pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod unit_of_work;

pub use change_tracker::{
    Change, ChangeSet, ChangeTracker, EntitySnapshot, FieldSnapshot, compute_changes,
};
pub use flush::{CommitPlan, CommitReport, DependencyOrderer, PendingOp};
pub use identity_map::{EntityKey, IdentityMap};
pub use unit_of_work::{CommitPhase, PendingCounts, UnitOfWork};

use asupersync::{Cx, Outcome};
use serde::Deserialize;
use unitwork_core::{
    EntityRef, Error, LifecycleState, MetadataRegistry, OperationKind, PersistenceBackend,
    PrimaryKey, Result,
};

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` from a `BeforeCommit` callback aborts the commit.
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Type alias for entity lifecycle hooks.
type EntityHookFn = Box<dyn FnMut(&EntityRef) + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    commit_failed: Vec<SessionEventFn>,
    after_clear: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("commit_failed", &self.commit_failed.len())
            .field("after_clear", &self.after_clear.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::CommitFailed => &mut self.commit_failed,
            SessionEvent::AfterClear => &mut self.after_clear,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before a commit computes its plan.
    BeforeCommit,
    /// Fired after a commit completes successfully.
    AfterCommit,
    /// Fired after a commit fails or is cancelled.
    CommitFailed,
    /// Fired after `clear()`.
    AfterClear,
}

/// Entity lifecycle events, fired once per entity after reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityEvent {
    PostInsert,
    PostUpdate,
    PostRemove,
    PostDetach,
}

#[derive(Default)]
struct EntityHooks {
    post_insert: Vec<EntityHookFn>,
    post_update: Vec<EntityHookFn>,
    post_remove: Vec<EntityHookFn>,
    post_detach: Vec<EntityHookFn>,
}

impl EntityHooks {
    fn fire(&mut self, event: EntityEvent, entity: &EntityRef) {
        let hooks = match event {
            EntityEvent::PostInsert => &mut self.post_insert,
            EntityEvent::PostUpdate => &mut self.post_update,
            EntityEvent::PostRemove => &mut self.post_remove,
            EntityEvent::PostDetach => &mut self.post_detach,
        };
        for hook in hooks.iter_mut() {
            hook(entity);
        }
    }

    fn len(&self) -> usize {
        self.post_insert.len()
            + self.post_update.len()
            + self.post_remove.len()
            + self.post_detach.len()
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
///
/// Deserializes from JSON with every field optional:
///
/// ```ignore
/// let config: SessionConfig = serde_json::from_str(r#"{"sequence_start": 1000}"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// First value drawn from a named sequence.
    pub sequence_start: i64,
    /// Step between consecutive sequence values.
    pub sequence_increment: i64,
    /// Version written on insert for entities with a version field.
    pub initial_version: i64,
    /// Whether to fill owning references from inverse collections at commit.
    pub sync_inverse_sides: bool,
    /// Whether detached and cleared entities keep reporting `Detached`.
    pub track_detached: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sequence_start: 1,
            sequence_increment: 1,
            initial_version: 1,
            sync_inverse_sides: true,
            track_detached: true,
        }
    }
}

impl SessionConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the first sequence value (builder pattern).
    #[must_use]
    pub fn sequence_start(mut self, value: i64) -> Self {
        self.sequence_start = value;
        self
    }

    /// Set the sequence step (builder pattern).
    #[must_use]
    pub fn sequence_increment(mut self, value: i64) -> Self {
        self.sequence_increment = value;
        self
    }

    /// Set the initial row version (builder pattern).
    #[must_use]
    pub fn initial_version(mut self, value: i64) -> Self {
        self.initial_version = value;
        self
    }

    /// Enable or disable inverse-side synchronization (builder pattern).
    #[must_use]
    pub fn sync_inverse_sides(mut self, value: bool) -> Self {
        self.sync_inverse_sides = value;
        self
    }

    /// Enable or disable detached-instance tracking (builder pattern).
    #[must_use]
    pub fn track_detached(mut self, value: bool) -> Self {
        self.track_detached = value;
        self
    }

    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Session
// ============================================================================

/// A unit of work bound to a persistence backend.
pub struct Session<B: PersistenceBackend> {
    backend: B,
    uow: UnitOfWork,
    event_callbacks: SessionEventCallbacks,
    entity_hooks: EntityHooks,
}

impl<B: PersistenceBackend> std::fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uow", &self.uow)
            .field("event_callbacks", &self.event_callbacks)
            .field("entity_hooks", &self.entity_hooks.len())
            .finish_non_exhaustive()
    }
}

impl<B: PersistenceBackend> Session<B> {
    /// Create a new session over `backend`.
    pub fn new(registry: MetadataRegistry, backend: B) -> Self {
        Self::with_config(registry, backend, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(registry: MetadataRegistry, backend: B, config: SessionConfig) -> Self {
        Self {
            backend,
            uow: UnitOfWork::with_config(registry, config),
            event_callbacks: SessionEventCallbacks::default(),
            entity_hooks: EntityHooks::default(),
        }
    }

    /// Get a reference to the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        self.uow.config()
    }

    /// Get the underlying unit of work.
    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.uow
    }

    /// Get the metadata registry.
    pub fn registry(&self) -> &MetadataRegistry {
        self.uow.registry()
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before commit.
    ///
    /// The callback can abort the commit by returning `Err`.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_commit.push(Box::new(f));
    }

    /// Register a callback to run after a successful commit.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_commit.push(Box::new(f));
    }

    /// Register a callback to run after a failed or cancelled commit.
    pub fn on_commit_failed(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.commit_failed.push(Box::new(f));
    }

    /// Register a callback to run after `clear()`.
    pub fn on_after_clear(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_clear.push(Box::new(f));
    }

    /// Register an entity lifecycle hook.
    pub fn on_entity(&mut self, event: EntityEvent, f: impl FnMut(&EntityRef) + Send + 'static) {
        let hooks = match event {
            EntityEvent::PostInsert => &mut self.entity_hooks.post_insert,
            EntityEvent::PostUpdate => &mut self.entity_hooks.post_update,
            EntityEvent::PostRemove => &mut self.entity_hooks.post_remove,
            EntityEvent::PostDetach => &mut self.entity_hooks.post_detach,
        };
        hooks.push(Box::new(f));
    }

    // ========================================================================
    // Entity Tracking
    // ========================================================================

    /// Make a new entity managed. It is INSERTed on the next commit.
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        self.uow.persist(entity)
    }

    /// Schedule a managed entity for DELETE on the next commit.
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        self.uow.remove(entity)
    }

    /// Stop tracking an entity.
    pub fn detach(&mut self, entity: &EntityRef) -> bool {
        let detached = self.uow.detach(entity);
        if detached {
            self.entity_hooks.fire(EntityEvent::PostDetach, entity);
        }
        detached
    }

    /// Adopt an entity loaded outside the session as persistent.
    pub fn register_managed(&mut self, entity: &EntityRef) -> Result<()> {
        self.uow.register_managed(entity)
    }

    /// Drop all tracked state. Resets a failed session.
    pub fn clear(&mut self) {
        self.uow.clear();
        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterClear) {
            tracing::warn!(error = %e, "after_clear callback failed");
        }
    }

    /// Lifecycle state of `entity` in this session.
    pub fn state_of(&self, entity: &EntityRef) -> LifecycleState {
        self.uow.state_of(entity)
    }

    /// Whether `entity` is managed and not scheduled for removal.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.uow.contains(entity)
    }

    /// Look up a managed instance by identity.
    pub fn find(
        &self,
        entity_type: &str,
        identity: impl Into<PrimaryKey>,
    ) -> Result<Option<EntityRef>> {
        self.uow.find(entity_type, identity)
    }

    /// Read-only change set of a persistent entity.
    pub fn change_set(&self, entity: &EntityRef) -> Result<Option<ChangeSet>> {
        self.uow.change_set(entity)
    }

    /// Pending operation counts.
    pub fn pending_counts(&self) -> PendingCounts {
        self.uow.pending_counts()
    }

    /// Whether there is nothing to commit.
    pub fn is_clean(&self) -> bool {
        self.uow.pending_counts().is_empty()
    }

    /// Current commit phase.
    pub fn phase(&self) -> CommitPhase {
        self.uow.phase()
    }

    /// Compute the commit plan without executing it.
    pub fn prepare_commit(&mut self) -> Result<CommitPlan> {
        self.uow.prepare_commit()
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Commit all pending changes.
    ///
    /// Fires `BeforeCommit` first (an `Err` aborts the commit before any
    /// work), then entity hooks and `AfterCommit` on success, or
    /// `CommitFailed` on failure or cancellation.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<CommitReport, Error> {
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeCommit) {
            tracing::info!(error = %e, "Commit aborted by before_commit callback");
            return Outcome::Err(e);
        }

        let outcome = self.uow.commit(cx, &self.backend).await;
        let reconciled = self.uow.take_reconciled();
        for (operation, entity) in &reconciled {
            let event = match operation {
                OperationKind::Insert => EntityEvent::PostInsert,
                OperationKind::Update => EntityEvent::PostUpdate,
                OperationKind::Delete => EntityEvent::PostRemove,
                _ => continue,
            };
            self.entity_hooks.fire(event, entity);
        }

        match outcome {
            Outcome::Ok(report) => {
                if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterCommit) {
                    return Outcome::Err(e);
                }
                Outcome::Ok(report)
            }
            other => {
                if let Err(e) = self.event_callbacks.fire(SessionEvent::CommitFailed) {
                    tracing::warn!(error = %e, "commit_failed callback failed");
                }
                other
            }
        }
    }
}
