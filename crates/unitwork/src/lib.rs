//! unitwork - a Unit of Work for relational entity graphs.
//!
//! unitwork sits between application code and a relational persistence
//! backend, providing:
//!
//! - An identity map (one in-memory instance per identity)
//! - Snapshot-based dirty checking
//! - Cascade persist/remove and orphan removal
//! - Foreign-key-ordered commits, with cycles broken by deferred updates
//! - Single-table and joined inheritance, optimistic versioning and
//!   many-to-many link tables
//!
//! # Quick Start
//!
//! ```ignore
//! use unitwork::prelude::*;
//!
//! let registry = MetadataRegistry::builder()
//!     .register(
//!         EntityMeta::new("User", "users")
//!             .identity(["id"])
//!             .field(FieldMeta::new("id", SqlType::BigInt))
//!             .field(FieldMeta::new("name", SqlType::Text)),
//!     )?
//!     .register(
//!         EntityMeta::new("Address", "addresses")
//!             .identity(["id"])
//!             .field(FieldMeta::new("id", SqlType::BigInt))
//!             .relationship(RelationshipMeta::many_to_one("user", "User").required()),
//!     )?
//!     .build()?;
//!
//! async fn save(cx: &Cx, registry: MetadataRegistry) {
//!     let mut session = Session::new(registry, MemoryBackend::new());
//!
//!     let user = EntityRef::new(Entity::new("User").with("name", "alice"));
//!     let address = EntityRef::new(
//!         Entity::new("Address").with_reference("user", Some(user.clone())),
//!     );
//!     session.persist(&user).unwrap();
//!     session.persist(&address).unwrap();
//!
//!     // INSERT users, then INSERT addresses with the generated user id
//!     let report = session.commit(cx).await;
//! }
//! ```

// Re-export all public types from sub-crates
pub use unitwork_core::{
    BackendOperationError, Cardinality, CascadeSet, Collection, Columns, DeleteRequest,
    DependencyError, DependencyFailure, Discriminator, Entity, EntityId, EntityMapping,
    EntityMeta, EntityRef, Error, FieldMeta, ForeignKey, IdGenerator, IdentityConflict,
    InheritanceStrategy, InsertRequest, JournalEntry, LifecycleState, LinkRequest, LinkTable,
    MappedField, MappedRelationship, MemoryBackend, MetadataError, MetadataRegistry,
    OperationKind, OptimisticLockError, PersistenceBackend, PrimaryKey, Reference,
    RegistryBuilder, Relation, RelationshipMeta, Result, Row, SqlType, StateTransitionError,
    UpdateRequest, Value, VersionCheck, WeakEntityRef,
};

pub use unitwork_session::{
    Change, ChangeSet, ChangeTracker, CommitPhase, CommitPlan, CommitReport, DependencyOrderer,
    EntityEvent, EntityKey, EntitySnapshot, FieldSnapshot, IdentityMap, PendingCounts,
    PendingOp, Session, SessionConfig, SessionEvent, SessionEventCallbacks, UnitOfWork,
    compute_changes,
};

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use unitwork::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CascadeSet,
        // asupersync
        Cx,
        // Entities
        Entity,
        EntityMeta,
        EntityRef,
        Error,
        FieldMeta,
        IdGenerator,
        InheritanceStrategy,
        LifecycleState,
        LinkTable,
        // Backend
        MemoryBackend,
        // Metadata
        MetadataRegistry,
        Outcome,
        PersistenceBackend,
        PrimaryKey,
        Reference,
        RelationshipMeta,
        Result,
        // Session
        Session,
        SessionConfig,
        SqlType,
        UnitOfWork,
        Value,
    };
}
