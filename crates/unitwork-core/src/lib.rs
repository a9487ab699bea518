//! Core types for the unitwork Unit of Work.
//!
//! This crate provides the building blocks the session layer works with:
//!
//! - `Value` and `PrimaryKey` for dynamically-typed field data
//! - `Entity` / `EntityRef` instances with explicit `Loaded | NotLoaded` relationship slots
//! - Mapping metadata (`EntityMeta`, `RelationshipMeta`) resolved into a `MetadataRegistry`
//! - The `PersistenceBackend` trait and an in-memory `MemoryBackend`
//! - `Outcome` re-export from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod backend;
pub mod entity;
pub mod error;
pub mod metadata;
pub mod value;

pub use backend::{
    Columns, DeleteRequest, ForeignKey, InsertRequest, JournalEntry, LinkRequest, MemoryBackend,
    OperationKind, PersistenceBackend, Row, UpdateRequest, VersionCheck,
};
pub use entity::{
    Collection, Entity, EntityId, EntityRef, LifecycleState, Reference, Relation, WeakEntityRef,
};
pub use error::{
    BackendOperationError, DependencyError, DependencyFailure, Error, IdentityConflict,
    MetadataError, OptimisticLockError, Result, StateTransitionError,
};
pub use metadata::{
    Cardinality, CascadeSet, Discriminator, EntityMapping, EntityMeta, FieldMeta, IdGenerator,
    InheritanceStrategy, LinkTable, MappedField, MappedRelationship, MetadataRegistry,
    RegistryBuilder, RelationshipMeta, SqlType,
};
pub use value::{PrimaryKey, Value};
