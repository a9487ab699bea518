//! Mapping metadata: entity types, fields, relationships and inheritance.
//!
//! Metadata is produced once by an external provider (derive macros, a
//! config file, hand-written builders) and handed to the session as a
//! read-only [`MetadataRegistry`]. The unit of work never inspects language
//! level reflection; everything it needs to know about a type lives here.
//!
//! # Example
//!
//! ```
//! use unitwork_core::metadata::*;
//!
//! let registry = MetadataRegistry::builder()
//!     .register(
//!         EntityMeta::new("User", "users")
//!             .identity(["id"])
//!             .id_generator(IdGenerator::Identity)
//!             .field(FieldMeta::new("id", SqlType::BigInt))
//!             .field(FieldMeta::new("name", SqlType::Text)),
//!     )
//!     .unwrap()
//!     .register(
//!         EntityMeta::new("Address", "addresses")
//!             .identity(["id"])
//!             .id_generator(IdGenerator::Identity)
//!             .field(FieldMeta::new("id", SqlType::BigInt))
//!             .relationship(RelationshipMeta::one_to_one("user", "User").required()),
//!     )
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! assert!(registry.mapping("Address").is_ok());
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Semantic type of a persistent scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    Boolean,
    Integer,
    BigInt,
    Double,
    Decimal,
    Text,
    Blob,
    Date,
    Timestamp,
    Uuid,
    Json,
}

/// Metadata about a persistent scalar field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    /// Field name on the entity.
    pub name: String,
    /// Database column name (may differ from field name).
    pub column: String,
    /// Semantic type of the field.
    pub sql_type: SqlType,
    /// Whether this field is nullable.
    pub nullable: bool,
}

impl FieldMeta {
    /// Create a non-nullable field whose column has the same name.
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            sql_type,
            nullable: false,
        }
    }

    /// Set the database column name.
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Set nullable flag.
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }
}

/// The type of relationship between two entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    /// One-to-one: `User` has one `Address`.
    OneToOne,
    /// Many-to-one: many `Hero`s belong to one `Team`.
    ManyToOne,
    /// One-to-many: one `Team` has many `Hero`s.
    OneToMany,
    /// Many-to-many: `Hero`s have many `Power`s via a link table.
    ManyToMany,
}

impl Cardinality {
    /// Single-valued relationship.
    pub const fn is_to_one(self) -> bool {
        matches!(self, Cardinality::OneToOne | Cardinality::ManyToOne)
    }

    /// Collection-valued relationship.
    pub const fn is_to_many(self) -> bool {
        !self.is_to_one()
    }
}

/// Which operations propagate along a relationship.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeSet {
    pub persist: bool,
    pub remove: bool,
}

impl CascadeSet {
    pub const NONE: Self = Self {
        persist: false,
        remove: false,
    };
    pub const PERSIST: Self = Self {
        persist: true,
        remove: false,
    };
    pub const REMOVE: Self = Self {
        persist: false,
        remove: true,
    };
    pub const ALL: Self = Self {
        persist: true,
        remove: true,
    };
}

/// Link table for an owning many-to-many relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTable {
    /// The link table name (e.g., `"hero_powers"`).
    pub table: String,
    /// Columns pointing at the owning entity, in its identity order.
    pub owner_columns: Vec<String>,
    /// Columns pointing at the target entity, in its identity order.
    pub target_columns: Vec<String>,
    /// Column storing the member position of ordered collections.
    #[serde(default)]
    pub position_column: Option<String>,
}

impl LinkTable {
    /// Single-column link table.
    pub fn new(
        table: impl Into<String>,
        owner_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            owner_columns: vec![owner_column.into()],
            target_columns: vec![target_column.into()],
            position_column: None,
        }
    }

    /// Store member positions in `column`.
    pub fn position(mut self, column: impl Into<String>) -> Self {
        self.position_column = Some(column.into());
        self
    }
}

/// Metadata about a relationship to another entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipMeta {
    /// Name of the relationship slot on the entity.
    pub name: String,
    /// Target entity type.
    pub target: String,
    /// Kind of relationship.
    pub cardinality: Cardinality,
    /// Whether this side holds the foreign key (or link table).
    pub owning: bool,
    /// FK columns on the owning side, in the target's identity order.
    pub join_columns: Vec<String>,
    /// Whether the FK may be NULL.
    pub nullable: bool,
    /// Cascaded operations.
    pub cascade: CascadeSet,
    /// Delete the target when it is detached from this side.
    pub orphan_removal: bool,
    /// Relationship on the target that owns this association (inverse sides).
    pub mapped_by: Option<String>,
    /// Member order is significant (explicit position).
    pub ordered: bool,
    /// Link table for owning many-to-many relationships.
    pub link_table: Option<LinkTable>,
}

impl RelationshipMeta {
    fn base(name: String, target: String, cardinality: Cardinality, owning: bool) -> Self {
        Self {
            name,
            target,
            cardinality,
            owning,
            join_columns: Vec::new(),
            nullable: true,
            cascade: CascadeSet::NONE,
            orphan_removal: false,
            mapped_by: None,
            ordered: false,
            link_table: None,
        }
    }

    /// Owning many-to-one; the FK column defaults to `<name>_id`.
    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        let name = name.into();
        let mut rel = Self::base(name.clone(), target.into(), Cardinality::ManyToOne, true);
        rel.join_columns = vec![format!("{}_id", name)];
        rel
    }

    /// Owning one-to-one; the FK column defaults to `<name>_id`.
    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        let name = name.into();
        let mut rel = Self::base(name.clone(), target.into(), Cardinality::OneToOne, true);
        rel.join_columns = vec![format!("{}_id", name)];
        rel
    }

    /// Inverse one-to-one, owned by `mapped_by` on the target.
    pub fn one_to_one_inverse(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        let mut rel = Self::base(name.into(), target.into(), Cardinality::OneToOne, false);
        rel.mapped_by = Some(mapped_by.into());
        rel
    }

    /// Inverse one-to-many, owned by the many-to-one `mapped_by` on the target.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        let mut rel = Self::base(name.into(), target.into(), Cardinality::OneToMany, false);
        rel.mapped_by = Some(mapped_by.into());
        rel
    }

    /// Owning many-to-many through a link table.
    pub fn many_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        link_table: LinkTable,
    ) -> Self {
        let mut rel = Self::base(name.into(), target.into(), Cardinality::ManyToMany, true);
        rel.link_table = Some(link_table);
        rel
    }

    /// Inverse many-to-many, owned by `mapped_by` on the target.
    pub fn many_to_many_inverse(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        let mut rel = Self::base(name.into(), target.into(), Cardinality::ManyToMany, false);
        rel.mapped_by = Some(mapped_by.into());
        rel
    }

    /// Set the FK column.
    pub fn join_column(mut self, column: impl Into<String>) -> Self {
        self.join_columns = vec![column.into()];
        self
    }

    /// Set composite FK columns (target identity order).
    pub fn join_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.join_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the FK as required (NOT NULL).
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Set nullable flag.
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set cascaded operations.
    pub fn cascade(mut self, cascade: CascadeSet) -> Self {
        self.cascade = cascade;
        self
    }

    /// Enable orphan removal.
    pub fn orphan_removal(mut self) -> Self {
        self.orphan_removal = true;
        self
    }

    /// Mark the collection as ordered.
    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    /// Whether this side writes an FK column on its own row.
    pub fn writes_foreign_key(&self) -> bool {
        self.owning && self.cardinality.is_to_one()
    }

    /// Whether removing an entity removes the targets of this relationship.
    ///
    /// Orphan removal implies cascading removal.
    pub fn cascades_remove(&self) -> bool {
        self.cascade.remove || self.orphan_removal
    }
}

/// How identities are produced.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IdGenerator {
    /// The backend generates the identity on insert.
    #[default]
    Identity,
    /// The session draws the identity from a named sequence before insert.
    Sequence(String),
    /// The caller assigns the identity.
    Assigned,
}

impl IdGenerator {
    /// Whether the identity only exists after the insert ran.
    pub const fn is_post_insert(&self) -> bool {
        matches!(self, IdGenerator::Identity)
    }
}

/// Inheritance mapping strategy, declared on the hierarchy root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InheritanceStrategy {
    /// No inheritance.
    #[default]
    None,
    /// Whole hierarchy in the root's table, told apart by a discriminator.
    SingleTable,
    /// One table per type, joined on the identity columns.
    Joined,
    /// One complete table per concrete type.
    PerClass,
}

/// Discriminator column/value for single-table and joined hierarchies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discriminator {
    pub column: String,
    pub value: String,
}

/// Mapping metadata for one entity type as declared by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMeta {
    /// Entity type name.
    pub name: String,
    /// Table name.
    pub table: String,
    /// Identity field names (empty for subtypes, which inherit the root's).
    pub identity: Vec<String>,
    /// Identity generation strategy.
    pub id_generator: IdGenerator,
    /// Declared scalar fields.
    pub fields: Vec<FieldMeta>,
    /// Declared relationships.
    pub relationships: Vec<RelationshipMeta>,
    /// Strategy (meaningful on hierarchy roots).
    pub inheritance: InheritanceStrategy,
    /// Parent type, for subtypes.
    pub parent: Option<String>,
    /// Discriminator for this type.
    pub discriminator: Option<Discriminator>,
    /// Optimistic-lock version field.
    pub version_field: Option<String>,
}

impl EntityMeta {
    /// Create metadata for a type mapped to `table`.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            identity: Vec::new(),
            id_generator: IdGenerator::default(),
            fields: Vec::new(),
            relationships: Vec::new(),
            inheritance: InheritanceStrategy::None,
            parent: None,
            discriminator: None,
            version_field: None,
        }
    }

    /// Set the identity fields.
    pub fn identity<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identity = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Set the identity generator.
    pub fn id_generator(mut self, generator: IdGenerator) -> Self {
        self.id_generator = generator;
        self
    }

    /// Add a scalar field.
    pub fn field(mut self, field: FieldMeta) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a relationship.
    pub fn relationship(mut self, relationship: RelationshipMeta) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Declare this type as an inheritance root.
    pub fn inheritance(mut self, strategy: InheritanceStrategy) -> Self {
        self.inheritance = strategy;
        self
    }

    /// Declare this type as a subtype of `parent`.
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Set the discriminator column/value.
    pub fn discriminator(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.discriminator = Some(Discriminator {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    /// Set the optimistic-lock version field.
    pub fn version(mut self, field: impl Into<String>) -> Self {
        self.version_field = Some(field.into());
        self
    }
}

/// A field resolved against the hierarchy: which table stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedField {
    pub meta: FieldMeta,
    pub table: String,
}

/// A relationship resolved against the hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRelationship {
    pub meta: RelationshipMeta,
    /// Table holding the FK columns of owning to-one relationships.
    pub table: String,
}

/// Fully resolved mapping of one entity type.
#[derive(Debug, Clone)]
pub struct EntityMapping {
    /// Entity type name.
    pub name: String,
    /// Hierarchy root (self when not a subtype).
    pub root: String,
    /// Ancestors, root first, excluding self.
    pub ancestors: Vec<String>,
    /// Effective inheritance strategy (the root's).
    pub strategy: InheritanceStrategy,
    /// Identity field names (the root's).
    pub identity: Vec<String>,
    /// Identity column names, parallel to `identity`.
    pub identity_columns: Vec<String>,
    /// Identity generator (the root's).
    pub id_generator: IdGenerator,
    /// Effective scalar fields, ancestors' first.
    pub fields: Vec<MappedField>,
    /// Effective relationships, ancestors' first.
    pub relationships: Vec<MappedRelationship>,
    /// Optimistic-lock version field.
    pub version_field: Option<String>,
    /// Discriminator written on insert.
    pub discriminator: Option<Discriminator>,
    /// Tables written for one row, in insert order.
    pub tables: Vec<String>,
    /// Node of the type dependency graph this type belongs to.
    pub graph_node: String,
}

impl EntityMapping {
    /// Look up a field.
    pub fn field(&self, name: &str) -> Option<&MappedField> {
        self.fields.iter().find(|f| f.meta.name == name)
    }

    /// Look up a relationship.
    pub fn relationship(&self, name: &str) -> Option<&MappedRelationship> {
        self.relationships.iter().find(|r| r.meta.name == name)
    }

    /// Whether `name` is one of the identity fields.
    pub fn is_identity_field(&self, name: &str) -> bool {
        self.identity.iter().any(|f| f == name)
    }

    /// The table a row of this type is primarily stored in.
    pub fn primary_table(&self) -> &str {
        self.tables.last().map_or("", String::as_str)
    }
}

/// Builder that validates metadata as it is registered.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    declared: Vec<EntityMeta>,
}

impl RegistryBuilder {
    /// Register one entity type.
    ///
    /// Checks everything that can be known from this type alone; cross-type
    /// checks run in [`RegistryBuilder::build`].
    pub fn register(mut self, meta: EntityMeta) -> Result<Self> {
        if meta.name.is_empty() {
            return Err(Error::metadata("<unnamed>", "entity type name is empty"));
        }
        if self.declared.iter().any(|m| m.name == meta.name) {
            return Err(Error::metadata(&meta.name, "entity type registered twice"));
        }
        if meta.parent.is_none() {
            if meta.identity.is_empty() {
                return Err(Error::metadata(&meta.name, "no identity fields declared"));
            }
            for id in &meta.identity {
                if !meta.fields.iter().any(|f| &f.name == id) {
                    return Err(Error::metadata(
                        &meta.name,
                        format!("identity field '{}' is not a declared field", id),
                    ));
                }
            }
            if meta.id_generator != IdGenerator::Assigned && meta.identity.len() > 1 {
                return Err(Error::metadata(
                    &meta.name,
                    "generated identity requires a single identity field",
                ));
            }
        } else if !meta.identity.is_empty() {
            return Err(Error::metadata(
                &meta.name,
                "subtypes inherit their identity from the hierarchy root",
            ));
        }

        let mut seen = HashSet::new();
        for name in meta
            .fields
            .iter()
            .map(|f| &f.name)
            .chain(meta.relationships.iter().map(|r| &r.name))
        {
            if !seen.insert(name.as_str()) {
                return Err(Error::metadata(
                    &meta.name,
                    format!("field or relationship '{}' declared twice", name),
                ));
            }
        }

        for rel in &meta.relationships {
            Self::check_relationship_shape(&meta.name, rel)?;
        }

        tracing::debug!(entity_type = %meta.name, table = %meta.table, "Registered entity metadata");
        self.declared.push(meta);
        Ok(self)
    }

    fn check_relationship_shape(entity: &str, rel: &RelationshipMeta) -> Result<()> {
        match (rel.cardinality, rel.owning) {
            (Cardinality::ManyToOne, false) => Err(Error::metadata(
                entity,
                format!("many-to-one '{}' must be the owning side", rel.name),
            )),
            (Cardinality::OneToMany, true) => Err(Error::metadata(
                entity,
                format!("one-to-many '{}' must be an inverse side", rel.name),
            )),
            (Cardinality::ManyToMany, true) if rel.link_table.is_none() => Err(Error::metadata(
                entity,
                format!("many-to-many '{}' needs a link table", rel.name),
            )),
            (_, false) if rel.mapped_by.is_none() => Err(Error::metadata(
                entity,
                format!("inverse relationship '{}' needs mapped_by", rel.name),
            )),
            (c, true) if c.is_to_one() && rel.join_columns.is_empty() => Err(Error::metadata(
                entity,
                format!("owning relationship '{}' has no join columns", rel.name),
            )),
            _ => Ok(()),
        }
    }

    /// Resolve inheritance and cross-type references.
    pub fn build(self) -> Result<MetadataRegistry> {
        let by_name: HashMap<&str, &EntityMeta> =
            self.declared.iter().map(|m| (m.name.as_str(), m)).collect();

        let mut mappings = Vec::with_capacity(self.declared.len());
        for meta in &self.declared {
            mappings.push(Self::resolve(meta, &by_name)?);
        }

        let registry = MetadataRegistry {
            index: mappings
                .iter()
                .enumerate()
                .map(|(i, m)| (m.name.clone(), i))
                .collect(),
            mappings,
        };
        registry.check_relationships()?;

        tracing::info!(entity_types = registry.len(), "Metadata registry built");
        Ok(registry)
    }

    fn resolve(meta: &EntityMeta, by_name: &HashMap<&str, &EntityMeta>) -> Result<EntityMapping> {
        // Walk up to the root, guarding against parent cycles.
        let mut chain: Vec<&EntityMeta> = vec![meta];
        let mut visited: HashSet<&str> = HashSet::from([meta.name.as_str()]);
        while let Some(parent) = chain.last().and_then(|m| m.parent.as_deref()) {
            let Some(parent_meta) = by_name.get(parent) else {
                return Err(Error::metadata(
                    &meta.name,
                    format!("parent type '{}' is not registered", parent),
                ));
            };
            if !visited.insert(parent) {
                return Err(Error::metadata(&meta.name, "inheritance cycle"));
            }
            chain.push(parent_meta);
        }
        chain.reverse();
        let root = chain[0];

        if chain.len() > 1 && root.inheritance == InheritanceStrategy::None {
            return Err(Error::metadata(
                &meta.name,
                format!("root '{}' declares no inheritance strategy", root.name),
            ));
        }
        let strategy = root.inheritance;

        let table_of = |declaring: &EntityMeta| -> String {
            match strategy {
                InheritanceStrategy::SingleTable => root.table.clone(),
                InheritanceStrategy::Joined => declaring.table.clone(),
                InheritanceStrategy::None | InheritanceStrategy::PerClass => meta.table.clone(),
            }
        };

        let mut fields = Vec::new();
        let mut relationships = Vec::new();
        let mut names = HashSet::new();
        for declaring in &chain {
            for field in &declaring.fields {
                if !names.insert(field.name.clone()) {
                    return Err(Error::metadata(
                        &meta.name,
                        format!("field '{}' redeclared in hierarchy", field.name),
                    ));
                }
                fields.push(MappedField {
                    meta: field.clone(),
                    table: table_of(declaring),
                });
            }
            for rel in &declaring.relationships {
                if !names.insert(rel.name.clone()) {
                    return Err(Error::metadata(
                        &meta.name,
                        format!("relationship '{}' redeclared in hierarchy", rel.name),
                    ));
                }
                relationships.push(MappedRelationship {
                    meta: rel.clone(),
                    table: table_of(declaring),
                });
            }
        }

        let identity = root.identity.clone();
        let identity_columns = identity
            .iter()
            .map(|id| {
                fields
                    .iter()
                    .find(|f| &f.meta.name == id)
                    .map(|f| f.meta.column.clone())
                    .ok_or_else(|| {
                        Error::metadata(&meta.name, format!("identity field '{}' missing", id))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let version_field = chain.iter().rev().find_map(|m| m.version_field.clone());
        if let Some(version) = &version_field {
            if !fields.iter().any(|f| &f.meta.name == version) {
                return Err(Error::metadata(
                    &meta.name,
                    format!("version field '{}' is not a declared field", version),
                ));
            }
        }

        let tables = match strategy {
            InheritanceStrategy::Joined => chain.iter().map(|m| m.table.clone()).collect(),
            InheritanceStrategy::SingleTable => vec![root.table.clone()],
            InheritanceStrategy::None | InheritanceStrategy::PerClass => vec![meta.table.clone()],
        };

        let graph_node = match strategy {
            InheritanceStrategy::SingleTable => root.name.clone(),
            _ => meta.name.clone(),
        };

        Ok(EntityMapping {
            name: meta.name.clone(),
            root: root.name.clone(),
            ancestors: chain[..chain.len() - 1]
                .iter()
                .map(|m| m.name.clone())
                .collect(),
            strategy,
            identity,
            identity_columns,
            id_generator: root.id_generator.clone(),
            fields,
            relationships,
            version_field,
            discriminator: meta.discriminator.clone(),
            tables,
            graph_node,
        })
    }
}

/// Read-only registry of resolved entity mappings, scoped to a session.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    mappings: Vec<EntityMapping>,
    index: HashMap<String, usize>,
}

impl MetadataRegistry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look up the mapping for an entity type.
    pub fn mapping(&self, entity_type: &str) -> Result<&EntityMapping> {
        self.index
            .get(entity_type)
            .map(|&i| &self.mappings[i])
            .ok_or_else(|| Error::metadata(entity_type, "entity type is not registered"))
    }

    /// Whether `entity_type` is registered.
    pub fn contains(&self, entity_type: &str) -> bool {
        self.index.contains_key(entity_type)
    }

    /// Registration position, used for deterministic ordering.
    pub fn position(&self, entity_type: &str) -> Option<usize> {
        self.index.get(entity_type).copied()
    }

    /// All mappings in registration order.
    pub fn mappings(&self) -> impl Iterator<Item = &EntityMapping> {
        self.mappings.iter()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Whether no types are registered.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Whether `entity_type` is `ancestor` or one of its subtypes.
    pub fn is_a(&self, entity_type: &str, ancestor: &str) -> bool {
        if entity_type == ancestor {
            return true;
        }
        self.mapping(entity_type)
            .is_ok_and(|m| m.ancestors.iter().any(|a| a == ancestor))
    }

    fn check_relationships(&self) -> Result<()> {
        for mapping in &self.mappings {
            for mapped in &mapping.relationships {
                let rel = &mapped.meta;
                let target = self.mapping(&rel.target).map_err(|_| {
                    Error::metadata(
                        &mapping.name,
                        format!(
                            "relationship '{}' targets unregistered type '{}'",
                            rel.name, rel.target
                        ),
                    )
                })?;

                if rel.writes_foreign_key() && rel.join_columns.len() != target.identity.len() {
                    return Err(Error::metadata(
                        &mapping.name,
                        format!(
                            "relationship '{}' has {} join columns but '{}' has {} identity fields",
                            rel.name,
                            rel.join_columns.len(),
                            target.name,
                            target.identity.len()
                        ),
                    ));
                }

                if let Some(link) = rel.link_table.as_ref().filter(|_| rel.owning) {
                    if link.owner_columns.len() != mapping.identity.len()
                        || link.target_columns.len() != target.identity.len()
                    {
                        return Err(Error::metadata(
                            &mapping.name,
                            format!(
                                "link table '{}' columns do not match identities",
                                link.table
                            ),
                        ));
                    }
                }

                if let Some(mapped_by) = rel.mapped_by.as_deref().filter(|_| !rel.owning) {
                    let owning = target.relationship(mapped_by).ok_or_else(|| {
                        Error::metadata(
                            &mapping.name,
                            format!(
                                "relationship '{}' is mapped by '{}.{}' which does not exist",
                                rel.name, target.name, mapped_by
                            ),
                        )
                    })?;
                    if !owning.meta.owning {
                        return Err(Error::metadata(
                            &mapping.name,
                            format!(
                                "relationship '{}' is mapped by '{}.{}' which is not an owning side",
                                rel.name, target.name, mapped_by
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
