//! Commit operation ordering for the unit of work.
//!
//! This module decides the order in which pending changes reach the backend:
//! - INSERT parent-first (topological order of the type dependency graph)
//! - DELETE child-first (the reverse)
//! - foreign keys inside a dependency cycle are written NULL on insert and
//!   patched by a deferred update once every row exists
//!
//! The type graph has an edge `A -> B` when `A` owns a to-one foreign key to
//! `B`. Joined-inheritance subtypes depend on their parent type; single-table
//! subtypes share their root's node.

use crate::change_tracker::ChangeSet;
use std::collections::{BTreeSet, HashMap};
use unitwork_core::{EntityRef, InheritanceStrategy, MetadataRegistry, OperationKind};

/// Dependency graph over entity types, with its insert order precomputed.
#[derive(Debug, Default, Clone)]
pub struct DependencyOrderer {
    /// Graph nodes in registration order.
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    /// `edges[a]` holds the nodes `a` depends on.
    edges: Vec<BTreeSet<usize>>,
    /// Strongly connected component of each node.
    component: Vec<usize>,
    /// Whether each component is a cycle (more than one node, or a self-loop).
    cyclic: Vec<bool>,
    /// Insert rank of each node.
    rank: Vec<usize>,
}

impl DependencyOrderer {
    /// Build the type graph for every mapping in `registry`.
    #[tracing::instrument(level = "debug", skip(registry))]
    pub fn new(registry: &MetadataRegistry) -> Self {
        let mut orderer = Self::default();
        for mapping in registry.mappings() {
            orderer.add_node(&mapping.graph_node);
        }

        for mapping in registry.mappings() {
            let from = orderer.index[&mapping.graph_node];
            for rel in &mapping.relationships {
                if !rel.meta.writes_foreign_key() {
                    continue;
                }
                if let Ok(target) = registry.mapping(&rel.meta.target) {
                    let to = orderer.index[&target.graph_node];
                    orderer.edges[from].insert(to);
                }
            }
            if mapping.strategy == InheritanceStrategy::Joined {
                if let Some(parent) = mapping.ancestors.last() {
                    if let Ok(parent) = registry.mapping(parent) {
                        let to = orderer.index[&parent.graph_node];
                        orderer.edges[from].insert(to);
                    }
                }
            }
        }

        orderer.compute_components();
        orderer.compute_ranks();

        tracing::debug!(
            nodes = orderer.nodes.len(),
            order = ?orderer.insert_order(),
            "Dependency order computed"
        );
        orderer
    }

    fn add_node(&mut self, name: &str) {
        if self.index.contains_key(name) {
            return;
        }
        self.index.insert(name.to_string(), self.nodes.len());
        self.nodes.push(name.to_string());
        self.edges.push(BTreeSet::new());
    }

    /// Tarjan's algorithm; components are numbered in discovery order.
    fn compute_components(&mut self) {
        struct Tarjan<'a> {
            edges: &'a [BTreeSet<usize>],
            counter: usize,
            index: Vec<Option<usize>>,
            low: Vec<usize>,
            on_stack: Vec<bool>,
            stack: Vec<usize>,
            component: Vec<usize>,
            components: usize,
        }

        impl Tarjan<'_> {
            fn visit(&mut self, v: usize) {
                self.index[v] = Some(self.counter);
                self.low[v] = self.counter;
                self.counter += 1;
                self.stack.push(v);
                self.on_stack[v] = true;

                let edges = self.edges;
                for &w in &edges[v] {
                    match self.index[w] {
                        None => {
                            self.visit(w);
                            self.low[v] = self.low[v].min(self.low[w]);
                        }
                        Some(w_index) if self.on_stack[w] => {
                            self.low[v] = self.low[v].min(w_index);
                        }
                        Some(_) => {}
                    }
                }

                if Some(self.low[v]) == self.index[v] {
                    while let Some(w) = self.stack.pop() {
                        self.on_stack[w] = false;
                        self.component[w] = self.components;
                        if w == v {
                            break;
                        }
                    }
                    self.components += 1;
                }
            }
        }

        let n = self.nodes.len();
        let mut tarjan = Tarjan {
            edges: &self.edges,
            counter: 0,
            index: vec![None; n],
            low: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            component: vec![0; n],
            components: 0,
        };
        for v in 0..n {
            if tarjan.index[v].is_none() {
                tarjan.visit(v);
            }
        }

        let mut sizes = vec![0usize; tarjan.components];
        for &c in &tarjan.component {
            sizes[c] += 1;
        }
        let mut cyclic: Vec<bool> = sizes.iter().map(|&s| s > 1).collect();
        for (v, deps) in self.edges.iter().enumerate() {
            if deps.contains(&v) {
                cyclic[tarjan.component[v]] = true;
            }
        }

        self.component = tarjan.component;
        self.cyclic = cyclic;
    }

    /// Kahn's algorithm on the condensation. Ties (and nodes inside one
    /// component) are broken by registration order.
    fn compute_ranks(&mut self) {
        let n = self.nodes.len();
        let components = self.cyclic.len();

        let mut members: Vec<Vec<usize>> = vec![Vec::new(); components];
        for v in 0..n {
            members[self.component[v]].push(v);
        }

        // Component c waits on every distinct component it depends on.
        let mut waiting: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); components];
        let mut dependents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); components];
        for (v, deps) in self.edges.iter().enumerate() {
            let cv = self.component[v];
            for &w in deps {
                let cw = self.component[w];
                if cv != cw {
                    waiting[cv].insert(cw);
                    dependents[cw].insert(cv);
                }
            }
        }

        // Ready components keyed by their first registered node.
        let mut ready: BTreeSet<(usize, usize)> = (0..components)
            .filter(|&c| waiting[c].is_empty())
            .map(|c| (members[c][0], c))
            .collect();

        let mut rank = vec![0; n];
        let mut next = 0;
        while let Some((first, c)) = ready.pop_first() {
            debug_assert_eq!(first, members[c][0]);
            for &v in &members[c] {
                rank[v] = next;
                next += 1;
            }
            for &d in &dependents[c] {
                waiting[d].remove(&c);
                if waiting[d].is_empty() {
                    ready.insert((members[d][0], d));
                }
            }
        }

        self.rank = rank;
    }

    /// Insert rank of a graph node; unknown nodes sort last.
    pub fn insert_rank(&self, node: &str) -> usize {
        self.index
            .get(node)
            .map_or(usize::MAX, |&v| self.rank[v])
    }

    /// Whether the edge `from -> to` lies inside a dependency cycle.
    pub fn is_cyclic_edge(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => {
                self.component[a] == self.component[b]
                    && self.cyclic[self.component[a]]
                    && (a != b || self.edges[a].contains(&a))
            }
            _ => false,
        }
    }

    /// Whether a node references itself.
    pub fn is_self_referencing(&self, node: &str) -> bool {
        self.index
            .get(node)
            .is_some_and(|&v| self.edges[v].contains(&v))
    }

    /// Graph nodes in insert order.
    pub fn insert_order(&self) -> Vec<&str> {
        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by_key(|&v| self.rank[v]);
        order.iter().map(|&v| self.nodes[v].as_str()).collect()
    }

    /// Graph nodes in delete order (reverse insert order).
    pub fn delete_order(&self) -> Vec<&str> {
        let mut order = self.insert_order();
        order.reverse();
        order
    }
}

/// A pending backend operation.
///
/// Operations hold the entity itself; column values are read when the
/// operation is dispatched, so identities generated by earlier inserts are
/// visible to later ones.
#[derive(Debug, Clone)]
pub enum PendingOp {
    /// Insert a new entity.
    Insert {
        entity: EntityRef,
        entity_type: String,
        /// Relationships whose foreign key is written NULL and patched later.
        deferred: Vec<String>,
    },
    /// Write foreign keys that were NULL on insert.
    DeferredUpdate {
        entity: EntityRef,
        entity_type: String,
        relationships: Vec<String>,
    },
    /// Insert a link-table row.
    LinkInsert {
        owner: EntityRef,
        entity_type: String,
        relationship: String,
        target: EntityRef,
        position: Option<usize>,
    },
    /// Update the changed columns of a persistent entity.
    Update {
        entity: EntityRef,
        entity_type: String,
        changes: ChangeSet,
    },
    /// Delete a link-table row.
    LinkDelete {
        owner: EntityRef,
        entity_type: String,
        relationship: String,
        target: EntityRef,
    },
    /// Delete a removed entity.
    Delete {
        entity: EntityRef,
        entity_type: String,
    },
}

impl PendingOp {
    /// Operation kind.
    pub fn kind(&self) -> OperationKind {
        match self {
            PendingOp::Insert { .. } => OperationKind::Insert,
            PendingOp::DeferredUpdate { .. } => OperationKind::DeferredUpdate,
            PendingOp::LinkInsert { .. } => OperationKind::LinkInsert,
            PendingOp::Update { .. } => OperationKind::Update,
            PendingOp::LinkDelete { .. } => OperationKind::LinkDelete,
            PendingOp::Delete { .. } => OperationKind::Delete,
        }
    }

    /// Concrete type of the entity (the owner, for link operations).
    pub fn entity_type(&self) -> &str {
        match self {
            PendingOp::Insert { entity_type, .. }
            | PendingOp::DeferredUpdate { entity_type, .. }
            | PendingOp::LinkInsert { entity_type, .. }
            | PendingOp::Update { entity_type, .. }
            | PendingOp::LinkDelete { entity_type, .. }
            | PendingOp::Delete { entity_type, .. } => entity_type,
        }
    }

    /// The entity the operation writes (the owner, for link operations).
    pub fn entity(&self) -> &EntityRef {
        match self {
            PendingOp::Insert { entity, .. }
            | PendingOp::DeferredUpdate { entity, .. }
            | PendingOp::Update { entity, .. }
            | PendingOp::Delete { entity, .. } => entity,
            PendingOp::LinkInsert { owner, .. } | PendingOp::LinkDelete { owner, .. } => owner,
        }
    }

    /// Check if this is an insert operation.
    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    /// Check if this is an update operation.
    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    /// Check if this is a delete operation.
    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. })
    }
}

/// The ordered operations of one commit, grouped by phase.
#[derive(Debug, Default, Clone)]
pub struct CommitPlan {
    /// Inserts, parent-first.
    pub inserts: Vec<PendingOp>,
    /// Follow-up foreign key updates for cyclic inserts.
    pub deferred_updates: Vec<PendingOp>,
    /// Link rows removed from many-to-many collections.
    pub link_deletes: Vec<PendingOp>,
    /// Link rows added to many-to-many collections.
    pub link_inserts: Vec<PendingOp>,
    /// Updates of dirty persistent entities.
    pub updates: Vec<PendingOp>,
    /// Deletes, child-first.
    pub deletes: Vec<PendingOp>,
}

impl CommitPlan {
    /// Create an empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the plan has any operations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of operations in the plan.
    pub fn len(&self) -> usize {
        self.inserts.len()
            + self.deferred_updates.len()
            + self.link_deletes.len()
            + self.link_inserts.len()
            + self.updates.len()
            + self.deletes.len()
    }

    /// Every operation in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingOp> {
        self.inserts
            .iter()
            .chain(&self.deferred_updates)
            .chain(&self.link_deletes)
            .chain(&self.link_inserts)
            .chain(&self.updates)
            .chain(&self.deletes)
    }

    /// `(kind, entity type)` of every operation in dispatch order.
    pub fn summary(&self) -> Vec<(OperationKind, String)> {
        self.iter()
            .map(|op| (op.kind(), op.entity_type().to_string()))
            .collect()
    }
}

/// Counts of operations executed by a successful commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub inserted: usize,
    pub deferred_updates: usize,
    pub links_inserted: usize,
    pub updated: usize,
    pub links_deleted: usize,
    pub deleted: usize,
}

impl CommitReport {
    /// Total operations executed.
    pub fn total(&self) -> usize {
        self.inserted
            + self.deferred_updates
            + self.links_inserted
            + self.updated
            + self.links_deleted
            + self.deleted
    }

    pub(crate) fn record(&mut self, kind: OperationKind) {
        match kind {
            OperationKind::Insert => self.inserted += 1,
            OperationKind::DeferredUpdate => self.deferred_updates += 1,
            OperationKind::LinkInsert => self.links_inserted += 1,
            OperationKind::Update => self.updated += 1,
            OperationKind::LinkDelete => self.links_deleted += 1,
            OperationKind::Delete => self.deleted += 1,
        }
    }
}
