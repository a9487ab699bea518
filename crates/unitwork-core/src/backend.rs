//! Persistence backend interface.
//!
//! The unit of work emits one request per table row it writes. Backends are
//! responsible for atomicity; there are no transaction primitives here.

use crate::error::{Error, OptimisticLockError};
use crate::value::{PrimaryKey, Value};
use asupersync::{Cx, Outcome};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Kind of operation in a commit plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    /// Follow-up update writing a foreign key that was NULL on insert.
    DeferredUpdate,
    Update,
    Delete,
    LinkInsert,
    LinkDelete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Insert => "insert",
            OperationKind::DeferredUpdate => "deferred update",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::LinkInsert => "link insert",
            OperationKind::LinkDelete => "link delete",
        };
        f.write_str(name)
    }
}

/// Ordered column/value pairs.
pub type Columns = Vec<(String, Value)>;

/// Insert one row into one table.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRequest {
    pub entity_type: String,
    pub table: String,
    /// Key columns of the row.
    pub key_columns: Vec<String>,
    /// Column values; NULL for a generated key column.
    pub values: Columns,
    /// Column whose value the backend generates, if any.
    pub generated_column: Option<String>,
}

/// Optimistic-lock precondition of an update.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionCheck {
    pub column: String,
    pub expected: Value,
}

/// Update columns of one row in one table.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub entity_type: String,
    pub table: String,
    pub key: Columns,
    pub values: Columns,
    pub version: Option<VersionCheck>,
}

/// Delete one row from one table.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRequest {
    pub entity_type: String,
    pub table: String,
    pub key: Columns,
    pub version: Option<VersionCheck>,
}

/// Insert or delete one link-table row.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRequest {
    /// Owning entity type.
    pub entity_type: String,
    /// Owning relationship.
    pub relationship: String,
    pub table: String,
    pub owner: Columns,
    pub target: Columns,
    /// Member position for ordered collections.
    pub position: Option<(String, Value)>,
}

/// A persistence backend the unit of work dispatches to.
///
/// Implementations usually translate requests into SQL statements on a
/// connection; [`MemoryBackend`] keeps rows in memory.
pub trait PersistenceBackend: Send + Sync {
    /// Insert a row. Returns the generated key value when
    /// `generated_column` is set.
    fn insert(
        &self,
        cx: &Cx,
        request: &InsertRequest,
    ) -> impl Future<Output = Outcome<Option<Value>, Error>> + Send;

    /// Update a row.
    fn update(
        &self,
        cx: &Cx,
        request: &UpdateRequest,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Delete a row.
    fn delete(
        &self,
        cx: &Cx,
        request: &DeleteRequest,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Insert a link-table row.
    fn insert_link(
        &self,
        cx: &Cx,
        request: &LinkRequest,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Delete a link-table row.
    fn delete_link(
        &self,
        cx: &Cx,
        request: &LinkRequest,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// One stored row.
pub type Row = BTreeMap<String, Value>;

/// A row operation recorded by [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// `Insert`, `Update`, `Delete`, `LinkInsert` or `LinkDelete`.
    pub operation: OperationKind,
    pub entity_type: String,
    pub table: String,
    /// Key of the affected row (owner then target for link rows).
    pub key: PrimaryKey,
    /// Columns written (empty for deletes).
    pub columns: Vec<String>,
}

/// Foreign key enforced by [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub table: String,
    pub columns: Vec<String>,
    pub references: String,
    pub referenced_columns: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<Row>>,
    counters: HashMap<String, i64>,
    foreign_keys: Vec<ForeignKey>,
    journal: Vec<JournalEntry>,
    operations: usize,
    fail_at: Option<usize>,
}

/// In-memory backend with identity counters, optimistic version checks,
/// optional foreign-key enforcement, an operation journal and failure
/// injection.
///
/// Clones share state, so a test can keep a handle after moving one into a
/// session.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

fn key_of(row: &Row, columns: &[String]) -> Vec<Value> {
    columns
        .iter()
        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
        .collect()
}

fn matches_key(row: &Row, key: &[(String, Value)]) -> bool {
    key.iter()
        .all(|(c, v)| row.get(c).is_some_and(|stored| stored.same_as(v)))
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enforce a foreign key from `table.columns` to `references.referenced_columns`.
    #[must_use]
    pub fn with_foreign_key(
        self,
        table: impl Into<String>,
        columns: &[&str],
        references: impl Into<String>,
        referenced_columns: &[&str],
    ) -> Self {
        self.state.lock().foreign_keys.push(ForeignKey {
            table: table.into(),
            columns: columns.iter().map(ToString::to_string).collect(),
            references: references.into(),
            referenced_columns: referenced_columns.iter().map(ToString::to_string).collect(),
        });
        self
    }

    /// Make the `n`-th dispatched operation (1-based, counted from now) fail.
    pub fn fail_operation(&self, n: usize) {
        let mut state = self.state.lock();
        state.fail_at = Some(state.operations + n);
    }

    /// Seed a row without journaling it.
    pub fn seed(&self, table: impl Into<String>, row: Row) {
        self.state.lock().tables.entry(table.into()).or_default().push(row);
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.state.lock().tables.get(table).map_or(0, Vec::len)
    }

    /// Find a row by one column value.
    pub fn find(&self, table: &str, column: &str, value: &Value) -> Option<Row> {
        self.state.lock().tables.get(table).and_then(|rows| {
            rows.iter()
                .find(|r| r.get(column).is_some_and(|v| v.same_as(value)))
                .cloned()
        })
    }

    /// Every operation applied so far.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    /// Number of operations dispatched, including failed ones.
    pub fn operation_count(&self) -> usize {
        self.state.lock().operations
    }

    fn begin_operation(state: &mut MemoryState, what: &str) -> Result<(), Error> {
        state.operations += 1;
        if state.fail_at == Some(state.operations) {
            state.fail_at = None;
            tracing::debug!(operation = state.operations, what, "Injected backend failure");
            return Err(Error::Custom(format!(
                "injected failure on operation {}",
                state.operations
            )));
        }
        Ok(())
    }

    fn check_references(state: &MemoryState, table: &str, row: &Row) -> Result<(), Error> {
        for fk in state.foreign_keys.iter().filter(|fk| fk.table == table) {
            let values = key_of(row, &fk.columns);
            if values.iter().any(Value::is_null) {
                continue;
            }
            let key: Columns = fk.referenced_columns.iter().cloned().zip(values).collect();
            let exists = state
                .tables
                .get(&fk.references)
                .is_some_and(|rows| rows.iter().any(|r| matches_key(r, &key)));
            if !exists {
                return Err(Error::Custom(format!(
                    "foreign key violation: {}({}) references missing {} row",
                    table,
                    fk.columns.join(", "),
                    fk.references
                )));
            }
        }
        Ok(())
    }

    fn check_not_referenced(state: &MemoryState, table: &str, row: &Row) -> Result<(), Error> {
        for fk in state.foreign_keys.iter().filter(|fk| fk.references == table) {
            let key: Columns = fk
                .columns
                .iter()
                .cloned()
                .zip(key_of(row, &fk.referenced_columns))
                .collect();
            let referenced = state
                .tables
                .get(&fk.table)
                .is_some_and(|rows| rows.iter().any(|r| matches_key(r, &key)));
            if referenced {
                return Err(Error::Custom(format!(
                    "foreign key violation: {} row is still referenced by {}",
                    table, fk.table
                )));
            }
        }
        Ok(())
    }

    fn check_version(
        entity_type: &str,
        key: &Columns,
        row: &Row,
        version: Option<&VersionCheck>,
    ) -> Result<(), Error> {
        let Some(check) = version else {
            return Ok(());
        };
        let actual = row.get(&check.column).cloned().unwrap_or(Value::Null);
        if actual.same_as(&check.expected) {
            return Ok(());
        }
        Err(Error::OptimisticLock(OptimisticLockError {
            entity_type: entity_type.to_string(),
            identity: PrimaryKey::new(key.iter().map(|(_, v)| v.clone()).collect()),
            expected: check.expected.clone(),
            actual,
        }))
    }

    fn apply_insert(&self, request: &InsertRequest) -> Result<Option<Value>, Error> {
        let mut state = self.state.lock();
        Self::begin_operation(&mut state, "insert")?;

        let mut row: Row = request.values.iter().cloned().collect();
        let mut generated = None;
        if let Some(column) = &request.generated_column {
            if row.get(column).is_none_or(Value::is_null) {
                let counter = state.counters.entry(request.table.clone()).or_insert(0);
                *counter += 1;
                let id = Value::BigInt(*counter);
                row.insert(column.clone(), id.clone());
                generated = Some(id);
            }
        }

        let key = key_of(&row, &request.key_columns);
        let key_pairs: Columns = request.key_columns.iter().cloned().zip(key.clone()).collect();
        let duplicate = state
            .tables
            .get(&request.table)
            .is_some_and(|rows| rows.iter().any(|r| matches_key(r, &key_pairs)));
        if duplicate {
            return Err(Error::Custom(format!(
                "duplicate key {} in {}",
                PrimaryKey::new(key),
                request.table
            )));
        }
        Self::check_references(&state, &request.table, &row)?;

        state.journal.push(JournalEntry {
            operation: OperationKind::Insert,
            entity_type: request.entity_type.clone(),
            table: request.table.clone(),
            key: PrimaryKey::new(key),
            columns: row.keys().cloned().collect(),
        });
        state.tables.entry(request.table.clone()).or_default().push(row);
        Ok(generated)
    }

    fn apply_update(&self, request: &UpdateRequest) -> Result<(), Error> {
        let mut state = self.state.lock();
        Self::begin_operation(&mut state, "update")?;

        let Some(index) = state
            .tables
            .get(&request.table)
            .and_then(|rows| rows.iter().position(|r| matches_key(r, &request.key)))
        else {
            return Err(Error::Custom(format!(
                "no {} row with key {}",
                request.table,
                PrimaryKey::new(request.key.iter().map(|(_, v)| v.clone()).collect())
            )));
        };

        let mut row = state.tables[&request.table][index].clone();
        Self::check_version(
            &request.entity_type,
            &request.key,
            &row,
            request.version.as_ref(),
        )?;
        for (column, value) in &request.values {
            row.insert(column.clone(), value.clone());
        }
        Self::check_references(&state, &request.table, &row)?;

        state.journal.push(JournalEntry {
            operation: OperationKind::Update,
            entity_type: request.entity_type.clone(),
            table: request.table.clone(),
            key: PrimaryKey::new(request.key.iter().map(|(_, v)| v.clone()).collect()),
            columns: request.values.iter().map(|(c, _)| c.clone()).collect(),
        });
        if let Some(rows) = state.tables.get_mut(&request.table) {
            rows[index] = row;
        }
        Ok(())
    }

    fn apply_delete(&self, request: &DeleteRequest) -> Result<(), Error> {
        let mut state = self.state.lock();
        Self::begin_operation(&mut state, "delete")?;

        let Some(index) = state
            .tables
            .get(&request.table)
            .and_then(|rows| rows.iter().position(|r| matches_key(r, &request.key)))
        else {
            return Err(Error::Custom(format!(
                "no {} row with key {}",
                request.table,
                PrimaryKey::new(request.key.iter().map(|(_, v)| v.clone()).collect())
            )));
        };

        let row = state.tables[&request.table][index].clone();
        Self::check_version(
            &request.entity_type,
            &request.key,
            &row,
            request.version.as_ref(),
        )?;
        Self::check_not_referenced(&state, &request.table, &row)?;

        state.journal.push(JournalEntry {
            operation: OperationKind::Delete,
            entity_type: request.entity_type.clone(),
            table: request.table.clone(),
            key: PrimaryKey::new(request.key.iter().map(|(_, v)| v.clone()).collect()),
            columns: Vec::new(),
        });
        if let Some(rows) = state.tables.get_mut(&request.table) {
            rows.remove(index);
        }
        Ok(())
    }

    fn apply_link(&self, request: &LinkRequest, insert: bool) -> Result<(), Error> {
        let mut state = self.state.lock();
        Self::begin_operation(&mut state, if insert { "link insert" } else { "link delete" })?;

        let key: Columns = request
            .owner
            .iter()
            .chain(&request.target)
            .cloned()
            .collect();
        let position = state
            .tables
            .get(&request.table)
            .and_then(|rows| rows.iter().position(|r| matches_key(r, &key)));

        match (insert, position) {
            (true, Some(_)) => {
                return Err(Error::Custom(format!(
                    "duplicate link row in {}",
                    request.table
                )));
            }
            (false, None) => {
                return Err(Error::Custom(format!("no link row in {}", request.table)));
            }
            (true, None) => {
                let mut row: Row = key.iter().cloned().collect();
                if let Some((column, value)) = &request.position {
                    row.insert(column.clone(), value.clone());
                }
                Self::check_references(&state, &request.table, &row)?;
                state.tables.entry(request.table.clone()).or_default().push(row);
            }
            (false, Some(index)) => {
                if let Some(rows) = state.tables.get_mut(&request.table) {
                    rows.remove(index);
                }
            }
        }

        state.journal.push(JournalEntry {
            operation: if insert {
                OperationKind::LinkInsert
            } else {
                OperationKind::LinkDelete
            },
            entity_type: request.entity_type.clone(),
            table: request.table.clone(),
            key: PrimaryKey::new(key.iter().map(|(_, v)| v.clone()).collect()),
            columns: key.iter().map(|(c, _)| c.clone()).collect(),
        });
        Ok(())
    }
}

fn into_outcome<T>(result: Result<T, Error>) -> Outcome<T, Error> {
    match result {
        Ok(v) => Outcome::Ok(v),
        Err(e) => Outcome::Err(e),
    }
}

impl PersistenceBackend for MemoryBackend {
    fn insert(
        &self,
        _cx: &Cx,
        request: &InsertRequest,
    ) -> impl Future<Output = Outcome<Option<Value>, Error>> + Send {
        let outcome = into_outcome(self.apply_insert(request));
        async move { outcome }
    }

    fn update(
        &self,
        _cx: &Cx,
        request: &UpdateRequest,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = into_outcome(self.apply_update(request));
        async move { outcome }
    }

    fn delete(
        &self,
        _cx: &Cx,
        request: &DeleteRequest,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = into_outcome(self.apply_delete(request));
        async move { outcome }
    }

    fn insert_link(
        &self,
        _cx: &Cx,
        request: &LinkRequest,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = into_outcome(self.apply_link(request, true));
        async move { outcome }
    }

    fn delete_link(
        &self,
        _cx: &Cx,
        request: &LinkRequest,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = into_outcome(self.apply_link(request, false));
        async move { outcome }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn insert_user(name: &str) -> InsertRequest {
        InsertRequest {
            entity_type: "User".to_string(),
            table: "users".to_string(),
            key_columns: vec!["id".to_string()],
            values: vec![
                ("id".to_string(), Value::Null),
                ("name".to_string(), Value::from(name)),
                ("version".to_string(), Value::BigInt(1)),
            ],
            generated_column: Some("id".to_string()),
        }
    }

    #[test]
    fn test_insert_generates_sequential_ids() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let backend = MemoryBackend::new();

        rt.block_on(async {
            let first = unwrap_outcome(backend.insert(&cx, &insert_user("a")).await);
            let second = unwrap_outcome(backend.insert(&cx, &insert_user("b")).await);
            assert_eq!(first, Some(Value::BigInt(1)));
            assert_eq!(second, Some(Value::BigInt(2)));
        });
        assert_eq!(backend.row_count("users"), 2);
        assert_eq!(backend.journal().len(), 2);
    }

    #[test]
    fn test_update_checks_version() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let backend = MemoryBackend::new();

        rt.block_on(async {
            unwrap_outcome(backend.insert(&cx, &insert_user("a")).await);
            let stale = UpdateRequest {
                entity_type: "User".to_string(),
                table: "users".to_string(),
                key: vec![("id".to_string(), Value::BigInt(1))],
                values: vec![("name".to_string(), Value::from("b"))],
                version: Some(VersionCheck {
                    column: "version".to_string(),
                    expected: Value::BigInt(7),
                }),
            };
            match backend.update(&cx, &stale).await {
                Outcome::Err(Error::OptimisticLock(e)) => {
                    assert_eq!(e.actual, Value::BigInt(1));
                }
                other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
            }
        });
    }

    #[test]
    fn test_foreign_keys_are_enforced() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let backend =
            MemoryBackend::new().with_foreign_key("addresses", &["user_id"], "users", &["id"]);

        let address = InsertRequest {
            entity_type: "Address".to_string(),
            table: "addresses".to_string(),
            key_columns: vec!["id".to_string()],
            values: vec![
                ("id".to_string(), Value::Null),
                ("user_id".to_string(), Value::BigInt(1)),
            ],
            generated_column: Some("id".to_string()),
        };

        rt.block_on(async {
            assert!(matches!(
                backend.insert(&cx, &address).await,
                Outcome::Err(Error::Custom(_))
            ));
            unwrap_outcome(backend.insert(&cx, &insert_user("a")).await);
            unwrap_outcome(backend.insert(&cx, &address).await);

            let delete_user = DeleteRequest {
                entity_type: "User".to_string(),
                table: "users".to_string(),
                key: vec![("id".to_string(), Value::BigInt(1))],
                version: None,
            };
            assert!(matches!(
                backend.delete(&cx, &delete_user).await,
                Outcome::Err(Error::Custom(_))
            ));
        });
    }

    #[test]
    fn test_failure_injection() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let backend = MemoryBackend::new();
        backend.fail_operation(2);

        rt.block_on(async {
            unwrap_outcome(backend.insert(&cx, &insert_user("a")).await);
            assert!(matches!(
                backend.insert(&cx, &insert_user("b")).await,
                Outcome::Err(_)
            ));
            unwrap_outcome(backend.insert(&cx, &insert_user("c")).await);
        });
        assert_eq!(backend.row_count("users"), 2);
        assert_eq!(backend.operation_count(), 3);
    }

    #[test]
    fn test_link_rows() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let backend = MemoryBackend::new();
        let link = LinkRequest {
            entity_type: "Hero".to_string(),
            relationship: "powers".to_string(),
            table: "hero_powers".to_string(),
            owner: vec![("hero_id".to_string(), Value::BigInt(1))],
            target: vec![("power_id".to_string(), Value::BigInt(2))],
            position: None,
        };

        rt.block_on(async {
            unwrap_outcome(backend.insert_link(&cx, &link).await);
            assert!(matches!(
                backend.insert_link(&cx, &link).await,
                Outcome::Err(_)
            ));
            unwrap_outcome(backend.delete_link(&cx, &link).await);
        });
        assert_eq!(backend.row_count("hero_powers"), 0);
        assert_eq!(OperationKind::LinkInsert.to_string(), "link insert");
    }
}
