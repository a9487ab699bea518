use asupersync::runtime::RuntimeBuilder;
use asupersync::{CancelKind, CancelReason};
use std::future::Future;
use unitwork::prelude::*;
use unitwork::{
    CommitPhase, DeleteRequest, InsertRequest, LinkRequest, OperationKind, Row, UpdateRequest,
};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn registry() -> MetadataRegistry {
    MetadataRegistry::builder()
        // Joined inheritance
        .register(
            EntityMeta::new("Person", "persons")
                .identity(["id"])
                .inheritance(InheritanceStrategy::Joined)
                .discriminator("kind", "person")
                .field(FieldMeta::new("id", SqlType::BigInt))
                .field(FieldMeta::new("name", SqlType::Text)),
        )
        .expect("register Person")
        .register(
            EntityMeta::new("Student", "students")
                .extends("Person")
                .discriminator("kind", "student")
                .field(FieldMeta::new("grade", SqlType::Integer)),
        )
        .expect("register Student")
        // Single-table inheritance
        .register(
            EntityMeta::new("Vehicle", "vehicles")
                .identity(["id"])
                .inheritance(InheritanceStrategy::SingleTable)
                .discriminator("kind", "vehicle")
                .field(FieldMeta::new("id", SqlType::BigInt))
                .field(FieldMeta::new("wheels", SqlType::Integer)),
        )
        .expect("register Vehicle")
        .register(
            EntityMeta::new("Car", "cars")
                .extends("Vehicle")
                .discriminator("kind", "car")
                .field(FieldMeta::new("doors", SqlType::Integer).nullable(true)),
        )
        .expect("register Car")
        // Many-to-many
        .register(
            EntityMeta::new("Post", "posts")
                .identity(["id"])
                .field(FieldMeta::new("id", SqlType::BigInt))
                .field(FieldMeta::new("title", SqlType::Text))
                .relationship(
                    RelationshipMeta::many_to_many(
                        "tags",
                        "Tag",
                        LinkTable::new("post_tags", "post_id", "tag_id"),
                    )
                    .cascade(CascadeSet::PERSIST),
                ),
        )
        .expect("register Post")
        .register(
            EntityMeta::new("Tag", "tags")
                .identity(["id"])
                .field(FieldMeta::new("id", SqlType::BigInt))
                .field(FieldMeta::new("label", SqlType::Text)),
        )
        .expect("register Tag")
        .register(
            EntityMeta::new("Playlist", "playlists")
                .identity(["id"])
                .field(FieldMeta::new("id", SqlType::BigInt))
                .relationship(
                    RelationshipMeta::many_to_many(
                        "tracks",
                        "Track",
                        LinkTable::new("playlist_tracks", "playlist_id", "track_id")
                            .position("position"),
                    )
                    .ordered()
                    .cascade(CascadeSet::PERSIST),
                ),
        )
        .expect("register Playlist")
        .register(
            EntityMeta::new("Track", "tracks")
                .identity(["id"])
                .field(FieldMeta::new("id", SqlType::BigInt))
                .field(FieldMeta::new("title", SqlType::Text)),
        )
        .expect("register Track")
        // Versioned
        .register(
            EntityMeta::new("Document", "documents")
                .identity(["id"])
                .version("version")
                .field(FieldMeta::new("id", SqlType::BigInt))
                .field(FieldMeta::new("body", SqlType::Text))
                .field(FieldMeta::new("version", SqlType::BigInt)),
        )
        .expect("register Document")
        .build()
        .expect("build registry")
}

fn backend() -> MemoryBackend {
    MemoryBackend::new()
        .with_foreign_key("students", &["id"], "persons", &["id"])
        .with_foreign_key("post_tags", &["post_id"], "posts", &["id"])
        .with_foreign_key("post_tags", &["tag_id"], "tags", &["id"])
        .with_foreign_key("playlist_tracks", &["playlist_id"], "playlists", &["id"])
        .with_foreign_key("playlist_tracks", &["track_id"], "tracks", &["id"])
}

/// Requests cancellation of the commit's context once its first insert has
/// been applied.
struct CancellingBackend {
    inner: MemoryBackend,
}

#[allow(clippy::manual_async_fn)]
impl PersistenceBackend for CancellingBackend {
    fn insert(
        &self,
        cx: &Cx,
        request: &InsertRequest,
    ) -> impl Future<Output = Outcome<Option<Value>, Error>> + Send {
        async move {
            let outcome = self.inner.insert(cx, request).await;
            cx.set_cancel_reason(CancelReason::user("shutting down"));
            outcome
        }
    }

    fn update(
        &self,
        cx: &Cx,
        request: &UpdateRequest,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.inner.update(cx, request)
    }

    fn delete(
        &self,
        cx: &Cx,
        request: &DeleteRequest,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.inner.delete(cx, request)
    }

    fn insert_link(
        &self,
        cx: &Cx,
        request: &LinkRequest,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.inner.insert_link(cx, request)
    }

    fn delete_link(
        &self,
        cx: &Cx,
        request: &LinkRequest,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.inner.delete_link(cx, request)
    }
}

fn journal_tail(backend: &MemoryBackend, skip: usize) -> Vec<(OperationKind, String)> {
    backend
        .journal()
        .into_iter()
        .skip(skip)
        .map(|e| (e.operation, e.table))
        .collect()
}

fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(c, v)| ((*c).to_string(), v.clone()))
        .collect()
}

// ============================================================================
// Inheritance
// ============================================================================

#[test]
fn joined_subtype_writes_one_row_per_table() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let backend = backend();
    let mut session = Session::new(registry(), backend.clone());

    let student = EntityRef::new(
        Entity::new("Student")
            .with("name", "ada")
            .with("grade", 11),
    );
    session.persist(&student).unwrap();

    rt.block_on(async {
        let report = unwrap_outcome(session.commit(&cx).await);
        // One logical insert, two rows.
        assert_eq!(report.inserted, 1);
    });

    assert_eq!(
        journal_tail(&backend, 0),
        vec![
            (OperationKind::Insert, "persons".to_string()),
            (OperationKind::Insert, "students".to_string()),
        ]
    );
    let id = student.get("id");
    let person_row = backend.find("persons", "id", &id).expect("persons row");
    assert_eq!(person_row.get("kind"), Some(&Value::from("student")));
    assert_eq!(person_row.get("name"), Some(&Value::from("ada")));
    let student_row = backend.find("students", "id", &id).expect("students row");
    assert_eq!(student_row.get("grade"), Some(&Value::from(11)));
    assert!(!student_row.contains_key("name"));

    // Found through the root type as well.
    assert_eq!(
        session.find("Person", PrimaryKey::single(id.clone())).unwrap(),
        Some(student.clone())
    );

    rt.block_on(async {
        session.remove(&student).unwrap();
        let report = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(report.deleted, 1);
    });
    assert_eq!(
        journal_tail(&backend, 2),
        vec![
            (OperationKind::Delete, "students".to_string()),
            (OperationKind::Delete, "persons".to_string()),
        ]
    );
}

#[test]
fn joined_subtype_update_touches_only_changed_tables() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let backend = backend();
    let mut session = Session::new(registry(), backend.clone());

    let student = EntityRef::new(Entity::new("Student").with("name", "grace").with("grade", 9));
    session.persist(&student).unwrap();

    rt.block_on(async {
        unwrap_outcome(session.commit(&cx).await);
        student.set("grade", 10);
        let report = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(report.updated, 1);
    });

    let updates: Vec<_> = backend
        .journal()
        .into_iter()
        .filter(|e| e.operation == OperationKind::Update)
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].table, "students");
    assert_eq!(updates[0].columns, vec!["grade".to_string()]);
}

#[test]
fn single_table_rows_carry_the_concrete_discriminator() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let backend = backend();
    let mut session = Session::new(registry(), backend.clone());

    let bike = EntityRef::new(Entity::new("Vehicle").with("wheels", 2));
    let car = EntityRef::new(Entity::new("Car").with("wheels", 4).with("doors", 5));
    session.persist(&bike).unwrap();
    session.persist(&car).unwrap();

    rt.block_on(async {
        let report = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(report.inserted, 2);
    });

    assert_eq!(backend.row_count("vehicles"), 2);
    assert_eq!(backend.row_count("cars"), 0);
    let bike_row = backend.find("vehicles", "id", &bike.get("id")).unwrap();
    assert_eq!(bike_row.get("kind"), Some(&Value::from("vehicle")));
    let car_row = backend.find("vehicles", "id", &car.get("id")).unwrap();
    assert_eq!(car_row.get("kind"), Some(&Value::from("car")));
    assert_eq!(car_row.get("doors"), Some(&Value::from(5)));
    // Both types draw from the same identity space.
    assert_ne!(bike.get("id"), car.get("id"));
}

// ============================================================================
// Many-to-many links
// ============================================================================

#[test]
fn link_rows_follow_collection_changes() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let backend = backend();
    let mut session = Session::new(registry(), backend.clone());

    let rust = EntityRef::new(Entity::new("Tag").with("label", "rust"));
    let orm = EntityRef::new(Entity::new("Tag").with("label", "orm"));
    let post = EntityRef::new(
        Entity::new("Post")
            .with("title", "unit of work")
            .with_collection("tags", vec![rust.clone(), orm.clone()]),
    );
    session.persist(&post).unwrap();

    rt.block_on(async {
        let report = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(report.inserted, 3);
        assert_eq!(report.links_inserted, 2);
    });
    assert_eq!(backend.row_count("post_tags"), 2);

    rt.block_on(async {
        assert!(post.write().collection_mut("tags").remove(&rust));
        let report = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(report.links_deleted, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(report.deleted, 0);
    });
    let remaining = backend.rows("post_tags");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].get("tag_id"), Some(&orm.get("id")));

    // The tag itself is untouched.
    assert_eq!(backend.row_count("tags"), 2);
    assert_eq!(session.state_of(&rust), LifecycleState::Managed);
}

#[test]
fn removing_a_linked_target_deletes_its_link_rows_first() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let backend = backend();
    let mut session = Session::new(registry(), backend.clone());

    let tag = EntityRef::new(Entity::new("Tag").with("label", "obsolete"));
    let post = EntityRef::new(
        Entity::new("Post")
            .with("title", "old news")
            .with_collection("tags", vec![tag.clone()]),
    );
    session.persist(&post).unwrap();

    rt.block_on(async {
        unwrap_outcome(session.commit(&cx).await);
        session.remove(&tag).unwrap();
        let report = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(report.links_deleted, 1);
        assert_eq!(report.deleted, 1);
    });

    assert_eq!(
        journal_tail(&backend, 3),
        vec![
            (OperationKind::LinkDelete, "post_tags".to_string()),
            (OperationKind::Delete, "tags".to_string()),
        ]
    );
    assert_eq!(backend.row_count("post_tags"), 0);
}

#[test]
fn ordered_collection_rewrites_positions_on_reorder() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let backend = backend();
    let mut session = Session::new(registry(), backend.clone());

    let tracks: Vec<EntityRef> = ["intro", "verse", "outro"]
        .iter()
        .map(|t| EntityRef::new(Entity::new("Track").with("title", *t)))
        .collect();
    let playlist = EntityRef::new(Entity::new("Playlist").with_collection("tracks", tracks.clone()));
    session.persist(&playlist).unwrap();

    let position_of = |track: &EntityRef| {
        backend
            .find("playlist_tracks", "track_id", &track.get("id"))
            .and_then(|r| r.get("position").cloned())
    };

    rt.block_on(async {
        let report = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(report.links_inserted, 3);
    });
    assert_eq!(position_of(&tracks[0]), Some(Value::BigInt(0)));
    assert_eq!(position_of(&tracks[2]), Some(Value::BigInt(2)));

    // [intro, verse, outro] -> [verse, outro, intro]
    playlist.write().collection_mut("tracks").move_member(0, 2);
    rt.block_on(async {
        let report = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(report.links_deleted, 3);
        assert_eq!(report.links_inserted, 3);
    });
    assert_eq!(position_of(&tracks[1]), Some(Value::BigInt(0)));
    assert_eq!(position_of(&tracks[2]), Some(Value::BigInt(1)));
    assert_eq!(position_of(&tracks[0]), Some(Value::BigInt(2)));
    assert_eq!(backend.row_count("playlist_tracks"), 3);
}

// ============================================================================
// Optimistic versioning
// ============================================================================

#[test]
fn version_is_checked_and_bumped_on_update() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let backend = backend();
    backend.seed(
        "documents",
        row(&[
            ("id", Value::BigInt(1)),
            ("body", Value::from("draft")),
            ("version", Value::BigInt(5)),
        ]),
    );
    let mut session = Session::new(registry(), backend.clone());

    let doc = EntityRef::new(
        Entity::new("Document")
            .with("id", 1_i64)
            .with("body", "draft")
            .with("version", 5_i64),
    );
    session.register_managed(&doc).unwrap();
    doc.set("body", "final");

    rt.block_on(async {
        let report = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(report.updated, 1);
    });

    assert_eq!(doc.get("version"), Value::BigInt(6));
    let stored = backend.find("documents", "id", &Value::BigInt(1)).unwrap();
    assert_eq!(stored.get("version"), Some(&Value::BigInt(6)));
    assert_eq!(stored.get("body"), Some(&Value::from("final")));
    assert!(session.is_clean());
}

#[test]
fn stale_version_fails_the_commit() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let backend = backend();
    backend.seed(
        "documents",
        row(&[
            ("id", Value::BigInt(1)),
            ("body", Value::from("theirs")),
            ("version", Value::BigInt(5)),
        ]),
    );
    let mut session = Session::new(registry(), backend.clone());

    let doc = EntityRef::new(
        Entity::new("Document")
            .with("id", 1_i64)
            .with("body", "ours")
            .with("version", 4_i64),
    );
    session.register_managed(&doc).unwrap();
    doc.set("body", "ours, edited");

    rt.block_on(async {
        match session.commit(&cx).await {
            Outcome::Err(err @ Error::BackendOperation(_)) => {
                match err.backend_cause() {
                    Some(Error::OptimisticLock(lock)) => {
                        assert_eq!(lock.entity_type, "Document");
                        assert_eq!(lock.expected, Value::BigInt(4));
                        assert_eq!(lock.actual, Value::BigInt(5));
                    }
                    other => panic!("expected optimistic lock cause, got {other:?}"),
                }
            }
            other => panic!("expected backend failure, got {other:?}"),
        }
    });

    assert_eq!(session.phase(), CommitPhase::Failed);
    assert!(matches!(session.persist(&doc), Err(Error::SessionFailed)));
    // Nothing was written; the entity keeps its stale version.
    assert_eq!(doc.get("version"), Value::BigInt(4));
    let stored = backend.find("documents", "id", &Value::BigInt(1)).unwrap();
    assert_eq!(stored.get("body"), Some(&Value::from("theirs")));

    session.clear();
    assert_eq!(session.phase(), CommitPhase::Idle);
    assert_eq!(session.state_of(&doc), LifecycleState::Detached);
}

#[test]
fn delete_carries_the_version_check() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let backend = backend();
    backend.seed(
        "documents",
        row(&[("id", Value::BigInt(2)), ("version", Value::BigInt(3))]),
    );
    let mut session = Session::new(registry(), backend.clone());

    let doc = EntityRef::new(Entity::new("Document").with("id", 2_i64).with("version", 2_i64));
    session.register_managed(&doc).unwrap();
    session.remove(&doc).unwrap();

    rt.block_on(async {
        let outcome = session.commit(&cx).await;
        assert!(matches!(outcome, Outcome::Err(Error::BackendOperation(_))));
    });
    assert_eq!(backend.row_count("documents"), 1);
}

// ============================================================================
// Partial failure
// ============================================================================

#[test]
fn failure_mid_batch_keeps_executed_operations() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let backend = backend();
    let mut session = Session::new(registry(), backend.clone());

    let tags: Vec<EntityRef> = ["a", "b", "c"]
        .iter()
        .map(|l| EntityRef::new(Entity::new("Tag").with("label", *l)))
        .collect();
    for tag in &tags {
        session.persist(tag).unwrap();
    }

    backend.fail_operation(2);
    rt.block_on(async {
        match session.commit(&cx).await {
            Outcome::Err(Error::BackendOperation(failure)) => {
                assert_eq!(failure.operation, OperationKind::Insert);
                assert_eq!(failure.entity_type, "Tag");
            }
            other => panic!("expected backend failure, got {other:?}"),
        }
    });

    // The first insert stands and was reconciled; the rest never ran.
    assert_eq!(backend.row_count("tags"), 1);
    assert_eq!(backend.operation_count(), 2);
    assert_eq!(tags[0].get("id"), Value::BigInt(1));
    assert!(tags[1].get("id").is_null());
    assert_eq!(session.phase(), CommitPhase::Failed);

    rt.block_on(async {
        let outcome = session.commit(&cx).await;
        assert!(matches!(outcome, Outcome::Err(Error::SessionFailed)));
    });
    assert_eq!(backend.operation_count(), 2);

    session.clear();
    let retry = EntityRef::new(Entity::new("Tag").with("label", "retry"));
    session.persist(&retry).unwrap();
    rt.block_on(async {
        let report = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(report.inserted, 1);
    });
    assert_eq!(backend.row_count("tags"), 2);
}

#[test]
fn cancellation_stops_the_batch_before_the_next_operation() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let inner = backend();
    let mut session = Session::new(
        registry(),
        CancellingBackend {
            inner: inner.clone(),
        },
    );

    let tags: Vec<EntityRef> = ["a", "b", "c"]
        .iter()
        .map(|l| EntityRef::new(Entity::new("Tag").with("label", *l)))
        .collect();
    for tag in &tags {
        session.persist(tag).unwrap();
    }

    rt.block_on(async {
        match session.commit(&cx).await {
            Outcome::Cancelled(reason) => assert_eq!(reason.kind, CancelKind::User),
            other => panic!("expected cancellation, got {other:?}"),
        }
    });

    assert_eq!(inner.operation_count(), 1);
    assert_eq!(inner.row_count("tags"), 1);
    assert_eq!(session.phase(), CommitPhase::Failed);
    assert_eq!(tags[0].get("id"), Value::BigInt(1));
    assert!(tags[1].get("id").is_null());

    let late = EntityRef::new(Entity::new("Tag").with("label", "d"));
    assert!(matches!(session.persist(&late), Err(Error::SessionFailed)));
}
