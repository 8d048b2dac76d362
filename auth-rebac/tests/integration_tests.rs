//! Authorization Engine Integration Tests
//!
//! Covers the engine's guarantees end to end against the in-memory store:
//! 1. Direct grants, revocation and idempotent writes
//! 2. Folder inheritance and re-parenting
//! 3. Group indirection
//! 4. Cycle safety
//! 5. Cascade delete and id reuse
//! 6. Store failures and malformed stored data
//! 7. ListObjects agreeing with Check on random graphs

use auth_rebac::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn create_test_engine() -> Arc<AuthorizationEngine> {
    let store = Arc::new(InMemoryTupleStore::new());
    Arc::new(AuthorizationEngine::new(store))
}

fn create_test_authorizer() -> DocumentAuthorizer {
    DocumentAuthorizer::new(create_test_engine())
}

// ============================================================================
// P1: Direct owner grant implies read and write
// ============================================================================

#[tokio::test]
async fn test_owner_grant_implies_read_and_write() {
    let engine = create_test_engine();
    let alice = SubjectRef::user("alice");
    let doc = EntityRef::doc("1");

    engine
        .grant(Tuple::new(alice.clone(), RelationName::Owner, doc.clone()))
        .await
        .unwrap();

    assert!(engine.check(&alice, RelationName::CanRead, &doc).await.unwrap());
    assert!(engine.check(&alice, RelationName::CanWrite, &doc).await.unwrap());

    println!("✅ Owner grant implies can_read and can_write");
}

// ============================================================================
// P2: Revoke is total
// ============================================================================

#[tokio::test]
async fn test_revoke_removes_access() {
    let engine = create_test_engine();
    let bob = SubjectRef::user("bob");
    let doc = EntityRef::doc("1");
    let folder = EntityRef::folder("10");

    engine
        .grant(Tuple::new(SubjectRef::user("alice"), RelationName::Owner, doc.clone()))
        .await
        .unwrap();

    let doc_share = Tuple::new(bob.clone(), RelationName::Viewer, doc.clone());
    engine.grant(doc_share.clone()).await.unwrap();
    assert!(engine.check(&bob, RelationName::CanRead, &doc).await.unwrap());
    engine.revoke(doc_share.clone()).await.unwrap();
    assert!(!engine.check(&bob, RelationName::CanRead, &doc).await.unwrap());

    // Revoking twice is fine
    engine.revoke(doc_share).await.unwrap();

    let folder_share = Tuple::new(bob.clone(), RelationName::Viewer, folder.clone());
    engine.grant(folder_share.clone()).await.unwrap();
    assert!(engine.check(&bob, RelationName::Viewer, &folder).await.unwrap());
    engine.revoke(folder_share).await.unwrap();
    assert!(!engine.check(&bob, RelationName::Viewer, &folder).await.unwrap());

    println!("✅ Revoke removes access");
}

// ============================================================================
// P3: Hierarchical inheritance follows moves
// ============================================================================

#[tokio::test]
async fn test_inheritance_follows_reparenting() {
    let authz = create_test_authorizer();

    authz.create_folder("admin", "F", None).await.unwrap();
    authz.create_folder("admin", "F2", None).await.unwrap();
    authz.create_document("admin", "D", Some("F")).await.unwrap();
    authz.share_folder("F", "U", Access::Viewer).await.unwrap();

    assert!(authz.can_read("U", "D").await.unwrap());

    authz.move_document("D", Some("F2")).await.unwrap();
    assert!(
        !authz.can_read("U", "D").await.unwrap(),
        "access inherited from the old folder must not survive the move"
    );

    authz.share_folder("F2", "U", Access::Viewer).await.unwrap();
    assert!(authz.can_read("U", "D").await.unwrap());

    let parents = authz
        .engine()
        .read_tuples(
            &TupleFilter::new()
                .relation(RelationName::Parent)
                .object(EntityRef::doc("D")),
        )
        .await
        .unwrap();
    assert_eq!(parents, vec![Tuple::parent(&EntityRef::folder("F2"), &EntityRef::doc("D"))]);

    println!("✅ Inheritance follows re-parenting");
}

#[tokio::test]
async fn test_inheritance_through_nested_folders() {
    let authz = create_test_authorizer();

    authz.create_folder("alice", "root", None).await.unwrap();
    authz.create_folder("alice", "projects", Some("root")).await.unwrap();
    authz.create_folder("alice", "q3", Some("projects")).await.unwrap();
    authz.create_document("dave", "plan", Some("q3")).await.unwrap();
    authz.share_folder("root", "bob", Access::Viewer).await.unwrap();

    assert!(authz.can_read("bob", "plan").await.unwrap());
    assert!(!authz.can_write("bob", "plan").await.unwrap());

    // Folder owners write everything below, but neither share nor transfer
    assert!(authz.can_write("alice", "plan").await.unwrap());
    assert!(authz.can_create_file("alice", "q3").await.unwrap());
    assert!(!authz.can_share("alice", "plan").await.unwrap());
    assert!(!authz.can_change_owner("alice", "plan").await.unwrap());
    assert!(authz.can_share("dave", "plan").await.unwrap());

    println!("✅ Inheritance through nested folders");
}

// ============================================================================
// P4: Group indirection
// ============================================================================

#[tokio::test]
async fn test_group_membership_grants_and_removal_revokes() {
    let authz = create_test_authorizer();

    authz.create_folder("admin", "F", None).await.unwrap();
    authz.create_document("admin", "D", Some("F")).await.unwrap();
    authz.add_user_to_group("U", "G").await.unwrap();
    authz.assign_group_to_folder("G", "F", Access::Viewer).await.unwrap();

    assert!(authz.can_read("U", "D").await.unwrap());
    assert!(authz.can_view_folder("U", "F").await.unwrap());

    authz.remove_user_from_group("U", "G").await.unwrap();
    assert!(!authz.can_read("U", "D").await.unwrap());

    let folder_grant = Tuple::new(
        DocumentAuthorizer::format_group_member("G"),
        RelationName::Viewer,
        EntityRef::folder("F"),
    );
    assert!(authz.engine().store().exists(&folder_grant).await.unwrap());

    println!("✅ Group membership grants, removal revokes");
}

#[tokio::test]
async fn test_group_ownership_of_folder() {
    let authz = create_test_authorizer();

    authz.create_folder("admin", "F", None).await.unwrap();
    authz.create_document("admin", "D", Some("F")).await.unwrap();
    authz.add_user_to_group("erin", "editors").await.unwrap();
    authz.assign_group_to_folder("editors", "F", Access::Owner).await.unwrap();

    assert!(authz.is_folder_owner("erin", "F").await.unwrap());
    assert!(authz.can_create_file("erin", "F").await.unwrap());
    assert!(authz.can_write("erin", "D").await.unwrap());

    authz.remove_group_from_folder("editors", "F", Access::Owner).await.unwrap();
    assert!(!authz.can_write("erin", "D").await.unwrap());

    println!("✅ Group ownership of folder");
}

// ============================================================================
// P5: Cycle safety
// ============================================================================

#[tokio::test]
async fn test_parent_cycle_is_rejected_at_write_time() {
    let authz = create_test_authorizer();

    authz.create_folder("alice", "F1", None).await.unwrap();
    authz.create_folder("alice", "F2", Some("F1")).await.unwrap();

    let err = authz.move_folder("F1", Some("F2")).await.unwrap_err();
    assert!(matches!(err, RebacError::ParentCycle(_)));

    println!("✅ Parent cycle rejected at write time");
}

#[tokio::test]
async fn test_parent_cycle_in_stored_data_terminates() {
    let store = Arc::new(InMemoryTupleStore::new());
    let engine = AuthorizationEngine::new(store.clone());
    let f1 = EntityRef::folder("F1");
    let f2 = EntityRef::folder("F2");
    let doc = EntityRef::doc("D");

    // Data that bypassed validation
    store
        .write(vec![
            Tuple::parent(&f1, &f2),
            Tuple::parent(&f2, &f1),
            Tuple::parent(&f2, &doc),
            Tuple::new(SubjectRef::user("alice"), RelationName::Viewer, f1.clone()),
        ])
        .await
        .unwrap();

    let mallory = SubjectRef::user("mallory");
    let alice = SubjectRef::user("alice");

    let denied = tokio::time::timeout(
        Duration::from_secs(5),
        engine.check(&mallory, RelationName::CanRead, &doc),
    )
    .await
    .expect("check must terminate")
    .unwrap();
    assert!(!denied);

    let allowed = tokio::time::timeout(
        Duration::from_secs(5),
        engine.check(&alice, RelationName::CanRead, &doc),
    )
    .await
    .expect("check must terminate")
    .unwrap();
    assert!(allowed);

    let docs = engine
        .list_objects(&alice, RelationName::CanRead, EntityType::Doc)
        .await
        .unwrap();
    assert_eq!(docs, vec![doc]);

    println!("✅ Parent cycle in stored data terminates");
}

// ============================================================================
// P6: Idempotent writes and set-valued listing
// ============================================================================

#[tokio::test]
async fn test_duplicate_grant_leaves_one_tuple() {
    let engine = create_test_engine();
    let tuple = Tuple::new(SubjectRef::user("alice"), RelationName::Viewer, EntityRef::folder("10"));

    engine.grant(tuple.clone()).await.unwrap();
    engine.grant(tuple.clone()).await.unwrap();

    let stored = engine
        .read_tuples(&TupleFilter::new().object(EntityRef::folder("10")))
        .await
        .unwrap();
    assert_eq!(stored, vec![tuple]);

    println!("✅ Duplicate grant leaves one tuple");
}

#[tokio::test]
async fn test_list_objects_deduplicates_paths() {
    let authz = create_test_authorizer();

    authz.create_folder("alice", "F", None).await.unwrap();
    authz.create_document("alice", "D", Some("F")).await.unwrap();
    authz.share_document("D", "bob", Access::Viewer).await.unwrap();
    authz.share_folder("F", "bob", Access::Viewer).await.unwrap();
    authz.add_user_to_group("bob", "G").await.unwrap();
    authz.assign_group_to_folder("G", "F", Access::Viewer).await.unwrap();

    assert_eq!(authz.documents_readable_by("bob").await.unwrap(), vec!["D".to_string()]);
    assert_eq!(authz.folders_viewable_by("bob").await.unwrap(), vec!["F".to_string()]);

    println!("✅ ListObjects deduplicates paths");
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_scenario_owner_can_share() {
    let engine = create_test_engine();
    let doc = EntityRef::doc("1");

    engine
        .grant(Tuple::new(SubjectRef::user("alice"), RelationName::Owner, doc.clone()))
        .await
        .unwrap();

    assert!(engine
        .check(&SubjectRef::user("alice"), RelationName::CanShare, &doc)
        .await
        .unwrap());
    assert!(!engine
        .check(&SubjectRef::user("bob"), RelationName::CanShare, &doc)
        .await
        .unwrap());

    println!("✅ Scenario A: owner can share, others cannot");
}

#[tokio::test]
async fn test_scenario_group_shared_folder() {
    let engine = create_test_engine();
    let authz = DocumentAuthorizer::new(engine.clone());

    engine
        .grant(Tuple::new(
            SubjectRef::group_members("eng"),
            RelationName::Viewer,
            EntityRef::folder("10"),
        ))
        .await
        .unwrap();
    authz.add_user_to_group("carol", "eng").await.unwrap();
    engine
        .grant(Tuple::parent(&EntityRef::folder("10"), &EntityRef::doc("99")))
        .await
        .unwrap();

    assert!(engine
        .check(&SubjectRef::user("carol"), RelationName::CanRead, &EntityRef::doc("99"))
        .await
        .unwrap());

    println!("✅ Scenario B: group-shared folder grants read");
}

#[tokio::test]
async fn test_scenario_deleted_folder_id_reuse() {
    let authz = create_test_authorizer();

    authz.create_folder("alice", "10", None).await.unwrap();
    authz.create_document("alice", "99", Some("10")).await.unwrap();
    authz.share_folder("10", "bob", Access::Viewer).await.unwrap();
    authz.add_user_to_group("carol", "eng").await.unwrap();
    authz.assign_group_to_folder("eng", "10", Access::Viewer).await.unwrap();

    let deleted = authz.delete_folder("10").await.unwrap();
    assert_eq!(deleted.len(), 4);

    assert!(authz
        .object_tuples(&EntityRef::folder("10"))
        .await
        .unwrap()
        .is_empty());

    // A different user creates a new folder that happens to reuse the id
    authz.create_folder("zoe", "10", None).await.unwrap();
    let tuples = authz.object_tuples(&EntityRef::folder("10")).await.unwrap();
    assert_eq!(
        tuples,
        vec![Tuple::new(SubjectRef::user("zoe"), RelationName::Owner, EntityRef::folder("10"))]
    );

    assert!(!authz.can_view_folder("bob", "10").await.unwrap());
    assert!(!authz.can_view_folder("carol", "10").await.unwrap());
    assert!(!authz.can_view_folder("alice", "10").await.unwrap());
    assert!(!authz.can_read("bob", "99").await.unwrap());

    println!("✅ Scenario C: deleted folder leaks nothing to a reused id");
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_owner_revocations_keep_one_owner() {
    let engine = create_test_engine();
    let doc = EntityRef::doc("1");
    let alice = Tuple::new(SubjectRef::user("alice"), RelationName::Owner, doc.clone());
    let bob = Tuple::new(SubjectRef::user("bob"), RelationName::Owner, doc.clone());

    engine.grant(alice.clone()).await.unwrap();
    engine.grant(bob.clone()).await.unwrap();

    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.revoke(alice).await }
    });
    let second = tokio::spawn({
        let engine = engine.clone();
        async move { engine.revoke(bob).await }
    });

    let results = [first.await.unwrap(), second.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(RebacError::Conflict(_)))));

    let owners = engine
        .read_tuples(&TupleFilter::new().relation(RelationName::Owner).object(doc))
        .await
        .unwrap();
    assert_eq!(owners.len(), 1);

    println!("✅ Concurrent revocations keep one owner");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_checks() {
    let authz = create_test_authorizer();
    authz.create_folder("alice", "F", None).await.unwrap();
    for i in 0..20 {
        authz
            .create_document("alice", &format!("d{}", i), Some("F"))
            .await
            .unwrap();
    }
    authz.share_folder("F", "bob", Access::Viewer).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let authz = authz.clone();
        handles.push(tokio::spawn(async move {
            authz.can_read("bob", &format!("d{}", i)).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap());
    }

    println!("✅ Parallel checks");
}

// ============================================================================
// Store failures and malformed data
// ============================================================================

/// In-memory store whose reads of one relation fail as if the backend were down
struct FlakyStore {
    inner: InMemoryTupleStore,
    failing: RelationName,
}

#[async_trait::async_trait]
impl TupleStore for FlakyStore {
    async fn apply(&self, change_set: ChangeSet) -> auth_rebac::Result<()> {
        self.inner.apply(change_set).await
    }

    async fn read(&self, filter: &TupleFilter) -> auth_rebac::Result<Vec<Tuple>> {
        if filter.relation == Some(self.failing) {
            return Err(RebacError::StoreUnavailable("connection reset by peer".to_string()));
        }
        self.inner.read(filter).await
    }

    async fn exists(&self, tuple: &Tuple) -> auth_rebac::Result<bool> {
        self.inner.exists(tuple).await
    }
}

#[tokio::test]
async fn test_store_failure_surfaces_as_unavailable() {
    let store = Arc::new(FlakyStore {
        inner: InMemoryTupleStore::new(),
        failing: RelationName::Parent,
    });
    let folder = EntityRef::folder("F");
    let doc = EntityRef::doc("1");
    store
        .inner
        .write(vec![
            Tuple::new(SubjectRef::user("alice"), RelationName::Owner, doc.clone()),
            Tuple::parent(&folder, &doc),
            Tuple::new(SubjectRef::user("bob"), RelationName::Viewer, folder.clone()),
        ])
        .await
        .unwrap();
    let engine = AuthorizationEngine::new(store);

    // The direct branches answer false, the folder branch cannot be read
    let err = engine
        .check(&SubjectRef::user("bob"), RelationName::CanRead, &doc)
        .await
        .unwrap_err();
    assert!(matches!(err, RebacError::StoreUnavailable(_)));

    // A branch that succeeds still wins over one that failed
    assert!(engine
        .check(&SubjectRef::user("alice"), RelationName::CanRead, &doc)
        .await
        .unwrap());

    let err = engine
        .list_objects(&SubjectRef::user("bob"), RelationName::CanRead, EntityType::Doc)
        .await
        .unwrap_err();
    assert!(err.is_unavailable());

    println!("✅ Store failures surface as StoreUnavailable");
}

#[tokio::test]
async fn test_disallowed_stored_tuple_is_ignored() {
    let store = Arc::new(InMemoryTupleStore::new());
    let doc = EntityRef::doc("1");

    // Documents are owned by users only; this row bypassed validation
    store
        .write(vec![
            Tuple::new(SubjectRef::group_members("eng"), RelationName::Owner, doc.clone()),
            Tuple::new(SubjectRef::user("carol"), RelationName::Member, EntityRef::group("eng")),
        ])
        .await
        .unwrap();
    let engine = AuthorizationEngine::new(store);
    let carol = SubjectRef::user("carol");

    assert!(!engine.check(&carol, RelationName::CanRead, &doc).await.unwrap());
    assert!(!engine.check(&carol, RelationName::CanWrite, &doc).await.unwrap());
    assert!(!engine
        .check(&SubjectRef::group_members("eng"), RelationName::Owner, &doc)
        .await
        .unwrap());
    assert!(engine
        .list_objects(&carol, RelationName::CanRead, EntityType::Doc)
        .await
        .unwrap()
        .is_empty());

    println!("✅ Disallowed stored tuple is ignored");
}

#[tokio::test]
async fn test_tuples_outlawed_by_new_schema_are_ignored() {
    let engine = AuthorizationEngine::new(Arc::new(InMemoryTupleStore::new()));
    let doc = EntityRef::doc("1");
    let alice = SubjectRef::user("alice");
    let bob = SubjectRef::user("bob");

    engine
        .grant(Tuple::new(alice.clone(), RelationName::Owner, doc.clone()))
        .await
        .unwrap();
    engine
        .grant(Tuple::new(bob.clone(), RelationName::Viewer, doc.clone()))
        .await
        .unwrap();
    assert!(engine.check(&bob, RelationName::CanRead, &doc).await.unwrap());

    // Documents may now only be shared with groups
    let mut definition = document_sharing_definition();
    for type_definition in definition.types.iter_mut().filter(|t| t.entity_type == EntityType::Doc) {
        for relation in type_definition
            .relations
            .iter_mut()
            .filter(|r| r.name == RelationName::Viewer)
        {
            relation.allowed_subjects = vec![SubjectType::userset(EntityType::Group, RelationName::Member)];
        }
    }
    let engine = engine.with_schema(Schema::from_definition(definition).unwrap());

    assert!(!engine.check(&bob, RelationName::CanRead, &doc).await.unwrap());
    assert!(engine
        .list_objects(&bob, RelationName::CanRead, EntityType::Doc)
        .await
        .unwrap()
        .is_empty());
    assert!(engine.check(&alice, RelationName::CanRead, &doc).await.unwrap());

    let err = engine
        .grant(Tuple::new(SubjectRef::user("dave"), RelationName::Viewer, doc.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, RebacError::InvalidTuple(_)));

    println!("✅ Tuples outlawed by a new schema are ignored");
}

// ============================================================================
// Property tests
// ============================================================================

fn tuple_for(kind: u8, a: u8, b: u8) -> Option<Tuple> {
    let id = |n: u8| n.to_string();
    let tuple = match kind {
        0 => Tuple::new(SubjectRef::user(&id(a)), RelationName::Member, EntityRef::group(&id(b))),
        1 if a != b => Tuple::new(
            SubjectRef::group_members(&id(a)),
            RelationName::Member,
            EntityRef::group(&id(b)),
        ),
        2 => Tuple::new(SubjectRef::user(&id(a)), RelationName::Viewer, EntityRef::folder(&id(b))),
        3 => Tuple::new(
            SubjectRef::group_members(&id(a)),
            RelationName::Viewer,
            EntityRef::folder(&id(b)),
        ),
        4 => Tuple::new(SubjectRef::user(&id(a)), RelationName::Owner, EntityRef::folder(&id(b))),
        5 => Tuple::parent(&EntityRef::folder(&id(a)), &EntityRef::folder(&id(b))),
        6 => Tuple::parent(&EntityRef::folder(&id(a)), &EntityRef::doc(&id(b))),
        7 => Tuple::new(SubjectRef::user(&id(a)), RelationName::Viewer, EntityRef::doc(&id(b))),
        8 => Tuple::new(SubjectRef::user(&id(a)), RelationName::Owner, EntityRef::doc(&id(b))),
        _ => return None,
    };
    Some(tuple)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_owner_grant_is_sound(user in "[a-z0-9|]{1,12}", doc in "[a-z0-9-]{1,12}") {
        runtime().block_on(async {
            let engine = create_test_engine();
            let subject = SubjectRef::user(&user);
            let object = EntityRef::doc(&doc);

            engine.grant(Tuple::new(subject.clone(), RelationName::Owner, object.clone())).await.unwrap();

            assert!(engine.check(&subject, RelationName::CanRead, &object).await.unwrap());
            assert!(engine.check(&subject, RelationName::CanWrite, &object).await.unwrap());
        });
    }

    #[test]
    fn prop_grant_then_revoke_restores_denial(user in "[a-z]{1,8}", folder in "[0-9]{1,4}") {
        runtime().block_on(async {
            let engine = create_test_engine();
            let subject = SubjectRef::user(&user);
            let object = EntityRef::folder(&folder);
            let tuple = Tuple::new(subject.clone(), RelationName::Viewer, object.clone());

            engine.grant(tuple.clone()).await.unwrap();
            engine.grant(tuple.clone()).await.unwrap();
            assert_eq!(engine.read_tuples(&TupleFilter::new().object(object.clone())).await.unwrap().len(), 1);

            engine.revoke(tuple).await.unwrap();
            assert!(!engine.check(&subject, RelationName::Viewer, &object).await.unwrap());
        });
    }

    #[test]
    fn prop_list_objects_agrees_with_check(
        ops in prop::collection::vec((0u8..9, 0u8..5, 0u8..5), 0..40)
    ) {
        runtime().block_on(async {
            let engine = AuthorizationEngine::new(Arc::new(InMemoryTupleStore::new()))
                .with_cache_ttl(Duration::ZERO)
                .with_limits(EvaluationLimits { max_depth: 32, max_dispatches: u32::MAX });

            for (kind, a, b) in ops {
                if let Some(tuple) = tuple_for(kind, a, b) {
                    // Cycles and second parents are rejected; everything else is written
                    let _ = engine.grant(tuple).await;
                }
            }

            let targets = [
                (RelationName::CanRead, EntityType::Doc),
                (RelationName::CanWrite, EntityType::Doc),
                (RelationName::Viewer, EntityType::Folder),
                (RelationName::CanCreateFile, EntityType::Folder),
                (RelationName::Member, EntityType::Group),
            ];

            for user in 0u8..5 {
                let subject = SubjectRef::user(&user.to_string());
                for (relation, object_type) in targets {
                    let listed = engine.list_objects(&subject, relation, object_type).await.unwrap();
                    let unique: BTreeSet<_> = listed.iter().cloned().collect();
                    assert_eq!(unique.len(), listed.len(), "duplicates in ListObjects");

                    let mut checked = BTreeSet::new();
                    for id in 0u8..5 {
                        let object = EntityRef::new(object_type, id.to_string());
                        if engine.check(&subject, relation, &object).await.unwrap() {
                            checked.insert(object);
                        }
                    }
                    assert_eq!(unique, checked, "{} {} {}", subject, relation, object_type);
                }
            }
        });
    }
}
