use std::sync::Arc;
use tenant_migration::testing::{group, user, InMemoryDirectory};
use tenant_migration::{
    load_ledger, DeleteError, DirectoryProcessor, MigrationError, ObjectKey, ObjectKind, ObjectStatus, Orchestrator,
    RollbackManager, RunConfig, RunOptions, StructuralError,
};

fn orchestrator(source: &Arc<InMemoryDirectory>, destination: &Arc<InMemoryDirectory>) -> Orchestrator {
    let users = DirectoryProcessor::new(ObjectKind::User, source.clone(), destination.clone());
    let groups = DirectoryProcessor::new(ObjectKind::Group, source.clone(), destination.clone());
    let mut orchestrator = Orchestrator::new();
    orchestrator.register("users", &[], Arc::new(users)).unwrap();
    orchestrator.register("groups", &["users"], Arc::new(groups)).unwrap();
    orchestrator
}

fn source() -> Arc<InMemoryDirectory> {
    let source = Arc::new(InMemoryDirectory::new("src"));
    source
        .insert("u1", user("ann"))
        .insert("u2", user("bob"))
        .insert("g1", group("eng", &["u1", "u2"]));
    source
}

#[tokio::test]
async fn test_rollback_removes_only_created_objects() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.json");
    let source = source();
    let destination = Arc::new(InMemoryDirectory::new("dst"));
    destination.insert("existing", user("admin"));
    let orchestrator = orchestrator(&source, &destination);

    orchestrator
        .start(RunConfig::new("contoso", "fabrikam", &path))
        .await
        .unwrap();
    assert_eq!(destination.len(), 4);

    let report = RollbackManager::new(&orchestrator)
        .unwrap()
        .rollback_ledger(&path)
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.deleted.len(), 3);
    assert_eq!(report.deleted[0].phase, "groups");
    assert_eq!(destination.len(), 1);
    assert!(destination.get("existing").is_some());

    let run = load_ledger(&path).unwrap();
    assert!(run.rolled_back_at_millis.is_some());
    assert_eq!(run.rollback.len(), 3, "manifest is kept for audit");
    assert!(tenant_migration::report(&path).unwrap().rolled_back);
}

#[tokio::test]
async fn test_rolled_back_run_refuses_resume() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.json");
    let source = source();
    let destination = Arc::new(InMemoryDirectory::new("dst"));
    let orchestrator = orchestrator(&source, &destination);

    orchestrator
        .start(RunConfig::new("contoso", "fabrikam", &path))
        .await
        .unwrap();
    RollbackManager::new(&orchestrator)
        .unwrap()
        .rollback_ledger(&path)
        .await
        .unwrap();
    let calls = destination.create_calls();

    let err = orchestrator.resume(&path).await.unwrap_err();

    assert!(matches!(err, MigrationError::Structural(StructuralError::RolledBack(_))));
    assert_eq!(destination.create_calls(), calls);
    assert!(destination.is_empty());
}

#[tokio::test]
async fn test_rollback_continues_past_failed_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.json");
    let source = source();
    let destination = Arc::new(InMemoryDirectory::new("dst"));
    let orchestrator = orchestrator(&source, &destination);
    orchestrator
        .start(RunConfig::new("contoso", "fabrikam", &path))
        .await
        .unwrap();

    let group_id = destination.objects_of(ObjectKind::Group)[0].id.clone();
    destination.fail_delete(&group_id, DeleteError::Failed("insufficient privileges".into()));

    let report = RollbackManager::new(&orchestrator)
        .unwrap()
        .rollback_ledger(&path)
        .await
        .unwrap();

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].destination_id, group_id);
    assert_eq!(report.deleted.len(), 2);
    assert_eq!(destination.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_object_created_behind_lost_response_is_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.json");
    let source = source();
    let destination = Arc::new(InMemoryDirectory::new("dst"));
    destination.lose_next_create_responses(1);
    let orchestrator = orchestrator(&source, &destination);

    let outcome = orchestrator
        .start(RunConfig::new("contoso", "fabrikam", &path))
        .await
        .unwrap();

    // The retry conflicts with the object the first attempt created
    assert!(outcome.is_success());
    assert_eq!(destination.created().len(), 3);
    let run = load_ledger(&path).unwrap();
    let ann = run.record("users", &ObjectKey::from("user:u1")).unwrap();
    assert_eq!(ann.attempts, 2);
    assert_eq!(run.rollback.len(), 3);
    assert!(run
        .rollback
        .destination_ids()
        .contains(&ann.destination_id.as_deref().unwrap()));

    let report = RollbackManager::new(&orchestrator)
        .unwrap()
        .rollback_ledger(&path)
        .await
        .unwrap();

    assert_eq!(report.deleted.len(), 3);
    assert!(destination.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lost_response_on_last_attempt_is_attributed_on_resume() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.json");
    let source = source();
    let destination = Arc::new(InMemoryDirectory::new("dst"));
    destination.lose_next_create_responses(1);
    let orchestrator = orchestrator(&source, &destination);
    let options = RunOptions {
        max_retry: 1,
        ..RunOptions::default()
    };

    let first = orchestrator
        .start(RunConfig::new("contoso", "fabrikam", &path).with_options(options))
        .await
        .unwrap();

    assert_eq!(first.exit_code(), 1);
    let run = load_ledger(&path).unwrap();
    let ann = run.record("users", &ObjectKey::from("user:u1")).unwrap();
    assert_eq!(ann.status, ObjectStatus::Failed);
    assert!(ann.create_outcome_unknown);
    assert_eq!(destination.len(), 2);

    let second = orchestrator.resume(&path).await.unwrap();
    assert!(second.is_success());
    assert_eq!(load_ledger(&path).unwrap().rollback.len(), 3);

    RollbackManager::new(&orchestrator)
        .unwrap()
        .rollback_ledger(&path)
        .await
        .unwrap();
    assert!(destination.is_empty());
}
