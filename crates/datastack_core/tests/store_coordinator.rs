mod support;

use datastack_core::store::{store_files, CoordinatorOptions};
use datastack_core::{
    attributes, ChangeSet, ManagedObject, StoreCoordinator, StoreError, StoreLocation,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use support::{FailingBackupExclusion, RecordingBackupExclusion};

fn coordinator_at(path: &Path, seed: Option<PathBuf>) -> StoreCoordinator {
    StoreCoordinator::new(
        StoreLocation::OnDisk {
            path: path.to_path_buf(),
            seed,
        },
        CoordinatorOptions {
            exclude_from_backup: false,
            ..CoordinatorOptions::default()
        },
    )
}

fn insert_user(coordinator: &StoreCoordinator, name: &str) -> ManagedObject {
    let user = ManagedObject::new("User", attributes([("name", json!(name))]));
    let mut changes = ChangeSet::new();
    changes.record_insert(user.clone());
    coordinator.commit(&changes).unwrap();
    user
}

#[test]
fn open_is_idempotent_and_creates_the_store_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/store/Model.sqlite");
    let coordinator = coordinator_at(&path, None);

    assert!(!coordinator.is_open());
    coordinator.open().unwrap();
    coordinator.open().unwrap();

    assert!(coordinator.is_open());
    assert!(path.is_file());
}

#[test]
fn commit_applies_inserts_updates_and_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator_at(&dir.path().join("Model.sqlite"), None);
    let kept = insert_user(&coordinator, "kept");
    let gone = insert_user(&coordinator, "gone");

    let mut renamed = kept.clone();
    renamed.attributes.insert("name".into(), json!("renamed"));
    let mut changes = ChangeSet::new();
    changes.record_update(renamed, ["name".to_string()]);
    changes.record_delete(gone.id, "User");
    coordinator.commit(&changes).unwrap();

    let users = coordinator.fetch("User").unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].id, kept.id);
    assert_eq!(users[0].get_str("name"), Some("renamed"));
    assert!(coordinator.fetch_object(gone.id).unwrap().is_none());
}

#[test]
fn seed_is_copied_on_first_open_only() {
    let dir = tempfile::tempdir().unwrap();
    let seed = dir.path().join("bundle/Model.sqlite");
    let seeder = coordinator_at(&seed, None);
    insert_user(&seeder, "Joshua Ivanof");
    seeder.close();

    let path = dir.path().join("store/Model.sqlite");
    let first = coordinator_at(&path, Some(seed.clone()));
    assert_eq!(first.fetch("User").unwrap().len(), 1);
    assert_eq!(first.delete_entity("User").unwrap(), 1);
    first.close();

    let second = coordinator_at(&path, Some(seed));
    assert!(second.fetch("User").unwrap().is_empty());
}

#[test]
fn missing_seed_opens_an_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator_at(
        &dir.path().join("Model.sqlite"),
        Some(dir.path().join("bundle/Model.sqlite")),
    );

    assert_eq!(coordinator.count_objects().unwrap(), 0);
}

#[test]
fn corrupt_store_is_deleted_and_recreated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Model.sqlite");
    std::fs::write(&path, "this is not a sqlite store\n".repeat(200)).unwrap();

    let coordinator = coordinator_at(&path, None);
    coordinator.open().unwrap();

    assert_eq!(coordinator.count_objects().unwrap(), 0);
    insert_user(&coordinator, "after recovery");
    assert_eq!(coordinator.count_objects().unwrap(), 1);
}

#[test]
#[should_panic(expected = "store_recover")]
fn unremovable_store_path_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Model.sqlite");
    std::fs::create_dir_all(path.join("occupied")).unwrap();

    let _ = coordinator_at(&path, None).open();
}

#[test]
fn backup_exclusion_runs_after_open_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Model.sqlite");
    let backup = Arc::new(RecordingBackupExclusion::default());
    let coordinator = StoreCoordinator::new(
        StoreLocation::OnDisk {
            path: path.clone(),
            seed: None,
        },
        CoordinatorOptions {
            exclude_from_backup: true,
            backup_exclusion: backup.clone(),
        },
    );

    coordinator.open().unwrap();
    coordinator.open().unwrap();

    assert_eq!(backup.excluded(), vec![path]);
}

#[test]
#[should_panic(expected = "backup_exclude")]
fn backup_exclusion_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = StoreCoordinator::new(
        StoreLocation::OnDisk {
            path: dir.path().join("Model.sqlite"),
            seed: None,
        },
        CoordinatorOptions {
            exclude_from_backup: true,
            backup_exclusion: Arc::new(FailingBackupExclusion),
        },
    );

    let _ = coordinator.open();
}

#[test]
fn drop_store_removes_files_and_closes_for_good() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Model.sqlite");
    let coordinator = coordinator_at(&path, None);
    insert_user(&coordinator, "doomed");

    coordinator.drop_store().unwrap();

    assert!(store_files(&path).iter().all(|file| !file.exists()));
    assert!(coordinator.is_closed());
    assert!(matches!(coordinator.fetch("User"), Err(StoreError::Closed)));
    assert!(matches!(coordinator.open(), Err(StoreError::Closed)));
    coordinator.drop_store().unwrap();
}

#[test]
fn drop_reports_each_file_it_could_not_remove() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Model.sqlite");
    std::fs::write(&path, b"").unwrap();
    let wal = dir.path().join("Model.sqlite-wal");
    std::fs::create_dir_all(wal.join("occupied")).unwrap();

    let err = coordinator_at(&path, None).drop_store().unwrap_err();

    match err {
        StoreError::Drop(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].path, wal);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!path.exists());
}

#[test]
fn in_memory_store_never_touches_the_filesystem() {
    let coordinator = StoreCoordinator::in_memory();
    insert_user(&coordinator, "scratch");

    assert!(coordinator.location().path().is_none());
    assert_eq!(coordinator.count_objects().unwrap(), 1);
    coordinator.drop_store().unwrap();
}
