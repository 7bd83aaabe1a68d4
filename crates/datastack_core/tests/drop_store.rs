mod support;

use datastack_core::store::store_files;
use datastack_core::{attributes, StackStatus, StoreError};
use serde_json::json;
use support::{disk_stack, memory_stack, persist_and_wait, user_count};

#[test]
fn drop_removes_store_files_and_rebuilt_main_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let stack = disk_stack(dir.path());
    stack
        .main_context()
        .insert("User", attributes([("name", json!("Joshua Ivanof"))]))
        .unwrap();
    persist_and_wait(&stack).unwrap();
    let path = stack.store_path().unwrap();
    assert!(path.is_file());

    stack.drop_store().unwrap();

    assert_eq!(stack.status(), StackStatus::Uninitialized);
    assert!(store_files(&path).iter().all(|file| !file.exists()));
    assert_eq!(user_count(&stack.main_context()), 0);
    assert_eq!(stack.status(), StackStatus::Open);
}

#[test]
fn drop_tolerates_missing_files() {
    let dir = tempfile::tempdir().unwrap();
    let stack = disk_stack(dir.path());

    stack.drop_store().unwrap();
    stack.drop_store().unwrap();
    assert_eq!(stack.status(), StackStatus::Uninitialized);
}

#[test]
fn drop_reports_files_it_could_not_remove() {
    let dir = tempfile::tempdir().unwrap();
    let stack = disk_stack(dir.path());
    let path = stack.store_path().unwrap();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"").unwrap();
    let shm = store_files(&path)[1].clone();
    std::fs::create_dir_all(shm.join("occupied")).unwrap();

    match stack.drop_store().unwrap_err() {
        StoreError::Drop(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].path, shm);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!path.exists());
}

#[test]
fn dropping_in_memory_store_resets_the_stack() {
    let stack = memory_stack();
    let main = stack.main_context();
    main.insert("User", attributes([("name", json!("scratch"))]))
        .unwrap();
    persist_and_wait(&stack).unwrap();

    stack.drop_store().unwrap();

    let rebuilt = stack.main_context();
    assert!(!rebuilt.same_context(&main));
    assert_eq!(user_count(&rebuilt), 0);
}

#[test]
fn saves_from_contexts_created_before_drop_are_discarded() {
    let stack = memory_stack();
    let stale = stack.new_background_context(Some("stale"));

    stack.drop_store().unwrap();
    stale
        .insert("User", attributes([("name", json!("stale"))]))
        .unwrap();
    stale.save().unwrap();

    let main = stack.main_context();
    assert_eq!(user_count(&main), 0);
    assert!(!main.has_changes());
}
