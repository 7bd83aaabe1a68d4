mod support;

use datastack_core::{attributes, Confinement, ContextKind};
use serde_json::json;
use support::{disk_stack, memory_stack, persist_and_wait, user_count};

#[test]
fn save_on_disposable_context_is_a_no_op() {
    let stack = memory_stack();
    let scratch = stack.new_disposable_main_context();
    scratch
        .insert("User", attributes([("name", json!("scratch"))]))
        .unwrap();
    assert!(scratch.has_changes());
    assert_eq!(user_count(&scratch), 1);

    scratch.save().unwrap();

    assert!(!scratch.has_changes());
    assert_eq!(user_count(&scratch), 0);
    assert_eq!(scratch.kind(), ContextKind::Disposable);
    assert_eq!(scratch.confinement(), Confinement::UiThread);
}

#[test]
fn disposable_contexts_never_reach_the_real_store() {
    let dir = tempfile::tempdir().unwrap();
    let stack = disk_stack(dir.path());
    let main = stack.main_context();
    main.insert("User", attributes([("name", json!("real"))]))
        .unwrap();
    persist_and_wait(&stack).unwrap();

    let scratch = stack.new_disposable_main_context();
    assert_eq!(user_count(&scratch), 0);
    scratch
        .insert("User", attributes([("name", json!("draft"))]))
        .unwrap();
    scratch.save().unwrap();
    persist_and_wait(&stack).unwrap();

    assert_eq!(user_count(&main), 1);
    assert_eq!(user_count(&stack.new_disposable_main_context()), 0);
}
