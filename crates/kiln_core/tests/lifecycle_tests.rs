//! Integration tests for the sandbox lifecycle manager.

use std::sync::Arc;
use std::time::Duration;

use kiln_core::{
    Application, ApplicationStatus, ApplicationStore, ApplicationUpdate, CoreError,
    LifecycleManager, MemoryStore, PortAllocator, SandboxRequest, SandboxSettings, SandboxStatus,
    SandboxStore,
};
use kiln_runner::{MockRuntime, SandboxRuntime, SandboxState};

struct Harness {
    runtime: MockRuntime,
    store: Arc<MemoryStore>,
    lifecycle: Arc<LifecycleManager>,
}

fn harness(runtime: MockRuntime) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let settings = SandboxSettings {
        port_range_start: 6000,
        port_range_end: 6099,
        ..SandboxSettings::default()
    };
    let lifecycle = LifecycleManager::new(
        Arc::new(runtime.clone()),
        store.clone(),
        store.clone(),
        settings,
    )
    .with_allocator(PortAllocator::new(6000, 6099).without_host_probe());

    Harness {
        runtime,
        store,
        lifecycle: Arc::new(lifecycle),
    }
}

async fn new_app(store: &MemoryStore, name: &str) -> Application {
    store
        .insert_application(Application::new("owner-1", name))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_concurrent_get_or_create_yields_one_sandbox() {
    let h = harness(MockRuntime::new().with_create_delay(Duration::from_millis(20)));
    let app = new_app(&h.store, "Todo").await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let lifecycle = h.lifecycle.clone();
        let id = app.id.clone();
        tasks.push(tokio::spawn(async move { lifecycle.get_or_create(&id).await }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap().handle);
    }

    assert_eq!(h.runtime.created_count(), 1);
    assert!(handles.iter().all(|handle| handle == &handles[0]));

    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert_eq!(stored.sandbox_handle.as_deref(), Some(handles[0].as_str()));
    assert!(stored.port.is_some());
}

#[tokio::test]
async fn test_get_or_create_requires_application() {
    let h = harness(MockRuntime::new());
    let err = h.lifecycle.get_or_create("missing").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(h.runtime.created_count(), 0);
}

#[tokio::test]
async fn test_create_records_running_sandbox_with_workdir() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store, "Todo").await;

    let record = h
        .lifecycle
        .create_and_start(&app.id, SandboxRequest::from_settings(h.lifecycle.settings()).host_port(6010))
        .await
        .unwrap();

    assert_eq!(record.status, SandboxStatus::Running);
    assert_eq!(record.port, Some(6010));
    assert!(h
        .runtime
        .exec_commands()
        .iter()
        .any(|cmd| cmd == "mkdir -p /app"));

    let spec = h.runtime.spec_of(&record.handle).unwrap();
    assert_eq!(spec.ports.get(&8000), Some(&6010));
    assert_eq!(spec.limits.memory_mb, 512);
}

#[tokio::test]
async fn test_runtime_unavailable_leaves_no_running_record() {
    let h = harness(MockRuntime::new().simulate_unavailable());
    let app = new_app(&h.store, "Todo").await;

    let err = h.lifecycle.get_or_create(&app.id).await.unwrap_err();
    assert!(matches!(err, CoreError::RuntimeUnavailable(_)));

    let record = h.store.get_sandbox(&app.id).await.unwrap();
    assert!(record.map_or(true, |r| r.status != SandboxStatus::Running));
}

#[tokio::test]
async fn test_start_failure_marks_record_error() {
    let h = harness(MockRuntime::new().fail_method("start"));
    let app = new_app(&h.store, "Todo").await;

    assert!(h.lifecycle.get_or_create(&app.id).await.is_err());

    let record = h.store.get_sandbox(&app.id).await.unwrap().unwrap();
    assert_eq!(record.status, SandboxStatus::Error);
}

#[tokio::test]
async fn test_get_or_allocate_port_is_idempotent() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store, "Todo").await;

    let first = h.lifecycle.get_or_allocate_port(&app.id).await.unwrap();
    let second = h.lifecycle.get_or_allocate_port(&app.id).await.unwrap();
    assert_eq!(first, second);

    h.lifecycle.get_or_create(&app.id).await.unwrap();
    let third = h.lifecycle.get_or_allocate_port(&app.id).await.unwrap();
    assert_eq!(first, third);
}

#[tokio::test]
async fn test_port_recovered_from_runtime_binding() {
    let h = harness(MockRuntime::new().remap_ports_to(6050));
    let app = new_app(&h.store, "Todo").await;

    let record = h.lifecycle.get_or_create(&app.id).await.unwrap();
    assert_eq!(record.port, Some(6050));

    h.store
        .update_sandbox(&app.id, kiln_core::SandboxUpdate::default().port(None))
        .await
        .unwrap();
    let port = h.lifecycle.get_or_allocate_port(&app.id).await.unwrap();
    assert_eq!(port, 6050);
    assert_eq!(h.store.get_sandbox(&app.id).await.unwrap().unwrap().port, Some(6050));
}

#[tokio::test]
async fn test_port_allocated_fresh_without_binding() {
    let h = harness(MockRuntime::new().hide_port_mappings());
    let app = new_app(&h.store, "Todo").await;

    let record = h.lifecycle.get_or_create(&app.id).await.unwrap();
    let requested = record.port.unwrap();
    h.store
        .update_sandbox(&app.id, kiln_core::SandboxUpdate::default().port(None))
        .await
        .unwrap();

    let port = h.lifecycle.get_or_allocate_port(&app.id).await.unwrap();
    assert_eq!(port, requested);
}

#[tokio::test]
async fn test_applications_get_distinct_ports() {
    let h = harness(MockRuntime::new());
    let a = new_app(&h.store, "A").await;
    let b = new_app(&h.store, "B").await;

    let port_a = h.lifecycle.get_or_create(&a.id).await.unwrap().port;
    let port_b = h.lifecycle.get_or_create(&b.id).await.unwrap().port;
    assert_ne!(port_a, port_b);
}

#[tokio::test]
async fn test_task_descriptor_round_trip() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store, "Todo").await;

    h.lifecycle
        .write_task_descriptor(&app.id, "A todo list")
        .await
        .unwrap();
    h.lifecycle
        .write_task_descriptor(&app.id, "A todo list with due dates and tags")
        .await
        .unwrap();

    let content = h
        .lifecycle
        .read_file(&app.id, "/app/task.md")
        .await
        .unwrap()
        .unwrap();
    assert!(content.contains("A todo list with due dates and tags"));
    assert_eq!(h.runtime.created_count(), 1);
}

#[tokio::test]
async fn test_task_descriptor_keeps_requirements_verbatim() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store, "Todo").await;
    let requirements = "  - a todo list\n  - with tags\n";

    h.lifecycle
        .write_task_descriptor(&app.id, requirements)
        .await
        .unwrap();

    let content = h
        .lifecycle
        .read_file(&app.id, "/app/task.md")
        .await
        .unwrap()
        .unwrap();
    assert!(content.contains(requirements));
}

#[tokio::test]
async fn test_stopped_sandbox_is_restarted() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store, "Todo").await;

    let record = h.lifecycle.get_or_create(&app.id).await.unwrap();
    h.lifecycle.stop(&app.id).await.unwrap();
    assert_eq!(
        h.store.get_sandbox(&app.id).await.unwrap().unwrap().status,
        SandboxStatus::Stopped
    );

    let again = h.lifecycle.get_or_create(&app.id).await.unwrap();
    assert_eq!(again.handle, record.handle);
    assert_eq!(again.status, SandboxStatus::Running);
    assert_eq!(
        h.runtime.status(&record.handle).await.unwrap(),
        SandboxState::Running
    );
}

#[tokio::test]
async fn test_vanished_sandbox_is_recreated() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store, "Todo").await;

    let first = h.lifecycle.get_or_create(&app.id).await.unwrap();
    h.runtime.forget_sandbox(&first.handle);

    let second = h.lifecycle.get_or_create(&app.id).await.unwrap();
    assert_ne!(first.handle, second.handle);
    assert_eq!(h.runtime.created_count(), 2);

    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert_eq!(stored.sandbox_handle, Some(second.handle));
}

#[tokio::test]
async fn test_stop_moves_running_application_to_stopped() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store, "Todo").await;
    h.lifecycle.get_or_create(&app.id).await.unwrap();
    h.store
        .update_application(
            &app.id,
            ApplicationUpdate::new()
                .requirements("A todo list")
                .status(ApplicationStatus::Running),
        )
        .await
        .unwrap();

    h.lifecycle.stop(&app.id).await.unwrap();

    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApplicationStatus::Stopped);
}

#[tokio::test]
async fn test_stop_without_sandbox_is_not_found() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store, "Todo").await;
    assert!(h.lifecycle.stop(&app.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_delete_tolerates_missing_environment() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store, "Todo").await;

    let record = h.lifecycle.get_or_create(&app.id).await.unwrap();
    h.runtime.forget_sandbox(&record.handle);

    h.lifecycle.delete(&app.id).await.unwrap();
    assert!(h.store.get_sandbox(&app.id).await.unwrap().is_none());

    // Second delete has nothing to do
    h.lifecycle.delete(&app.id).await.unwrap();

    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert!(stored.sandbox_handle.is_none());
}

#[tokio::test]
async fn test_delete_application_removes_everything() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store, "Todo").await;
    h.lifecycle.get_or_create(&app.id).await.unwrap();

    h.lifecycle.delete_application(&app.id).await.unwrap();

    assert!(h.store.get_application(&app.id).await.unwrap().is_none());
    assert!(h.store.get_sandbox(&app.id).await.unwrap().is_none());
    assert!(h.runtime.handles().is_empty());
    assert!(h
        .lifecycle
        .delete_application(&app.id)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_file_tree_lists_workdir() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store, "Todo").await;

    h.lifecycle
        .write_file(&app.id, "/app/index.html", "<h1>hi</h1>")
        .await
        .unwrap();

    let tree = h.lifecycle.file_tree(&app.id, None).await.unwrap();
    assert!(tree.iter().any(|node| node.name == "index.html"));
}
