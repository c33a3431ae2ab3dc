//! Integration tests for the generation pipeline.

use std::sync::Arc;

use kiln_core::{
    Application, ApplicationStatus, ApplicationStore, ApplicationUpdate, GenerationPipeline,
    LifecycleManager, MemoryStore, PipelineSettings, PortAllocator, ProgressEvent,
    SandboxSettings, ToolInvocation,
};
use kiln_runner::{ExecOutput, MockRuntime};
use kiln_templates::{classify_project, ProjectType};

struct Harness {
    runtime: MockRuntime,
    store: Arc<MemoryStore>,
    pipeline: GenerationPipeline,
}

fn harness(runtime: MockRuntime) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let lifecycle = LifecycleManager::new(
        Arc::new(runtime.clone()),
        store.clone(),
        store.clone(),
        SandboxSettings::default(),
    )
    .with_allocator(PortAllocator::new(7000, 7099).without_host_probe());

    let settings = PipelineSettings {
        static_settle_ms: 1,
        dev_server_settle_ms: 1,
        ..PipelineSettings::default()
    };

    Harness {
        runtime,
        store: store.clone(),
        pipeline: GenerationPipeline::new(Arc::new(lifecycle), settings),
    }
}

async fn new_app(store: &MemoryStore) -> Application {
    store
        .insert_application(Application::new("owner-1", "Todo"))
        .await
        .unwrap()
}

fn done_count(events: &[ProgressEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

fn created_files(events: &[ProgressEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::ToolCall(ToolInvocation::CreateFile { path, .. }) => Some(path.clone()),
            _ => None,
        })
        .collect()
}

fn texts(events: &[ProgressEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Text { content } => Some(content.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_todo_list_deploys_static_site() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store).await;

    assert_eq!(classify_project("a todo list app"), ProjectType::Static);

    let events = h
        .pipeline
        .generate_and_deploy(&app.id, "a todo list app")
        .collect_events()
        .await;

    assert_eq!(done_count(&events), 1);
    assert!(events.last().unwrap().is_terminal());
    assert!(!events.iter().any(|e| e.is_error()));
    assert_eq!(
        created_files(&events),
        vec!["/app/index.html", "/app/styles.css", "/app/app.js"]
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::ToolCall(ToolInvocation::StartServer { .. }))));

    let handle = h.runtime.handles().pop().unwrap();
    let index = h.runtime.file(&handle, "/app/index.html").unwrap();
    assert!(index.contains("a todo list app"));
    let server = h.runtime.file(&handle, "/tmp/server.js").unwrap();
    assert!(server.contains("8000"));

    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApplicationStatus::Running);
    assert!(stored.last_deployed_at.is_some());
    let preview = stored.preview_url.unwrap();
    assert!(!preview.is_empty());
    assert_eq!(preview, format!("http://localhost:{}", stored.port.unwrap()));
}

#[tokio::test]
async fn test_interactive_requirements_use_dynamic_template() {
    let requirements = "interactive form with API calls";
    assert_eq!(classify_project(requirements), ProjectType::Dynamic);

    let h = harness(MockRuntime::new());
    let app = new_app(&h.store).await;
    let events = h
        .pipeline
        .generate_and_deploy(&app.id, requirements)
        .collect_events()
        .await;

    assert_eq!(done_count(&events), 1);
    assert_eq!(created_files(&events).len(), 3);
    assert!(texts(&events)
        .iter()
        .any(|t| t.contains(ProjectType::Dynamic.label())));
}

#[tokio::test]
async fn test_failed_install_is_not_fatal() {
    let h = harness(MockRuntime::new().on_exec(
        "npm install",
        ExecOutput::new(1, "npm ERR! network timeout"),
    ));
    let app = new_app(&h.store).await;

    let events = h
        .pipeline
        .generate_and_deploy(&app.id, "a React dashboard")
        .collect_events()
        .await;

    assert_eq!(done_count(&events), 1);
    assert!(!events.iter().any(|e| e.is_error()));
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::ToolCallResult { tool, result } if tool == "install_dependencies" && !result.success
    )));
    assert!(texts(&events).iter().any(|t| t.starts_with("Warning:")));
    assert_eq!(created_files(&events).len(), 6);

    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApplicationStatus::Running);
}

#[tokio::test]
async fn test_unreachable_server_is_advisory() {
    let h = harness(MockRuntime::new().on_exec("nc -z", ExecOutput::new(1, "")));
    let app = new_app(&h.store).await;

    let events = h
        .pipeline
        .generate_and_deploy(&app.id, "a todo list app")
        .collect_events()
        .await;

    assert_eq!(done_count(&events), 1);
    let texts = texts(&events);
    assert!(texts.iter().any(|t| t.contains("verification incomplete")));
    assert!(texts.iter().any(|t| t.starts_with("Log preview:")));

    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApplicationStatus::Running);
}

#[tokio::test]
async fn test_runtime_outage_ends_in_single_error() {
    let h = harness(MockRuntime::new().simulate_unavailable());
    let app = new_app(&h.store).await;

    let events = h
        .pipeline
        .generate_and_deploy(&app.id, "a todo list app")
        .collect_events()
        .await;

    assert_eq!(done_count(&events), 1);
    let errors: Vec<_> = events.iter().filter(|e| e.is_error()).collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0],
        ProgressEvent::Error { code, .. } if code == "runtime_unavailable"
    ));
    assert!(events[events.len() - 2].is_error());

    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApplicationStatus::Error);
}

#[tokio::test]
async fn test_file_write_failure_reports_tool_result() {
    let h = harness(MockRuntime::new().fail_method("write_file"));
    let app = new_app(&h.store).await;

    let events = h
        .pipeline
        .generate_and_deploy(&app.id, "a todo list app")
        .collect_events()
        .await;

    assert_eq!(done_count(&events), 1);
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::ToolCallResult { tool, result } if tool == "create_file" && !result.success
    )));
    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApplicationStatus::Error);
}

#[tokio::test]
async fn test_unknown_application() {
    let h = harness(MockRuntime::new());
    let events = h
        .pipeline
        .generate_and_deploy("missing", "a todo list app")
        .collect_events()
        .await;

    assert_eq!(done_count(&events), 1);
    assert!(matches!(
        &events[0],
        ProgressEvent::Error { code, .. } if code == "not_found"
    ));
    assert_eq!(h.runtime.created_count(), 0);
}

#[tokio::test]
async fn test_regeneration_reuses_sandbox() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store).await;

    for _ in 0..2 {
        let events = h
            .pipeline
            .generate_and_deploy(&app.id, "a todo list app")
            .collect_events()
            .await;
        assert!(!events.iter().any(|e| e.is_error()));
    }

    assert_eq!(h.runtime.created_count(), 1);
    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApplicationStatus::Running);
}

#[tokio::test]
async fn test_recovers_after_error() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store).await;

    h.runtime.set_unavailable(true);
    let failed = h
        .pipeline
        .generate_and_deploy(&app.id, "a todo list app")
        .collect_events()
        .await;
    assert!(failed.iter().any(|e| e.is_error()));

    h.runtime.set_unavailable(false);
    let events = h
        .pipeline
        .generate_and_deploy(&app.id, "a todo list app")
        .collect_events()
        .await;
    assert!(!events.iter().any(|e| e.is_error()));

    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApplicationStatus::Running);
}

#[tokio::test]
async fn test_regeneration_stops_previous_server_first() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store).await;

    h.pipeline
        .generate_and_deploy(&app.id, "a todo list app")
        .collect_events()
        .await;
    let first_run = h.runtime.exec_commands().len();

    let events = h
        .pipeline
        .generate_and_deploy(&app.id, "a todo list app with tags")
        .collect_events()
        .await;
    assert!(!events.iter().any(|e| e.is_error()));

    let second_run: Vec<String> = h.runtime.exec_commands().split_off(first_run);
    let stop = second_run
        .iter()
        .position(|c| c.contains("kill $(cat /tmp/server.pid)"))
        .expect("previous server is stopped");
    let start = second_run
        .iter()
        .position(|c| c.contains("nohup node"))
        .expect("server is started");
    assert!(stop < start);
    assert_eq!(second_run.iter().filter(|c| c.contains("nohup")).count(), 1);
    assert_eq!(h.runtime.created_count(), 1);
}

#[tokio::test]
async fn test_retry_after_interrupted_deploy() {
    let h = harness(MockRuntime::new());
    let app = new_app(&h.store).await;

    for status in [
        ApplicationStatus::RequirementsConfirmed,
        ApplicationStatus::Generating,
        ApplicationStatus::Deploying,
    ] {
        h.store
            .update_application(&app.id, ApplicationUpdate::new().status(status))
            .await
            .unwrap();
    }

    let events = h
        .pipeline
        .generate_and_deploy(&app.id, "a todo list app")
        .collect_events()
        .await;

    assert!(!events.iter().any(|e| e.is_error()));
    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApplicationStatus::Running);
}
