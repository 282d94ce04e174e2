//! Editor-facing E2E tests driving the LspService

mod helper;

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tower::Service;
use tower_lsp::LspService;
use tower_lsp::jsonrpc::Request;

use helper::{
    FakeFactory, Fixture, create_did_change_configuration_notification,
    create_did_change_watched_files_notification,
    create_did_change_workspace_folders_notification, create_did_open_notification,
    create_hover_request, create_initialize_request_with_capabilities,
    create_initialized_notification, settle, spawn_notification_collector,
    wait_for_notification,
};
use python_ls_broker::activation::{
    Backends, OptionsServices, Selector, Variant, VariantServices,
};
use python_ls_broker::config::Settings;
use python_ls_broker::lsp::host::HostWorkspace;
use python_ls_broker::lsp::proxy::Proxy;
use python_ls_broker::middleware::Method;

struct Harness {
    fixture: Fixture,
    service: LspService<Proxy>,
    notifications: mpsc::UnboundedReceiver<Request>,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(json!({})).await
    }

    async fn start_with(capabilities: serde_json::Value) -> Self {
        let mut fixture = Fixture::new(Vec::new());
        fixture.full = FakeFactory::new(Variant::FullB, fixture.telemetry.clone()).with_response(
            Method::Hover,
            json!({"contents": {"kind": "markdown", "value": "doc"}}),
        );

        let host = Arc::new(HostWorkspace::new(Settings::default()));
        let options = OptionsServices::new(
            host.clone(),
            host.clone(),
            fixture.environment.clone(),
            fixture.events.clone(),
        );
        let services = VariantServices {
            settings: host.clone(),
            ..fixture.variant_services()
        };
        let selector = Selector::new(
            fixture.runtime.clone(),
            services,
            options,
            Backends::new()
                .with(Arc::new(fixture.full.clone()))
                .with(Arc::new(fixture.simple.clone())),
        );
        let events = fixture.events.clone();

        let (mut service, socket) =
            LspService::build(move |client| Proxy::new(client, host, events, selector)).finish();
        let notifications = spawn_notification_collector(socket);

        service
            .call(create_initialize_request_with_capabilities(
                1,
                &["file:///proj"],
                capabilities,
            ))
            .await
            .unwrap();
        service
            .call(create_initialized_notification())
            .await
            .unwrap();

        Self {
            fixture,
            service,
            notifications,
        }
    }

    async fn send(&mut self, request: Request) -> Option<serde_json::Value> {
        self.service
            .call(request)
            .await
            .unwrap()
            .and_then(|response| response.result().cloned())
    }
}

#[tokio::test(start_paused = true)]
async fn requests_are_routed_to_the_activated_backend() {
    let mut h = Harness::start().await;

    h.send(create_did_open_notification("file:///proj/a.py", "import os\n"))
        .await;
    let hover = h.send(create_hover_request(2, "file:///proj/a.py")).await;

    assert_eq!(
        hover,
        Some(json!({"contents": {"kind": "markdown", "value": "doc"}}))
    );
    assert_eq!(h.fixture.full.counters.started(), 1);
    assert_eq!(h.fixture.full.counters.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn resolve_without_backend_answer_returns_the_item() {
    let mut h = Harness::start().await;
    h.send(create_did_open_notification("file:///proj/a.py", ""))
        .await;

    let resolved = h
        .send(
            Request::build("completionItem/resolve")
                .id(3)
                .params(json!({"label": "path"}))
                .finish(),
        )
        .await;

    assert_eq!(resolved, Some(json!({"label": "path"})));
}

#[tokio::test(start_paused = true)]
async fn extra_paths_change_restarts_the_backend() {
    let mut h = Harness::start().await;
    h.send(create_did_open_notification("file:///proj/a.py", ""))
        .await;

    h.send(create_did_change_configuration_notification(
        json!({"editor": {"tabSize": 2}}),
    ))
    .await;
    settle().await;
    assert_eq!(h.fixture.full.counters.started(), 1);

    h.send(create_did_change_configuration_notification(
        json!({"python": {"extraPaths": ["/opt/lib"]}}),
    ))
    .await;
    settle().await;

    assert_eq!(h.fixture.full.counters.started(), 2);
    assert_eq!(h.fixture.full.counters.disposed(), 1);
}

#[tokio::test(start_paused = true)]
async fn removing_the_folder_disposes_its_backend() {
    let mut h = Harness::start().await;
    h.send(create_did_open_notification("file:///proj/a.py", ""))
        .await;

    h.send(create_did_change_workspace_folders_notification(&[
        "file:///proj",
    ]))
    .await;

    assert_eq!(h.fixture.full.counters.disposed(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_disposes_every_backend() {
    let mut h = Harness::start().await;
    h.send(create_did_open_notification("file:///proj/a.py", ""))
        .await;

    h.send(Request::build("shutdown").id(9).finish()).await;

    assert_eq!(h.fixture.full.counters.disposed(), 1);
}

#[tokio::test(start_paused = true)]
async fn env_file_change_restarts_when_pythonpath_differs() {
    let mut h = Harness::start().await;
    h.send(create_did_open_notification("file:///proj/a.py", ""))
        .await;
    settle().await;

    h.fixture.environment.set("PYTHONPATH", "/srv/shared");
    h.send(create_did_change_watched_files_notification(&[
        "file:///proj/.env",
    ]))
    .await;
    settle().await;

    assert_eq!(h.fixture.full.counters.started(), 2);
    assert_eq!(h.fixture.full.counters.disposed(), 1);
}

#[tokio::test(start_paused = true)]
async fn unrelated_watched_file_does_not_recheck_environment() {
    let mut h = Harness::start().await;
    h.send(create_did_open_notification("file:///proj/a.py", ""))
        .await;
    settle().await;

    h.fixture.environment.set("PYTHONPATH", "/srv/shared");
    h.send(create_did_change_watched_files_notification(&[
        "file:///proj/setup.cfg",
        "file:///proj/sub/.env",
    ]))
    .await;
    settle().await;

    assert_eq!(h.fixture.full.counters.started(), 1);
}

#[tokio::test(start_paused = true)]
async fn env_file_setting_change_rechecks_environment() {
    let mut h = Harness::start().await;
    h.send(create_did_open_notification("file:///proj/a.py", ""))
        .await;
    settle().await;

    h.fixture.environment.set("PYTHONPATH", "/srv/dev");
    h.send(create_did_change_configuration_notification(
        json!({"python": {"envFile": "${workspaceFolder}/dev.env"}}),
    ))
    .await;
    settle().await;

    assert_eq!(h.fixture.full.counters.started(), 2);
}

#[tokio::test(start_paused = true)]
async fn env_file_watcher_is_registered_when_editor_supports_it() {
    let mut h = Harness::start_with(json!({
        "workspace": {"didChangeWatchedFiles": {"dynamicRegistration": true}}
    }))
    .await;

    let request = wait_for_notification(&mut h.notifications, "client/registerCapability")
        .await
        .unwrap();
    let params = request.params().unwrap();

    assert_eq!(
        params["registrations"][0]["method"],
        "workspace/didChangeWatchedFiles"
    );
    assert_eq!(
        params["registrations"][0]["registerOptions"]["watchers"][0]["globPattern"],
        "**/.env"
    );
}
