use peersync_node::demo::{Demo, INVENTORY_DOCUMENT};
use peersync_node::{DocumentSummary, StatusResponse, build_router};
use pretty_assertions::assert_eq;
use serde_json::json;

/// Spin up the HTTP server for the demo's first device on an OS-assigned
/// port, returning the base URL.
async fn spawn_test_server(demo: &Demo) -> String {
    let app = build_router(demo.devices()[0].orchestrator.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://127.0.0.1:{}", port)
}

#[tokio::test]
async fn status_endpoint_returns_statistics() {
    let demo = Demo::start(2).await.unwrap();
    let base = spawn_test_server(&demo).await;

    let resp = reqwest::get(format!("{}/api/v1/status", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: StatusResponse = resp.json().await.unwrap();
    assert_eq!(body.device_id, "device-1");
    assert_eq!(body.device_name, "Device 1");
    assert_eq!(body.connections, 0);
    assert_eq!(body.statistics.document_count, 0);
    assert_eq!(body.statistics.active_sessions, 0);
}

#[tokio::test]
async fn status_endpoint_content_type_is_json() {
    let demo = Demo::start(2).await.unwrap();
    let base = spawn_test_server(&demo).await;
    let resp = reqwest::get(format!("{}/api/v1/status", base))
        .await
        .unwrap();

    let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.contains("application/json"));
}

#[tokio::test]
async fn status_uses_camel_case_keys() {
    let demo = Demo::start(2).await.unwrap();
    let base = spawn_test_server(&demo).await;
    let body: serde_json::Value = reqwest::get(format!("{}/api/v1/status", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["deviceId"], json!("device-1"));
    assert!(body["statistics"]["totalConflicts"].is_number());
    assert!(body["statistics"]["knownPeers"].is_number());
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let demo = Demo::start(2).await.unwrap();
    let base = spawn_test_server(&demo).await;
    let resp = reqwest::get(format!("{}/api/v1/nonexistent", base))
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn status_reflects_a_finished_sync() {
    let demo = Demo::start(2).await.unwrap();
    demo.edit().await.unwrap();
    demo.sync_all().await.unwrap();
    let base = spawn_test_server(&demo).await;

    let body: StatusResponse = reqwest::get(format!("{}/api/v1/status", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body.connections, 1);
    assert_eq!(body.statistics.document_count, 3);
    assert_eq!(body.statistics.total_conflicts, 1);
    assert_eq!(body.statistics.known_peers, 1);

    let documents: Vec<DocumentSummary> = reqwest::get(format!("{}/api/v1/documents", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let inventory = documents
        .iter()
        .find(|d| d.document_id == INVENTORY_DOCUMENT)
        .unwrap();
    assert_eq!(inventory.document_type, "items");
    assert_eq!(inventory.fields["qty"], json!(20));
    assert_eq!(inventory.fields["views"], json!(3));
}
