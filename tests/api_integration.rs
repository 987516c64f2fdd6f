use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{StatusCode, header};
use axum_test::TestServer;
use chat_export::AppState;
use chat_export::config::{AppConfig, GraphConfig, ResultStoreKind, RunsConfig, ServerConfig};
use chat_export::server::build_app;
use serde_json::{Value, json};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHAT_ID: &str = "19:abc@thread.v2";

fn config(graph_uri: &str, token: Option<&str>, static_dir: &Path) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            port: 0,
            host: "127.0.0.1".into(),
            static_dir: static_dir.to_path_buf(),
            request_timeout_secs: 10,
        },
        graph: GraphConfig {
            base_url: format!("{graph_uri}/v1.0"),
            access_token: token.map(ToString::to_string),
            request_timeout_secs: 5,
            max_retries: 1,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            page_size: 50,
        },
        runs: RunsConfig {
            max_concurrent: 2,
            result_store: ResultStoreKind::Memory,
            results_dir: static_dir.join("results"),
        },
    }
}

fn test_server(graph: &MockServer, token: Option<&str>, static_dir: &Path) -> TestServer {
    let state = AppState::from_config(Arc::new(config(&graph.uri(), token, static_dir))).unwrap();
    TestServer::new(build_app(state)).unwrap()
}

async fn wait_until_finished(server: &TestServer, run_id: &str) -> Value {
    for _ in 0..500 {
        let run: Value = server
            .get(&format!("/api/runs/{run_id}/status"))
            .await
            .json();
        if matches!(run["status"].as_str(), Some("completed" | "failed" | "cancelled")) {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not finish");
}

async fn mount_chat(graph: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "u1",
            "displayName": "Ada Lovelace",
            "userPrincipalName": "ada@contoso.com"
        })))
        .mount(graph)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v1.0/chats/{CHAT_ID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": CHAT_ID,
            "chatType": "group",
            "topic": "Release planning"
        })))
        .mount(graph)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v1.0/chats/{CHAT_ID}/members")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                { "userId": "u1", "displayName": "Ada Lovelace", "email": "ada@contoso.com" },
                { "userId": "u2", "displayName": "Bob", "email": "bob@contoso.com" }
            ]
        })))
        .mount(graph)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v1.0/chats/{CHAT_ID}/messages")))
        .and(query_param("$orderby", "lastModifiedDateTime desc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                {
                    "id": "1", "messageType": "message",
                    "createdDateTime": "2024-01-10T09:00:00Z",
                    "from": { "user": { "id": "u1", "displayName": "Ada Lovelace" } },
                    "body": { "contentType": "html", "content": "<p>ship it</p>" }
                },
                {
                    "id": "3", "messageType": "systemEventMessage",
                    "createdDateTime": "2024-01-06T09:00:00Z",
                    "body": { "contentType": "html", "content": "<systemEventMessage/>" }
                },
                {
                    "id": "2", "messageType": "message",
                    "createdDateTime": "2024-01-05T09:00:00Z",
                    "from": { "user": { "id": "u2", "displayName": "Bob" } },
                    "body": { "contentType": "text", "content": "draft ready" }
                },
                {
                    "id": "0", "messageType": "message",
                    "createdDateTime": "2023-12-30T09:00:00Z",
                    "lastModifiedDateTime": "2024-01-02T09:00:00Z",
                    "from": { "user": { "id": "u2", "displayName": "Bob" } },
                    "body": { "contentType": "text", "content": "edited later" }
                }
            ]
        })))
        .mount(graph)
        .await;
}

#[tokio::test]
async fn test_health_reports_authentication() {
    let graph = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let server = test_server(&graph, None, dir.path());
    let body: Value = server.get("/api/health").await.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["authenticated"], false);
    assert_eq!(body["max_concurrent_runs"], 2);

    let server = test_server(&graph, Some("token"), dir.path());
    let body: Value = server.get("/api/health").await.json();
    assert_eq!(body["authenticated"], true);
}

#[tokio::test]
async fn test_submission_requires_token() {
    let graph = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(&graph, None, dir.path());

    let response = server
        .post("/api/runs/list-chats")
        .json(&json!({}))
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.json::<Value>()["kind"], "auth_required");

    let history: Value = server.get("/api/runs/history").await.json();
    assert_eq!(history["total"], 0);
}

#[tokio::test]
async fn test_invalid_params_are_rejected_synchronously() {
    let graph = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(&graph, Some("token"), dir.path());

    let missing_chat = server.post("/api/runs/export-chat").json(&json!({ "since": "2024-01-01" })).await;
    assert_eq!(missing_chat.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

    let bad_date = server
        .post("/api/runs/export-chat")
        .json(&json!({ "chat_id": CHAT_ID, "since": "last tuesday" }))
        .await;
    assert_eq!(bad_date.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(bad_date.json::<Value>()["kind"], "validation");

    let bad_type = server
        .post("/api/runs")
        .json(&json!({ "action": "list_chats", "params": { "chat_type": "channel" } }))
        .await;
    assert_eq!(bad_type.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

    let history: Value = server.get("/api/runs/history").await.json();
    assert_eq!(history["total"], 0);
    assert_eq!(graph.received_requests().await.map_or(0, |r| r.len()), 0);
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let graph = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(&graph, Some("token"), dir.path());

    for route in ["status", "results", "download", "events"] {
        let response = server.get(&format!("/api/runs/missing/{route}")).await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND, "{route}");
    }
    let response = server.post("/api/runs/missing/cancel").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_export_chat_end_to_end() {
    let graph = MockServer::start().await;
    mount_chat(&graph).await;
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(&graph, Some("token"), dir.path());

    let created = server
        .post("/api/runs/export-chat")
        .json(&json!({
            "chat_id": CHAT_ID,
            "since": "2024-01-01",
            "until": "2024-02-01",
            "exclude_system_messages": true
        }))
        .await;
    assert_eq!(created.status_code(), StatusCode::ACCEPTED);
    let created: Value = created.json();
    let run_id = created["run_id"].as_str().unwrap().to_string();
    assert_eq!(created["action"], "export_chat");
    assert_eq!(created["status_url"], format!("/api/runs/{run_id}/status"));

    let run = wait_until_finished(&server, &run_id).await;
    assert_eq!(run["status"], "completed", "{run}");
    assert_eq!(run["progress"], 100);

    let results: Value = server.get(&format!("/api/runs/{run_id}/results")).await.json();
    let payload = &results["payload"];
    assert_eq!(payload["chat_id"], CHAT_ID);
    assert_eq!(payload["chat_type"], "group");
    assert_eq!(payload["message_count"], 2);
    let ids: Vec<&str> = payload["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["2", "1"]);
    assert_eq!(payload["messages"][1]["body"], "<p>ship it</p>");
    assert_eq!(payload["messages"][1]["body_content_type"], "html");
    assert_eq!(payload["participants"].as_array().unwrap().len(), 2);

    let summary = &results["summary"];
    assert_eq!(summary["total_messages"], 2);
    assert_eq!(summary["total_chats"], 1);

    let download = server.get(&format!("/api/runs/{run_id}/download")).await;
    download.assert_status_ok();
    let disposition = download.header(header::CONTENT_DISPOSITION);
    assert_eq!(
        disposition.to_str().unwrap(),
        format!("attachment; filename=\"{run_id}.json\"")
    );
    let downloaded: Value = serde_json::from_str(&download.text()).unwrap();
    assert_eq!(&downloaded, payload);

    let history: Value = server.get("/api/runs/history").await.json();
    assert_eq!(history["total"], 1);
    assert_eq!(history["runs"][0]["run_id"], run_id.as_str());

    let cancel = server.post(&format!("/api/runs/{run_id}/cancel")).await;
    assert_eq!(cancel.status_code(), StatusCode::CONFLICT);
    assert_eq!(cancel.json::<Value>()["kind"], "already_finished");

    // A finished run streams its final snapshot and closes.
    let events = tokio::time::timeout(
        Duration::from_secs(5),
        server.get(&format!("/api/runs/{run_id}/events")),
    )
    .await
    .expect("event stream did not close");
    let text = events.text();
    assert_eq!(text.matches("event: done").count(), 1, "{text}");
}

#[tokio::test]
async fn test_event_stream_closes_when_run_finishes() {
    let graph = MockServer::start().await;
    mount_chat(&graph).await;
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(&graph, Some("token"), dir.path());

    let created: Value = server
        .post("/api/runs/export-chat")
        .json(&json!({ "chat_id": CHAT_ID, "since": "2024-01-01", "until": "2024-02-01" }))
        .await
        .json();
    let run_id = created["run_id"].as_str().unwrap();

    let events = tokio::time::timeout(
        Duration::from_secs(10),
        server.get(&format!("/api/runs/{run_id}/events")),
    )
    .await
    .expect("event stream did not close");
    let text = events.text();
    assert!(text.trim_end().ends_with('}'), "{text}");
    let last = text.rsplit("event: ").next().unwrap();
    assert!(last.starts_with("done"), "{text}");
    assert!(last.contains("\"status\":\"completed\""), "{text}");
}

#[tokio::test]
async fn test_malformed_body_is_json_error() {
    let graph = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(&graph, Some("token"), dir.path());

    let unknown_action = server
        .post("/api/runs")
        .json(&json!({ "action": "export_everything", "params": {} }))
        .await;
    assert_eq!(unknown_action.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = unknown_action.json();
    assert_eq!(body["kind"], "validation");
    assert!(body["error"].as_str().unwrap().contains("export_everything"), "{body}");

    let not_json = server
        .post("/api/runs/list-chats")
        .bytes("{not json".into())
        .content_type("application/json")
        .await;
    assert_eq!(not_json.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(not_json.json::<Value>()["kind"], "validation");

    let history: Value = server.get("/api/runs/history").await.json();
    assert_eq!(history["total"], 0);
}

#[tokio::test]
async fn test_encoded_chat_id_is_exported() {
    let graph = MockServer::start().await;
    mount_chat(&graph).await;
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(&graph, Some("token"), dir.path());

    let created: Value = server
        .post("/api/runs/export-chat")
        .json(&json!({
            "chat_id": "19%3Aabc%40thread.v2",
            "since": "2024-01-01",
            "until": "2024-02-01"
        }))
        .await
        .json();
    let run_id = created["run_id"].as_str().unwrap();

    let run = wait_until_finished(&server, run_id).await;
    assert_eq!(run["status"], "completed", "{run}");
    assert_eq!(run["params"]["chat_id"], CHAT_ID);

    let results: Value = server.get(&format!("/api/runs/{run_id}/results")).await.json();
    assert_eq!(results["payload"]["chat_id"], CHAT_ID);
}

#[tokio::test]
async fn test_export_by_participants() {
    let graph = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "u1", "displayName": "Ada Lovelace"
        })))
        .mount(&graph)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/users"))
        .and(query_param("$filter", "startswith(displayName, 'Bob')"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                { "id": "u2", "displayName": "Bob", "userPrincipalName": "bob@contoso.com" },
                { "id": "u9", "displayName": "Bobby", "userPrincipalName": "bobby@contoso.com" }
            ]
        })))
        .mount(&graph)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me/chats"))
        .and(query_param("$expand", "members"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                { "id": "c1", "chatType": "oneOnOne",
                  "members": [{ "userId": "u1", "displayName": "Ada Lovelace" }, { "userId": "u2", "displayName": "Bob" }] },
                { "id": "c2", "chatType": "oneOnOne",
                  "members": [{ "userId": "u1", "displayName": "Ada Lovelace" }, { "userId": "u3", "displayName": "Carol" }] },
                { "id": "c3", "chatType": "group", "topic": "Quiet",
                  "members": [{ "userId": "u1" }, { "userId": "u2" }, { "userId": "u3" }] }
            ]
        })))
        .mount(&graph)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/chats/c1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{
                "id": "m1", "messageType": "message",
                "createdDateTime": "2024-01-10T09:00:00Z",
                "from": { "user": { "id": "u2", "displayName": "Bob" } },
                "body": { "contentType": "text", "content": "hi" }
            }]
        })))
        .mount(&graph)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/chats/c3/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
        .mount(&graph)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(&graph, Some("token"), dir.path());

    let created: Value = server
        .post("/api/runs/export-chat")
        .json(&json!({ "participants": ["Bob"], "since": "2024-01-01", "until": "2024-02-01" }))
        .await
        .json();
    let run_id = created["run_id"].as_str().unwrap();

    let run = wait_until_finished(&server, run_id).await;
    assert_eq!(run["status"], "completed", "{run}");
    assert_eq!(run["summary"]["total_chats"], 1);
    assert_eq!(run["summary"]["total_messages"], 1);

    let results: Value = server.get(&format!("/api/runs/{run_id}/results")).await.json();
    let payload = &results["payload"];
    assert_eq!(payload["participants"], json!(["Bob"]));
    assert_eq!(payload["chat_count"], 1);
    assert_eq!(payload["chats"][0]["chat_id"], "c1");
    assert_eq!(payload["chats"][0]["messages"][0]["id"], "m1");
    assert_eq!(payload["chats"][0]["participants"].as_array().unwrap().len(), 2);

    // The chat without Bob was never read.
    let requests = graph.received_requests().await.unwrap_or_default();
    assert!(requests.iter().all(|r| !r.url.path().starts_with("/v1.0/chats/c2")));
}

#[tokio::test]
async fn test_unknown_participant_fails_run() {
    let graph = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "u1" })))
        .mount(&graph)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
        .mount(&graph)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(&graph, Some("token"), dir.path());

    let created: Value = server
        .post("/api/runs/export-chat")
        .json(&json!({ "participants": ["nobody@contoso.com"], "since": "2024-01-01" }))
        .await
        .json();
    let run_id = created["run_id"].as_str().unwrap();

    let run = wait_until_finished(&server, run_id).await;
    assert_eq!(run["status"], "failed");
    assert_eq!(run["error"]["kind"], "validation");
    assert!(
        run["error"]["message"].as_str().unwrap().contains("nobody@contoso.com"),
        "{run}"
    );
}

#[tokio::test]
async fn test_only_mine_keeps_own_messages() {
    let graph = MockServer::start().await;
    mount_chat(&graph).await;
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(&graph, Some("token"), dir.path());

    let created: Value = server
        .post("/api/runs")
        .json(&json!({
            "action": "export_chat",
            "params": {
                "chat_id": CHAT_ID,
                "since": "2024-01-01",
                "until": "2024-02-01",
                "only_mine": true
            }
        }))
        .await
        .json();
    let run_id = created["run_id"].as_str().unwrap();

    let run = wait_until_finished(&server, run_id).await;
    assert_eq!(run["status"], "completed", "{run}");

    let results: Value = server.get(&format!("/api/runs/{run_id}/results")).await.json();
    assert_eq!(results["payload"]["message_count"], 1);
    assert_eq!(results["payload"]["messages"][0]["from"]["id"], "u1");
}

#[tokio::test]
async fn test_expired_token_fails_run() {
    let graph = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "code": "InvalidAuthenticationToken", "message": "Access token has expired." }
        })))
        .mount(&graph)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(&graph, Some("stale"), dir.path());

    let created: Value = server
        .post("/api/runs/list-active-chats")
        .json(&json!({}))
        .await
        .json();
    let run_id = created["run_id"].as_str().unwrap();

    let run = wait_until_finished(&server, run_id).await;
    assert_eq!(run["status"], "failed");
    assert_eq!(run["error"]["kind"], "auth_expired");

    let results = server.get(&format!("/api/runs/{run_id}/results")).await;
    assert_eq!(results.status_code(), StatusCode::CONFLICT);
    assert_eq!(results.json::<Value>()["kind"], "auth_expired");
}

#[tokio::test]
async fn test_list_chats_end_to_end() {
    let graph = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me/chats"))
        .and(query_param("$filter", "chatType eq 'oneOnOne'"))
        .and(query_param("$expand", "members"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                {
                    "id": "c1", "chatType": "oneOnOne",
                    "members": [
                        { "displayName": "Ada Lovelace", "email": "ada@contoso.com" },
                        { "displayName": "Bob", "email": "bob@contoso.com" }
                    ]
                },
                {
                    "id": "c2", "chatType": "oneOnOne",
                    "members": [
                        { "displayName": "Ada Lovelace", "email": "ada@contoso.com" },
                        { "displayName": "Carol", "email": "carol@contoso.com" }
                    ]
                }
            ]
        })))
        .mount(&graph)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let server = test_server(&graph, Some("token"), dir.path());

    let created: Value = server
        .post("/api/runs/list-chats")
        .json(&json!({ "participants": ["carol@contoso.com"] }))
        .await
        .json();
    let run_id = created["run_id"].as_str().unwrap();

    let run = wait_until_finished(&server, run_id).await;
    assert_eq!(run["status"], "completed", "{run}");
    assert_eq!(run["summary"]["scanned_chats"], 2);

    let results: Value = server.get(&format!("/api/runs/{run_id}/results")).await.json();
    assert_eq!(results["payload"]["total"], 1);
    assert_eq!(results["payload"]["chats"][0]["chat_id"], "c2");
    assert_eq!(results["payload"]["chats"][0]["display_name"], "Ada Lovelace, Carol");
}

#[tokio::test]
async fn test_static_files_are_served() {
    let graph = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>Chat export</h1>").unwrap();
    let server = test_server(&graph, None, dir.path());

    let response = server.get("/").await;
    response.assert_status_ok();
    assert!(response.text().contains("Chat export"));
}
