//! SSE tool-channel scenarios

mod common;

use common::spawn;
use serde_json::json;
use std::io::Write;

/// Minimal SSE client over a streaming reqwest response
struct EventReader {
    response: reqwest::Response,
    buffer: String,
}

impl EventReader {
    async fn open(ts: &common::TestServer) -> Self {
        let response = ts
            .client
            .get(ts.url("/mcp/sse"))
            .send()
            .await
            .expect("sse stream failed to open");
        assert_eq!(response.status(), 200);
        Self {
            response,
            buffer: String::new(),
        }
    }

    /// Next event, skipping keepalive pings
    async fn next_event(&mut self) -> Option<(String, serde_json::Value)> {
        loop {
            if let Some(pos) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..pos + 2).collect();
                let mut event = String::new();
                let mut data = String::new();
                for line in block.lines() {
                    if let Some(value) = line.strip_prefix("event:") {
                        event = value.trim().to_string();
                    } else if let Some(value) = line.strip_prefix("data:") {
                        data.push_str(value.trim());
                    }
                }
                if event.is_empty() || event == "ping" {
                    continue;
                }
                let json = serde_json::from_str(&data).unwrap_or(serde_json::Value::Null);
                return Some((event, json));
            }

            match self.response.chunk().await.ok()? {
                Some(bytes) => self.buffer.push_str(&String::from_utf8_lossy(&bytes)),
                None => return None,
            }
        }
    }

    /// Read events until one with the given name arrives
    async fn wait_for(&mut self, name: &str) -> serde_json::Value {
        for _ in 0..100 {
            let (event, data) = self.next_event().await.expect("stream ended early");
            if event == name {
                return data;
            }
        }
        panic!("event {name} never arrived");
    }
}

async fn call_tool(
    ts: &common::TestServer,
    session: &str,
    id: &str,
    tool: &str,
    arguments: serde_json::Value,
) {
    let response = ts
        .post_json(
            &format!("/mcp/messages/{session}"),
            json!({"id": id, "tool": tool, "arguments": arguments}),
        )
        .await;
    assert_eq!(response.status(), 202);
}

#[tokio::test]
async fn test_ready_event_carries_session_and_manifest() {
    let ts = spawn(1, 8).await;
    let mut reader = EventReader::open(&ts).await;

    let (event, data) = reader.next_event().await.unwrap();
    assert_eq!(event, "ready");
    assert!(data["session"].as_str().unwrap().starts_with("sse_"));

    let names: Vec<&str> = data["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    for required in [
        "vector-search",
        "knowledge-search",
        "adr-list",
        "adr-get",
        "task-status",
        "task-cancel",
    ] {
        assert!(names.contains(&required), "manifest missing {required}");
    }
}

#[tokio::test]
async fn test_responses_preserve_call_order() {
    let ts = spawn(1, 8).await;
    let mut reader = EventReader::open(&ts).await;
    let ready = reader.wait_for("ready").await;
    let session = ready["session"].as_str().unwrap().to_string();

    call_tool(&ts, &session, "first", "adr-list", json!({})).await;
    call_tool(
        &ts,
        &session,
        "second",
        "knowledge-search",
        json!({"query": "anything"}),
    )
    .await;
    call_tool(&ts, &session, "third", "adr-list", json!({})).await;

    let first = reader.wait_for("tool_result").await;
    assert_eq!(first["id"], "first");
    let second = reader.wait_for("tool_result").await;
    assert_eq!(second["id"], "second");
    let third = reader.wait_for("tool_result").await;
    assert_eq!(third["id"], "third");
}

#[tokio::test]
async fn test_analyze_code_streams_task_updates_to_success() {
    let ts = spawn(2, 16).await;
    let mut reader = EventReader::open(&ts).await;
    let ready = reader.wait_for("ready").await;
    let session = ready["session"].as_str().unwrap().to_string();

    call_tool(
        &ts,
        &session,
        "call-1",
        "analyze-code",
        json!({"code": "def f(): pass"}),
    )
    .await;

    let result = reader.wait_for("tool_result").await;
    let task_id = result["result"]["task_id"].as_str().unwrap().to_string();

    // States stream monotonically to the terminal snapshot.
    let rank = |state: &str| match state {
        "queued" => 0,
        "running" => 1,
        "succeeded" | "failed" | "canceled" => 2,
        other => panic!("unexpected state {other}"),
    };
    let mut last_rank = -1i32;
    loop {
        let update = reader.wait_for("task_update").await;
        assert_eq!(update["task_id"], task_id.as_str());
        let state = update["task"]["state"].as_str().unwrap().to_string();
        assert!(rank(&state) >= last_rank, "state went backwards: {state}");
        last_rank = rank(&state);
        if rank(&state) == 2 {
            assert_eq!(state, "succeeded");
            break;
        }
    }
}

#[tokio::test]
async fn test_create_adr_tool_runs_as_task() {
    let ts = spawn(2, 16).await;
    let mut reader = EventReader::open(&ts).await;
    let ready = reader.wait_for("ready").await;
    let session = ready["session"].as_str().unwrap().to_string();

    call_tool(
        &ts,
        &session,
        "adr",
        "create-adr",
        json!({"title": "Adopt event sourcing", "decision": "append-only log"}),
    )
    .await;

    let result = reader.wait_for("tool_result").await;
    let task_id = result["result"]["task_id"].as_str().unwrap().to_string();

    let task = ts.wait_for_task(&task_id).await;
    assert_eq!(task["state"], "succeeded");
    assert_eq!(task["result"]["number"], 1);
    assert_eq!(task["result"]["status"], "proposed");

    // The record is immediately visible on the HTTP surface.
    let listing = ts.get_json("/adrs").await;
    assert_eq!(listing["count"], 1);
}

#[tokio::test]
async fn test_cancel_running_task_observed_as_canceled() {
    let ts = spawn(1, 8).await;

    let mut slow = mockito::Server::new_async().await;
    slow.mock("GET", "/slow")
        .with_status(200)
        .with_chunked_body(|writer| {
            std::thread::sleep(std::time::Duration::from_secs(2));
            writer.write_all(b"slow body")
        })
        .create_async()
        .await;

    let mut reader = EventReader::open(&ts).await;
    let ready = reader.wait_for("ready").await;
    let session = ready["session"].as_str().unwrap().to_string();

    call_tool(
        &ts,
        &session,
        "crawl",
        "crawl-docs",
        json!({"urls": [format!("{}/slow", slow.url())], "source_type": "docs"}),
    )
    .await;
    let result = reader.wait_for("tool_result").await;
    let task_id = result["result"]["task_id"].as_str().unwrap().to_string();

    // Let the worker pick it up, then request cancellation.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    call_tool(
        &ts,
        &session,
        "cancel",
        "task-cancel",
        json!({"task_id": task_id}),
    )
    .await;

    let task = ts.wait_for_task(&task_id).await;
    assert_eq!(task["state"], "canceled");
}

#[tokio::test]
async fn test_unknown_tool_yields_tool_error() {
    let ts = spawn(1, 8).await;
    let mut reader = EventReader::open(&ts).await;
    let ready = reader.wait_for("ready").await;
    let session = ready["session"].as_str().unwrap().to_string();

    call_tool(&ts, &session, "x", "no-such-tool", json!({})).await;
    let error = reader.wait_for("tool_error").await;
    assert_eq!(error["error"]["kind"], "not-found");
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let ts = spawn(1, 8).await;
    let response = ts
        .post_json(
            "/mcp/messages/sse_doesnotexist",
            json!({"tool": "adr-list", "arguments": {}}),
        )
        .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_disconnect_does_not_cancel_running_task() {
    let ts = spawn(1, 8).await;

    let mut slow = mockito::Server::new_async().await;
    slow.mock("GET", "/slow")
        .with_status(200)
        .with_chunked_body(|writer| {
            std::thread::sleep(std::time::Duration::from_secs(1));
            writer.write_all(b"eventually served")
        })
        .create_async()
        .await;

    let task_id = {
        let mut reader = EventReader::open(&ts).await;
        let ready = reader.wait_for("ready").await;
        let session = ready["session"].as_str().unwrap().to_string();
        call_tool(
            &ts,
            &session,
            "crawl",
            "crawl-docs",
            json!({"urls": [format!("{}/slow", slow.url())], "source_type": "docs"}),
        )
        .await;
        let result = reader.wait_for("tool_result").await;
        result["result"]["task_id"].as_str().unwrap().to_string()
        // reader dropped here: client disconnect
    };

    // The underlying task keeps running and completes.
    let task = ts.wait_for_task(&task_id).await;
    assert_eq!(task["state"], "succeeded");
}

#[tokio::test]
async fn test_tools_gated_when_doc_manager_fails_init() {
    // A plain file where docs_dir should be makes DocManager init fail,
    // which is non-critical: the server comes up without crawl-docs.
    let tmp = tempfile::TempDir::new().unwrap();
    let config = common::test_config(tmp.path(), 1, 8);
    std::fs::write(tmp.path().join("docs"), b"not a directory").unwrap();

    let index = std::sync::Arc::new(
        mcp_codebase_insight::providers::InMemoryVectorIndex::new(),
    );
    let embedder = std::sync::Arc::new(
        mcp_codebase_insight::providers::LocalEmbeddingProvider::new(common::MODEL, common::DIM),
    );
    let server =
        mcp_codebase_insight::server::Server::build_with_providers(config, embedder, index)
            .await
            .unwrap();
    assert_eq!(server.availability().get("doc-manager"), Some(&false));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = server.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let client = reqwest::Client::new();
    let mut response = client
        .get(format!("http://{addr}/mcp/sse"))
        .send()
        .await
        .unwrap();

    // Read the ready event straight off the stream.
    let mut buffer = String::new();
    let names: Vec<String> = loop {
        let chunk = response.chunk().await.unwrap().expect("stream ended");
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        if let Some(pos) = buffer.find("\n\n") {
            let block = &buffer[..pos];
            let data = block
                .lines()
                .find_map(|l| l.strip_prefix("data:"))
                .expect("ready event without data");
            let ready: serde_json::Value = serde_json::from_str(data.trim()).unwrap();
            break ready["tools"]
                .as_array()
                .unwrap()
                .iter()
                .map(|t| t["name"].as_str().unwrap().to_string())
                .collect();
        }
    };

    assert!(!names.iter().any(|n| n == "crawl-docs"));
    assert!(names.iter().any(|n| n == "knowledge-search"));
    assert!(names.iter().any(|n| n == "analyze-code"));
}
