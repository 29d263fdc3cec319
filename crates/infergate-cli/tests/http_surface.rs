//! End-to-end tests driving the hand-rolled HTTP harness over a real
//! `TcpListener` against a bootstrapped `Engine`, the way a client actually
//! talks to it: raw request bytes in, raw response bytes out.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use infergate_core::{Engine, InferenceConfig, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use infergate_cli::server::{self, AppState};

fn server_yaml() -> &'static str {
    r#"
interface:
  framework: http
  host: 127.0.0.1
  port: "0"
max_connections: 100
max_concurrency: 4
log:
  log_dir: /tmp/logs
  log_backup_count: 3
"#
}

fn inference_yaml() -> &'static str {
    r#"
models:
  - name: echo
    version: "1"
    device: cpu
    inferer_type: builtin
    inferer_name: echo
    inferer_path: ""
    converter_type: none
dag:
  type: sequential
  name: main
  nodes:
    - name: echo-stage
      type: model
      model: echo-1
"#
}

/// Bootstraps a real engine, binds an ephemeral port, and spawns the
/// connection-accept loop. Returns the bound address; the listener task is
/// leaked for the test process's lifetime.
async fn spawn_server() -> std::net::SocketAddr {
    let server_cfg = ServerConfig::load(server_yaml()).unwrap();
    let inference_cfg = InferenceConfig::load(inference_yaml()).unwrap();
    let engine = Arc::new(Engine::bootstrap(&server_cfg, &inference_cfg).await.unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let state = Arc::new(AppState {
        engine,
        online: AtomicBool::new(false),
        server_yaml: server_yaml().to_string(),
        inference_yaml: inference_yaml().to_string(),
        customized_predict_http: None,
    });

    tokio::spawn(server::serve(listener, state));
    addr
}

/// Sends a raw HTTP/1.1 request over a fresh connection and returns
/// `(status, headers_lowercased, body)`.
async fn send_request(addr: std::net::SocketAddr, raw: &str) -> (u16, String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();

    let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let head = String::from_utf8_lossy(&buf[..header_end - 4]).to_string();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();
    let headers: String = lines.collect::<Vec<_>>().join("\n").to_ascii_lowercase();
    let body = buf[header_end..].to_vec();
    (status, headers, body)
}

fn post(path: &str, body: &str) -> String {
    format!(
        "POST {path} HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
}

#[tokio::test]
async fn predict_round_trips_a_unary_string() {
    let addr = spawn_server().await;
    let (status, _, body) = send_request(addr, &post("/grps/v1/infer/predict", r#"{"str_data":"hello"}"#)).await;
    assert_eq!(status, 200);
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["str_data"], "hello");
    assert_eq!(value["status"]["status"], "SUCCESS");
}

#[tokio::test]
async fn predict_round_trips_an_ndarray_tensor() {
    let addr = spawn_server().await;
    let req_body = r#"{"ndarray":[[1.0,2.0],[3.0,4.0]]}"#;
    let (status, _, body) = send_request(addr, &post("/grps/v1/infer/predict?return-ndarray=true", req_body)).await;
    assert_eq!(status, 200);
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["ndarray"], serde_json::json!([[1.0, 2.0], [3.0, 4.0]]));
}

#[tokio::test]
async fn predict_rejects_malformed_json_with_400() {
    let addr = spawn_server().await;
    let (status, _, body) = send_request(addr, &post("/grps/v1/infer/predict", "{not json")).await;
    assert_eq!(status, 400);
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["status"]["status"], "FAILURE");
}

#[tokio::test]
async fn predict_rejects_streaming_with_return_ndarray() {
    let addr = spawn_server().await;
    let (status, _, _) = send_request(
        addr,
        &post("/grps/v1/infer/predict?streaming=true&return-ndarray=true", r#"{"str_data":"x"}"#),
    )
    .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn concurrent_predicts_all_complete_with_correct_answers() {
    let addr = spawn_server().await;
    let mut handles = Vec::new();
    for i in 0..10 {
        handles.push(tokio::spawn(async move {
            let body = format!(r#"{{"str_data":"req-{i}"}}"#);
            let (status, _, resp) = send_request(addr, &post("/grps/v1/infer/predict", &body)).await;
            assert_eq!(status, 200);
            let value: serde_json::Value = serde_json::from_slice(&resp).unwrap();
            assert_eq!(value["str_data"], format!("req-{i}"));
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test]
async fn streaming_predict_returns_chunked_response() {
    let addr = spawn_server().await;
    let (status, headers, body) =
        send_request(addr, &post("/grps/v1/infer/predict?streaming=true", r#"{"str_data":"hi"}"#)).await;
    assert_eq!(status, 200);
    assert!(headers.contains("transfer-encoding: chunked"));
    // the terminal chunk is always present even if the echo path writes no
    // body chunks of its own.
    assert!(body.ends_with(b"0\r\n\r\n"));
}

#[tokio::test]
async fn readiness_reflects_online_offline_lifecycle() {
    let addr = spawn_server().await;

    let (status, _, _) = send_request(addr, &get("/grps/v1/health/ready")).await;
    assert_eq!(status, 503);

    let (status, _, _) = send_request(addr, &get("/grps/v1/health/online")).await;
    assert_eq!(status, 200);

    let (status, _, _) = send_request(addr, &get("/grps/v1/health/ready")).await;
    assert_eq!(status, 200);

    let (status, _, _) = send_request(addr, &get("/grps/v1/health/offline")).await;
    assert_eq!(status, 200);

    let (status, _, _) = send_request(addr, &get("/grps/v1/health/ready")).await;
    assert_eq!(status, 503);
}

#[tokio::test]
async fn health_live_is_always_ok() {
    let addr = spawn_server().await;
    let (status, _, _) = send_request(addr, &get("/grps/v1/health/live")).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn server_metadata_has_no_comments() {
    let addr = spawn_server().await;
    let (status, _, body) = send_request(addr, &get("/grps/v1/metadata/server")).await;
    assert_eq!(status, 200);
    let text = String::from_utf8(body).unwrap();
    assert!(!text.contains('#'));
    assert!(text.contains("max_connections"));
}

#[tokio::test]
async fn model_metadata_returns_only_the_requested_subtree() {
    let addr = spawn_server().await;
    let (status, _, body) = send_request(addr, &get("/grps/v1/metadata/model?name=echo-1")).await;
    assert_eq!(status, 200);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("echo"));
    assert!(!text.contains("dag"));
}

#[tokio::test]
async fn model_metadata_404s_for_unknown_model() {
    let addr = spawn_server().await;
    let (status, _, _) = send_request(addr, &get("/grps/v1/metadata/model?name=nope-1")).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn unknown_path_is_404() {
    let addr = spawn_server().await;
    let (status, _, _) = send_request(addr, &get("/grps/v1/does/not/exist")).await;
    assert_eq!(status, 404);
}
