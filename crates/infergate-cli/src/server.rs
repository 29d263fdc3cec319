//! Minimal, dependency-light HTTP harness exercising the canonical
//! `/grps/v1/...` surface against an in-process `Engine`. Built directly on
//! `tokio::net::TcpListener` with hand-rolled request-line/header parsing —
//! a full web framework is disproportionate to a demonstration harness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use infergate_core::config::{CtrlMode, CustomizedPredictHttp};
use infergate_core::{Engine, GenericMessage, GenericTensor, RequestContext, StreamSink, TensorData};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Shared state every connection handler sees.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub online: AtomicBool,
    pub server_yaml: String,
    pub inference_yaml: String,
    pub customized_predict_http: Option<CustomizedPredictHttp>,
}

/// Accept connections until the listener is dropped, spawning one task per
/// connection.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                tracing::debug!(error = %e, "connection ended with error");
            }
        });
    }
}

struct ParsedRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) -> anyhow::Result<()> {
    let req = match read_request(&mut stream).await? {
        Some(req) => req,
        None => return Ok(()),
    };

    route(stream, &req, state).await
}

async fn read_request(stream: &mut TcpStream) -> anyhow::Result<Option<ParsedRequest>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            anyhow::bail!("connection closed before headers completed");
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > 64 * 1024 {
            anyhow::bail!("request headers too large");
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("GET").to_string();
    let target = parts.next().unwrap_or("/").to_string();
    let (path, query) = split_target(&target);

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = headers.get("content-length").and_then(|v| v.parse().ok()).unwrap_or(0);
    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    if body.len() > content_length {
        body.truncate(content_length);
    }

    Ok(Some(ParsedRequest {
        method,
        path,
        query,
        headers,
        body,
    }))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn split_target(target: &str) -> (String, HashMap<String, String>) {
    match target.split_once('?') {
        Some((path, qs)) => (path.to_string(), parse_query(qs)),
        None => (target.to_string(), HashMap::new()),
    }
}

fn parse_query(qs: &str) -> HashMap<String, String> {
    qs.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn route(mut stream: TcpStream, req: &ParsedRequest, state: Arc<AppState>) -> anyhow::Result<()> {
    if let Some(cfg) = &state.customized_predict_http {
        if req.path == cfg.path {
            return handle_customized_predict(stream, req, Arc::clone(&state), cfg).await;
        }
    }
    match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/grps/v1/infer/predict") => handle_predict(stream, req, state).await,
        (_, "/grps/v1/health/online") => {
            state.online.store(true, Ordering::SeqCst);
            write_json(&mut stream, 200, &success_status_body()).await
        }
        (_, "/grps/v1/health/offline") => {
            state.online.store(false, Ordering::SeqCst);
            write_json(&mut stream, 200, &success_status_body()).await
        }
        (_, "/grps/v1/health/live") => write_json(&mut stream, 200, &success_status_body()).await,
        (_, "/grps/v1/health/ready") => {
            if state.online.load(Ordering::SeqCst) {
                write_json(&mut stream, 200, &success_status_body()).await
            } else {
                write_json(&mut stream, 503, &failure_status_body("server is not online")).await
            }
        }
        (_, "/grps/v1/metadata/server") => {
            let stripped = strip_yaml_comments(&state.server_yaml).unwrap_or_else(|| state.server_yaml.clone());
            write_text(&mut stream, 200, "text/plain", &stripped).await
        }
        (_, "/grps/v1/metadata/model") => {
            let name = req.query.get("name").cloned().unwrap_or_default();
            if !state.engine.model_keys().contains(&name) {
                return write_json(&mut stream, 404, &failure_status_body("unknown model")).await;
            }
            match extract_model_subtree(&state.inference_yaml, &name) {
                Some(subtree) => write_text(&mut stream, 200, "text/plain", &subtree).await,
                None => write_json(&mut stream, 404, &failure_status_body("unknown model")).await,
            }
        }
        (_, "/grps/v1/monitor/metrics") => {
            let names = state.engine.metrics().names().await;
            write_json(&mut stream, 200, &serde_json::json!({ "series": names }).to_string()).await
        }
        (_, "/grps/v1/monitor/series") => {
            let name = req.query.get("name").cloned().unwrap_or_default();
            match state.engine.metrics().snapshot(&name).await {
                Some(snap) => write_json(&mut stream, 200, &snap.to_string()).await,
                None => write_json(&mut stream, 404, &failure_status_body("unknown series")).await,
            }
        }
        (_, path) if path.starts_with("/grps/v1/js/") => write_text(&mut stream, 404, "text/plain", "not found").await,
        _ => write_json(&mut stream, 404, &failure_status_body("not found")).await,
    }
}

/// Reparse and reserialize a YAML document, dropping every comment. Returns
/// `None` if the document no longer parses (should not happen; both
/// documents are validated at startup).
fn strip_yaml_comments(yaml: &str) -> Option<String> {
    let value: serde_yaml::Value = serde_yaml::from_str(yaml).ok()?;
    serde_yaml::to_string(&value).ok()
}

/// Pull the one `models[*]` entry whose `name-version` key matches `key` out
/// of a parsed `inference.yml` document and reserialize just that subtree.
fn extract_model_subtree(inference_yaml: &str, key: &str) -> Option<String> {
    let doc: serde_yaml::Value = serde_yaml::from_str(inference_yaml).ok()?;
    let models = doc.get("models")?.as_sequence()?;
    let model = models.iter().find(|m| {
        let name = m.get("name").and_then(|v| v.as_str()).unwrap_or_default();
        let version = m.get("version").and_then(|v| v.as_str()).unwrap_or_default();
        format!("{name}-{version}") == key
    })?;
    serde_yaml::to_string(model).ok()
}

fn success_status_body() -> String {
    serde_json::json!({"status": {"code": 200, "status": "SUCCESS"}}).to_string()
}

fn failure_status_body(msg: &str) -> String {
    serde_json::json!({"status": {"code": 400, "status": "FAILURE", "msg": msg}}).to_string()
}

async fn handle_predict(mut stream: TcpStream, req: &ParsedRequest, state: Arc<AppState>) -> anyhow::Result<()> {
    let is_octet_stream = req
        .headers
        .get("content-type")
        .map(|v| v.contains("application/octet-stream"))
        .unwrap_or(false);
    let return_ndarray = req.query.get("return-ndarray").map(|v| v == "true").unwrap_or(false);
    let streaming = req.query.get("streaming").map(|v| v == "true").unwrap_or(false);

    if streaming && return_ndarray {
        let body = serde_json::json!({
            "status": {"code": 400, "status": "FAILURE", "msg": "Bad Request, err: return-ndarray is not supported for streaming requests."}
        })
        .to_string();
        return write_json(&mut stream, 400, &body).await;
    }

    let input = if is_octet_stream {
        GenericMessage::Bin(req.body.clone())
    } else {
        let value: serde_json::Value = match serde_json::from_slice(&req.body) {
            Ok(v) => v,
            Err(e) => {
                return write_json(&mut stream, 400, &failure_status_body(&format!("invalid json: {e}"))).await;
            }
        };
        match infergate_core::message::parse_canonical_json(&value) {
            Ok(msg) => msg,
            Err(e) => return write_json(&mut stream, 400, &failure_status_body(&e)).await,
        }
    };

    if streaming {
        return handle_streaming_predict(stream, input, state).await;
    }

    let ctx = RequestContext::new(None, None);
    match state.engine.infer(input, &ctx, None).await {
        Ok(GenericMessage::Bin(bytes)) if !return_ndarray => write_bytes(&mut stream, 200, &bytes).await,
        Ok(out) => {
            let body = render_response(&out, return_ndarray);
            write_json(&mut stream, 200, &body).await
        }
        Err(e) => write_json(&mut stream, e.http_status(), &failure_status_body(&e.to_string())).await,
    }
}

/// Dispatch through a user-configured `interface.customized_predict_http`
/// path instead of the canonical `/grps/v1/infer/predict` one: the body is
/// either handed to the engine raw or parsed as canonical JSON depending on
/// `customized_body`, and the streaming flag is read per `streaming_ctrl`
/// rather than always from the `streaming` query parameter.
async fn handle_customized_predict(
    mut stream: TcpStream,
    req: &ParsedRequest,
    state: Arc<AppState>,
    cfg: &CustomizedPredictHttp,
) -> anyhow::Result<()> {
    let streaming = resolve_streaming_flag(req, &cfg.streaming_ctrl);

    let input = if cfg.customized_body {
        GenericMessage::Bin(req.body.clone())
    } else {
        let value: serde_json::Value = match serde_json::from_slice(&req.body) {
            Ok(v) => v,
            Err(e) => {
                return write_json(&mut stream, 400, &failure_status_body(&format!("invalid json: {e}"))).await;
            }
        };
        match infergate_core::message::parse_canonical_json(&value) {
            Ok(msg) => msg,
            Err(e) => return write_json(&mut stream, 400, &failure_status_body(&e)).await,
        }
    };

    if streaming {
        return handle_streaming_predict(stream, input, state).await;
    }

    let ctx = RequestContext::new(None, None);
    match state.engine.infer(input, &ctx, None).await {
        Ok(GenericMessage::Bin(bytes)) => {
            write_bytes_as(&mut stream, 200, &bytes, &cfg.streaming_ctrl.res_content_type).await
        }
        Ok(out) => {
            let body = render_response(&out, false);
            write_json(&mut stream, 200, &body).await
        }
        Err(e) => write_json(&mut stream, e.http_status(), &failure_status_body(&e.to_string())).await,
    }
}

/// Read the streaming on/off flag from wherever `streaming_ctrl` says it
/// lives: a query parameter, a header, or a field in the JSON body.
fn resolve_streaming_flag(req: &ParsedRequest, ctrl: &infergate_core::config::StreamingCtrl) -> bool {
    match ctrl.ctrl_mode {
        CtrlMode::QueryParam => req.query.get(&ctrl.ctrl_key).map(|v| v == "true").unwrap_or(false),
        CtrlMode::HeaderParam => req
            .headers
            .get(&ctrl.ctrl_key.to_ascii_lowercase())
            .map(|v| v == "true")
            .unwrap_or(false),
        CtrlMode::BodyParam => serde_json::from_slice::<serde_json::Value>(&req.body)
            .ok()
            .and_then(|v| v.get(&ctrl.ctrl_key).and_then(|f| f.as_bool()))
            .unwrap_or(false),
    }
}

fn render_response(out: &GenericMessage, return_ndarray: bool) -> String {
    if return_ndarray {
        if let GenericMessage::Tensors(tensors) = out {
            if let Some(t) = tensors.first() {
                return serde_json::json!({
                    "status": {"code": 200, "status": "SUCCESS"},
                    "ndarray": tensor_to_nested_json(t),
                })
                .to_string();
            }
        }
    }
    let mut value = message_to_json(out);
    if let serde_json::Value::Object(ref mut obj) = value {
        obj.insert(
            "status".to_string(),
            serde_json::json!({"code": 200, "status": "SUCCESS"}),
        );
    }
    value.to_string()
}

/// Mirrors the field names [`infergate_core::message::parse_canonical_json`]
/// reads on the request side, so a round-tripped `str_data`/`gtensors`/`gmap`
/// request comes back under the same keys.
fn message_to_json(msg: &GenericMessage) -> serde_json::Value {
    match msg {
        GenericMessage::Str(s) => serde_json::json!({"str_data": s}),
        GenericMessage::Bin(b) => serde_json::json!({"gtensors": [], "bin_len": b.len()}),
        GenericMessage::Tensors(tensors) => serde_json::json!({"gtensors": tensors}),
        GenericMessage::Map(map) => {
            let nested: serde_json::Map<String, serde_json::Value> =
                map.iter().map(|(k, v)| (k.clone(), message_to_json(v))).collect();
            serde_json::json!({"gmap": nested})
        }
    }
}

fn tensor_to_nested_json(t: &GenericTensor) -> serde_json::Value {
    let flat: Vec<f64> = match &t.data {
        TensorData::Float32(v) => v.iter().map(|x| *x as f64).collect(),
        TensorData::Float64(v) => v.clone(),
        TensorData::Int32(v) => v.iter().map(|x| *x as f64).collect(),
        TensorData::Int64(v) => v.iter().map(|x| *x as f64).collect(),
        TensorData::Bool(v) => v.iter().map(|x| if *x { 1.0 } else { 0.0 }).collect(),
    };
    nest(&flat, &t.shape)
}

fn nest(flat: &[f64], shape: &[i64]) -> serde_json::Value {
    match shape.first() {
        None => serde_json::json!(flat.first().copied().unwrap_or(0.0)),
        Some(&dim) => {
            let dim = dim.max(0) as usize;
            let rest = &shape[1..];
            let stride = flat.len().checked_div(dim.max(1)).unwrap_or(0);
            let items: Vec<serde_json::Value> = (0..dim)
                .map(|i| nest(&flat[i * stride..(i + 1) * stride], rest))
                .collect();
            serde_json::Value::Array(items)
        }
    }
}

enum StreamFrame {
    Bytes(Vec<u8>),
    Message(GenericMessage),
    Close,
}

struct TcpStreamSink {
    tx: mpsc::UnboundedSender<StreamFrame>,
    cancelled: Arc<AtomicBool>,
}

impl StreamSink for TcpStreamSink {
    fn write_bytes(&self, bytes: &[u8]) -> Result<(), String> {
        self.tx.send(StreamFrame::Bytes(bytes.to_vec())).map_err(|e| e.to_string())
    }

    fn write_message(&self, msg: &GenericMessage) -> Result<(), String> {
        self.tx.send(StreamFrame::Message(msg.clone())).map_err(|e| e.to_string())
    }

    fn close(&self) {
        let _ = self.tx.send(StreamFrame::Close);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

async fn handle_streaming_predict(mut stream: TcpStream, input: GenericMessage, state: Arc<AppState>) -> anyhow::Result<()> {
    stream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nTransfer-Encoding: chunked\r\n\r\n")
        .await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancelled = Arc::new(AtomicBool::new(false));
    let sink = Box::new(TcpStreamSink {
        tx,
        cancelled: Arc::clone(&cancelled),
    });
    let ctx = RequestContext::new(Some(sink), None);

    let drain_ctx = ctx.clone();
    let drain = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let chunk = match frame {
                StreamFrame::Bytes(b) => b,
                StreamFrame::Message(m) => serde_json::to_vec(&m).unwrap_or_default(),
                StreamFrame::Close => break,
            };
            if write_chunk(&mut stream, &chunk).await.is_err() {
                break;
            }
        }
        let _ = write_final_chunk(&mut stream).await;
        let _ = drain_ctx;
    });

    let result = state.engine.infer(input, &ctx, None).await;
    ctx.fire_completion();
    if let Err(e) = result {
        tracing::debug!(error = %e, "streaming predict failed");
    }
    let _ = drain.await;
    Ok(())
}

async fn write_chunk(stream: &mut TcpStream, data: &[u8]) -> anyhow::Result<()> {
    let header = format!("{:x}\r\n", data.len());
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(data).await?;
    stream.write_all(b"\r\n").await?;
    Ok(())
}

async fn write_final_chunk(stream: &mut TcpStream) -> anyhow::Result<()> {
    stream.write_all(b"0\r\n\r\n").await?;
    Ok(())
}

async fn write_json(stream: &mut TcpStream, status: u16, body: &str) -> anyhow::Result<()> {
    write_text(stream, status, "application/json", body).await
}

async fn write_bytes(stream: &mut TcpStream, status: u16, body: &[u8]) -> anyhow::Result<()> {
    write_bytes_as(stream, status, body, "application/octet-stream").await
}

async fn write_bytes_as(stream: &mut TcpStream, status: u16, body: &[u8], content_type: &str) -> anyhow::Result<()> {
    let reason = reason_phrase(status);
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}

async fn write_text(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) -> anyhow::Result<()> {
    let reason = reason_phrase(status);
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_target_separates_path_and_query() {
        let (path, query) = split_target("/grps/v1/infer/predict?return-ndarray=true&streaming=false");
        assert_eq!(path, "/grps/v1/infer/predict");
        assert_eq!(query.get("return-ndarray").map(String::as_str), Some("true"));
        assert_eq!(query.get("streaming").map(String::as_str), Some("false"));
    }

    #[test]
    fn split_target_with_no_query_is_empty_map() {
        let (path, query) = split_target("/grps/v1/health/live");
        assert_eq!(path, "/grps/v1/health/live");
        assert!(query.is_empty());
    }

    #[test]
    fn find_header_end_locates_blank_line() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody".to_vec();
        assert_eq!(find_header_end(&buf), Some(buf.len() - 4));
    }

    #[test]
    fn nest_rebuilds_rectangular_shape() {
        let flat = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let value = nest(&flat, &[2, 3]);
        assert_eq!(value, serde_json::json!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]));
    }

    #[test]
    fn message_to_json_round_trips_str_data_key() {
        let value = message_to_json(&GenericMessage::Str("hello".to_string()));
        assert_eq!(value, serde_json::json!({"str_data": "hello"}));
    }

    #[test]
    fn strip_yaml_comments_drops_comment_lines() {
        let yaml = "# top comment\nmax_connections: 100\nlog:\n  log_dir: /tmp # inline-ish comment above the value\n  log_backup_count: 3\n";
        let stripped = strip_yaml_comments(yaml).unwrap();
        assert!(!stripped.contains('#'));
        assert!(stripped.contains("max_connections: 100"));
    }

    #[test]
    fn extract_model_subtree_returns_only_the_matching_model() {
        let yaml = r#"
models:
  - name: echo
    version: "1"
    device: cpu
  - name: other
    version: "2"
    device: cpu
dag:
  type: sequential
  name: main
  nodes: []
"#;
        let subtree = extract_model_subtree(yaml, "echo-1").unwrap();
        assert!(subtree.contains("name: echo"));
        assert!(!subtree.contains("other"));
    }

    #[test]
    fn extract_model_subtree_is_none_for_unknown_key() {
        let yaml = "models:\n  - name: echo\n    version: \"1\"\ndag:\n  type: sequential\n  name: main\n  nodes: []\n";
        assert!(extract_model_subtree(yaml, "nope-1").is_none());
    }
}
