//! Declarative configuration: structural `serde_yaml` parse followed by a
//! business-rule validation pass, mirroring the source's
//! `LoadServerConf`/`LoadInferenceConf` (load-then-validate, not
//! structural-only).

use std::collections::HashSet;

use serde::Deserialize;

use crate::error::EngineConfigError;

fn invalid(key: &str, reason: impl Into<String>) -> EngineConfigError {
    EngineConfigError::InvalidKey {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Top-level `server.yml` document.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// `interface.*`.
    pub interface: InterfaceConfig,
    /// Simultaneous open connections cap.
    pub max_connections: i64,
    /// Worker-pool size.
    pub max_concurrency: i64,
    /// `gpu.*`, omitted entirely when no GPU support is configured.
    #[serde(default)]
    pub gpu: Option<GpuConfig>,
    /// `log.*`.
    pub log: LogConfig,
}

/// `interface.*`.
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    /// One of `http`, `http+rpcA`, `http+rpcB`.
    pub framework: String,
    /// Dotted IPv4 bind address.
    pub host: String,
    /// Comma-separated decimal port list (one port for `http`, two for a
    /// dual-protocol framework).
    pub port: String,
    /// User-overridable predict endpoint, if configured.
    #[serde(default)]
    pub customized_predict_http: Option<CustomizedPredictHttp>,
}

/// `interface.customized_predict_http.*`.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomizedPredictHttp {
    /// Absolute path, must match `^/[A-Za-z0-9_\-/]+$`.
    pub path: String,
    /// If true, the handler receives the raw body; if false, the core
    /// parses canonical JSON first.
    pub customized_body: bool,
    /// Streaming control knobs, all individually defaulted.
    #[serde(default)]
    pub streaming_ctrl: StreamingCtrl,
}

/// Where and under what key the streaming flag is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CtrlMode {
    /// Look up `ctrl_key` in the query string.
    QueryParam,
    /// Look up `ctrl_key` as a header name.
    HeaderParam,
    /// Look up `ctrl_key` as a JSON body field.
    BodyParam,
}

/// `interface.customized_predict_http.streaming_ctrl.*`.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingCtrl {
    /// Defaults to [`CtrlMode::QueryParam`].
    #[serde(default = "default_ctrl_mode")]
    pub ctrl_mode: CtrlMode,
    /// Defaults to `"streaming"`.
    #[serde(default = "default_ctrl_key")]
    pub ctrl_key: String,
    /// Defaults to `"application/octet-stream"`.
    #[serde(default = "default_res_content_type")]
    pub res_content_type: String,
}

impl Default for StreamingCtrl {
    fn default() -> Self {
        Self {
            ctrl_mode: default_ctrl_mode(),
            ctrl_key: default_ctrl_key(),
            res_content_type: default_res_content_type(),
        }
    }
}

fn default_ctrl_mode() -> CtrlMode {
    CtrlMode::QueryParam
}

fn default_ctrl_key() -> String {
    "streaming".to_string()
}

fn default_res_content_type() -> String {
    "application/octet-stream".to_string()
}

/// `gpu.*`.
#[derive(Debug, Clone, Deserialize)]
pub struct GpuConfig {
    /// `none`, or a named memory-arena controller.
    pub mem_manager_type: String,
    /// Required unless `mem_manager_type == "none"`.
    #[serde(default)]
    pub mem_limit_mib: Option<i64>,
    /// Required unless `mem_manager_type == "none"`.
    #[serde(default)]
    pub mem_gc_enable: Option<bool>,
    /// Required unless `mem_manager_type == "none"`.
    #[serde(default)]
    pub mem_gc_interval: Option<i64>,
    /// Ordered device indices as configured; remapped against
    /// `CUDA_VISIBLE_DEVICES` at bootstrap by [`remap_gpu_devices`].
    pub devices: Vec<i64>,
}

/// `log.*`.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Directory logs and monitor snapshots are written under.
    pub log_dir: String,
    /// Must be `>= 1`.
    pub log_backup_count: i64,
}

impl ServerConfig {
    /// Parse a `server.yml` document and re-validate the business rules the
    /// structural `serde` pass cannot express on its own.
    pub fn load(raw: &str) -> Result<Self, EngineConfigError> {
        let cfg: ServerConfig =
            serde_yaml::from_str(raw).map_err(|e| invalid("server.yml", e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Business-rule validation pass, mirroring `LoadServerConf`.
    pub fn validate(&self) -> Result<(), EngineConfigError> {
        if !matches!(self.interface.framework.as_str(), "http" | "http+rpcA" | "http+rpcB") {
            return Err(invalid("interface.framework", "must be one of http, http+rpcA, http+rpcB"));
        }
        let ports = self.ports()?;
        let expected = if self.interface.framework == "http" { 1 } else { 2 };
        if ports.len() != expected {
            return Err(invalid(
                "interface.port",
                format!("framework {} expects {expected} port(s), got {}", self.interface.framework, ports.len()),
            ));
        }
        if self.interface.host.parse::<std::net::Ipv4Addr>().is_err() {
            return Err(invalid("interface.host", "must be a dotted IPv4 address"));
        }

        if let Some(custom) = &self.interface.customized_predict_http {
            custom.validate()?;
        }

        if self.max_connections < 1 {
            return Err(invalid("max_connections", "must be >= 1"));
        }
        if self.max_concurrency < 1 {
            return Err(invalid("max_concurrency", "must be >= 1"));
        }

        if let Some(gpu) = &self.gpu {
            gpu.validate()?;
        }

        if self.log.log_backup_count < 1 {
            return Err(invalid("log.log_backup_count", "must not be less than 1"));
        }

        Ok(())
    }

    /// Parsed, ordered port list.
    pub fn ports(&self) -> Result<Vec<u16>, EngineConfigError> {
        self.interface
            .port
            .split(',')
            .map(|p| p.trim().parse::<u16>().map_err(|_| invalid("interface.port", format!("`{p}` is not a valid port"))))
            .collect()
    }
}

impl CustomizedPredictHttp {
    fn validate(&self) -> Result<(), EngineConfigError> {
        let valid_path = self.path.starts_with('/')
            && !self.path.is_empty()
            && self
                .path
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/'));
        if !valid_path {
            return Err(invalid(
                "interface.customized_predict_http.path",
                "must match ^/[A-Za-z0-9_-/]+$",
            ));
        }
        const BUILTIN_PATHS: &[&str] = &[
            "/grps/v1/infer/predict",
            "/grps/v1/health/online",
            "/grps/v1/health/offline",
            "/grps/v1/health/live",
            "/grps/v1/health/ready",
            "/grps/v1/metadata/server",
            "/grps/v1/metadata/model",
            "/grps/v1/monitor/metrics",
            "/grps/v1/monitor/series",
        ];
        if BUILTIN_PATHS.contains(&self.path.as_str()) {
            return Err(invalid(
                "interface.customized_predict_http.path",
                "collides with a built-in path",
            ));
        }
        Ok(())
    }
}

impl GpuConfig {
    fn validate(&self) -> Result<(), EngineConfigError> {
        if self.mem_manager_type != "none" {
            if self.mem_limit_mib.is_none() {
                return Err(invalid("gpu.mem_limit_mib", "required unless gpu.mem_manager_type is none"));
            }
            if self.mem_gc_enable.is_none() {
                return Err(invalid("gpu.mem_gc_enable", "required unless gpu.mem_manager_type is none"));
            }
            if self.mem_gc_interval.is_none() {
                return Err(invalid("gpu.mem_gc_interval", "required unless gpu.mem_manager_type is none"));
            }
        }
        Ok(())
    }
}

/// Remap configured device indices against `CUDA_VISIBLE_DEVICES` (when
/// present). A pure function so it is independently testable without
/// touching any actual device.
pub fn remap_gpu_devices(configured: &[i64], env: Option<&str>) -> Vec<i64> {
    let Some(env) = env else {
        return configured.to_vec();
    };
    let visible: Vec<i64> = env.split(',').filter_map(|s| s.trim().parse::<i64>().ok()).collect();
    if visible.is_empty() {
        return configured.to_vec();
    }
    configured
        .iter()
        .filter_map(|idx| visible.get(*idx as usize).copied())
        .collect()
}

/// Top-level `inference.yml` document.
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Declared models.
    pub models: Vec<ModelConfig>,
    /// The pipeline wiring.
    pub dag: DagConfig,
}

/// One `models[*]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Model name (without version).
    pub name: String,
    /// Model version.
    pub version: String,
    /// `cpu`, `cuda[:N]`, `gpu[:N]`, or `original`.
    pub device: String,
    /// `builtin` category name, or `customized`.
    pub inferer_type: String,
    /// Required only when `device == "original"` and `inferer_type ==
    /// "torch"`.
    #[serde(default)]
    pub inp_device: Option<String>,
    /// Registry name (builtin kind or customized registration name).
    pub inferer_name: String,
    /// Filesystem path to the model artifact.
    pub inferer_path: String,
    /// Opaque construction arguments passed to `Inferer::init`.
    #[serde(default)]
    pub inferer_args: serde_yaml::Value,
    /// `builtin` category name, `customized`, or `none` (no-converter mode).
    pub converter_type: String,
    /// Registry name, meaningless when `converter_type == "none"`.
    #[serde(default)]
    pub converter_name: String,
    /// Filesystem path to converter config, if any.
    #[serde(default)]
    pub converter_path: String,
    /// Opaque construction arguments passed to `Converter::init`.
    #[serde(default)]
    pub converter_args: serde_yaml::Value,
    /// Absent means `type: none` (no batcher attached).
    #[serde(default)]
    pub batching: Option<BatchingConfig>,
}

impl ModelConfig {
    /// The fully-qualified `name-version` registry key.
    pub fn key(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    fn validate(&self) -> Result<(), EngineConfigError> {
        if self.device == "original" && self.inferer_type == "torch" && self.inp_device.is_none() {
            return Err(invalid(
                "models[].inp_device",
                format!("required for model `{}` (device=original, inferer_type=torch)", self.key()),
            ));
        }
        if let Some(batching) = &self.batching {
            batching.validate(&self.key())?;
        }
        Ok(())
    }
}

/// `models[*].batching`.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    /// `none` or `dynamic`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Maximum number of tasks per dispatched batch.
    #[serde(default)]
    pub max_batch_size: i64,
    /// Maximum microseconds to wait for a batch to fill once non-empty; `0`
    /// dispatches as soon as at least one task is queued.
    #[serde(default)]
    pub batch_timeout_us: i64,
}

impl BatchingConfig {
    fn validate(&self, model_key: &str) -> Result<(), EngineConfigError> {
        if self.kind == "none" {
            return Ok(());
        }
        if self.kind != "dynamic" {
            return Err(invalid("models[].batching.type", format!("unknown batching type `{}` for `{model_key}`", self.kind)));
        }
        if self.max_batch_size < 1 {
            return Err(invalid("models[].batching.max_batch_size", format!("must be >= 1 for `{model_key}`")));
        }
        if self.batch_timeout_us < 0 {
            return Err(invalid("models[].batching.batch_timeout_us", format!("must be >= 0 for `{model_key}`")));
        }
        Ok(())
    }
}

/// `dag.*`.
#[derive(Debug, Clone, Deserialize)]
pub struct DagConfig {
    /// `sequential` (runnable) or `graph` (accepted, rejected at bootstrap).
    #[serde(rename = "type")]
    pub kind: String,
    /// Pipeline name, informational only.
    pub name: String,
    /// Ordered stage list for the sequential case.
    pub nodes: Vec<DagNodeConfig>,
}

/// One `dag.nodes[*]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct DagNodeConfig {
    /// Node name.
    pub name: String,
    /// `model`, `merger`, or `splitter`.
    #[serde(rename = "type")]
    pub kind: String,
    /// `name-version` reference into `models[*]`, meaningful for `model`
    /// nodes.
    #[serde(default)]
    pub model: String,
}

impl InferenceConfig {
    /// Parse an `inference.yml` document and re-validate duplicate-model and
    /// dangling-reference invariants the structural parse cannot express.
    pub fn load(raw: &str) -> Result<Self, EngineConfigError> {
        let cfg: InferenceConfig =
            serde_yaml::from_str(raw).map_err(|e| invalid("inference.yml", e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Business-rule validation pass, mirroring `LoadInferenceConf`.
    pub fn validate(&self) -> Result<(), EngineConfigError> {
        let mut seen = HashSet::new();
        for model in &self.models {
            model.validate()?;
            if !seen.insert(model.key()) {
                return Err(EngineConfigError::DuplicateModel(model.key()));
            }
        }

        if self.dag.kind == "graph" {
            return Err(invalid("dag.type", "graph DAGs are accepted syntactically but not runnable"));
        }
        if self.dag.kind != "sequential" {
            return Err(invalid("dag.type", format!("unknown dag type `{}`", self.dag.kind)));
        }

        for node in &self.dag.nodes {
            if node.kind == "model" && !seen.contains(&node.model) {
                return Err(EngineConfigError::UnknownModel {
                    node: node.name.clone(),
                    model: node.model.clone(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_server_yml() -> &'static str {
        r#"
interface:
  framework: http
  host: 0.0.0.0
  port: "8080"
max_connections: 1000
max_concurrency: 4
log:
  log_dir: /tmp/logs
  log_backup_count: 7
"#
    }

    #[test]
    fn minimal_server_config_parses_and_validates() {
        let cfg = ServerConfig::load(minimal_server_yml()).unwrap();
        assert_eq!(cfg.ports().unwrap(), vec![8080]);
    }

    #[test]
    fn dual_framework_requires_two_ports() {
        let yml = minimal_server_yml().replace("framework: http", "framework: http+rpcA").replace("port: \"8080\"", "port: \"8080,9090\"");
        assert!(ServerConfig::load(&yml).is_ok());
        let bad = minimal_server_yml().replace("framework: http", "framework: http+rpcA");
        assert!(ServerConfig::load(&bad).is_err());
    }

    #[test]
    fn zero_backup_count_is_rejected() {
        let yml = minimal_server_yml().replace("log_backup_count: 7", "log_backup_count: 0");
        assert!(matches!(ServerConfig::load(&yml), Err(EngineConfigError::InvalidKey { .. })));
    }

    #[test]
    fn customized_path_colliding_with_builtin_is_rejected() {
        let yml = r#"
interface:
  framework: http
  host: 0.0.0.0
  port: "8080"
  customized_predict_http:
    path: /grps/v1/infer/predict
    customized_body: false
max_connections: 1000
max_concurrency: 4
log:
  log_dir: /tmp/logs
  log_backup_count: 7
"#;
        let bad = ServerConfig::load(yml).unwrap_err();
        assert!(matches!(bad, EngineConfigError::InvalidKey { .. }));
    }

    fn minimal_inference_yml() -> &'static str {
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

    #[test]
    fn minimal_inference_config_parses_and_validates() {
        let cfg = InferenceConfig::load(minimal_inference_yml()).unwrap();
        assert_eq!(cfg.models.len(), 1);
        assert_eq!(cfg.models[0].key(), "echo-1");
    }

    #[test]
    fn duplicate_model_key_is_rejected() {
        let yml = format!(
            "{}\n  - name: echo\n    version: \"1\"\n    device: cpu\n    inferer_type: builtin\n    inferer_name: echo\n    inferer_path: \"\"\n    converter_type: none\n",
            minimal_inference_yml().trim_end()
        );
        let err = InferenceConfig::load(&yml).unwrap_err();
        assert!(matches!(err, EngineConfigError::DuplicateModel(k) if k == "echo-1"));
    }

    #[test]
    fn dangling_dag_reference_is_rejected() {
        let yml = minimal_inference_yml().replace("model: echo-1", "model: nope-1");
        let err = InferenceConfig::load(&yml).unwrap_err();
        assert!(matches!(err, EngineConfigError::UnknownModel { .. }));
    }

    #[test]
    fn graph_dag_type_is_syntactically_accepted_but_rejected_at_validate() {
        let yml = minimal_inference_yml().replace("type: sequential", "type: graph");
        let err = InferenceConfig::load(&yml).unwrap_err();
        assert!(matches!(err, EngineConfigError::InvalidKey { key, .. } if key == "dag.type"));
    }

    #[test]
    fn gpu_devices_remap_against_cuda_visible_devices() {
        assert_eq!(remap_gpu_devices(&[0, 1, 2], Some("5,6,7")), vec![5, 6, 7]);
        assert_eq!(remap_gpu_devices(&[0, 1, 2], None), vec![0, 1, 2]);
        assert_eq!(remap_gpu_devices(&[0, 5], Some("5,6,7")), vec![5]);
    }
}
