//! Bootstraps models, converters, inferers, and batchers from declarative
//! configuration and wires them into a pipeline; exposes the single
//! `infer` entry point every transport adapter calls into.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::batcher::{Batcher, BatcherConfig};
use crate::config::{InferenceConfig, ModelConfig, ServerConfig};
use crate::context::RequestContext;
use crate::converter::{self, Converter, GenericConverter};
use crate::error::{EngineConfigError, EngineError};
use crate::inferer::{self, EchoInferer, Inferer};
use crate::message::GenericMessage;
use crate::metrics::MetricsAggregator;
use crate::model::Model;
use crate::pipeline::{DagNode, SequentialPipeline, StageNode};

/// A fully bootstrapped engine: immutable model registry plus the pipeline
/// built from `dag.yml`. Construct once via [`Engine::bootstrap`]; share
/// behind an `Arc` across transport tasks.
pub struct Engine {
    models: HashMap<String, Arc<Model>>,
    pipeline: SequentialPipeline,
    metrics: Arc<MetricsAggregator>,
    ticker: tokio::task::JoinHandle<()>,
}

impl Engine {
    /// Validate both documents, resolve every model's converter/inferer,
    /// start its batcher if configured, then build the sequential pipeline
    /// named by `dag.yml`. Any failure aborts with a precise
    /// [`EngineConfigError`] naming the offending key.
    pub async fn bootstrap(server_cfg: &ServerConfig, inference_cfg: &InferenceConfig) -> Result<Self, EngineConfigError> {
        server_cfg.validate()?;
        inference_cfg.validate()?;

        register_builtins();

        let metrics = Arc::new(MetricsAggregator::new());
        let ticker = metrics.spawn_ticker();

        let max_concurrency = server_cfg.max_concurrency.max(1) as usize;
        let mut models = HashMap::new();
        for model_cfg in &inference_cfg.models {
            let model = build_model(model_cfg, max_concurrency).await?;
            models.insert(model.key(), Arc::new(model));
        }

        let mut nodes = Vec::with_capacity(inference_cfg.dag.nodes.len());
        for node_cfg in &inference_cfg.dag.nodes {
            let dag_node = match node_cfg.kind.as_str() {
                "model" => {
                    let model = models.get(&node_cfg.model).ok_or_else(|| EngineConfigError::UnknownModel {
                        node: node_cfg.name.clone(),
                        model: node_cfg.model.clone(),
                    })?;
                    DagNode::Model(StageNode::new(
                        node_cfg.name.clone(),
                        model.converter.clone(),
                        Arc::clone(&model.inferer),
                        model.batcher.clone(),
                        Arc::clone(&metrics),
                    ))
                }
                "merger" => DagNode::Merger,
                "splitter" => DagNode::Splitter,
                other => {
                    return Err(EngineConfigError::InvalidKey {
                        key: "dag.nodes[].type".to_string(),
                        reason: format!("unknown node type `{other}`"),
                    })
                }
            };
            nodes.push(dag_node);
        }

        Ok(Self {
            models,
            pipeline: SequentialPipeline::new(nodes),
            metrics,
            ticker,
        })
    }

    /// Run one request through the pipeline (`model_name` absent), or
    /// directly through a single named model's stage (bypassing the
    /// pipeline), matching the original's `Infer(in, out, ctx, model_name?)`.
    pub async fn infer(
        &self,
        input: GenericMessage,
        ctx: &RequestContext,
        model_name: Option<&str>,
    ) -> Result<GenericMessage, EngineError> {
        match model_name {
            None => self.pipeline.run(input, ctx).await,
            Some(name) => {
                let model = self
                    .models
                    .get(name)
                    .ok_or_else(|| EngineConfigError::UnknownRegistryEntry {
                        kind: "model",
                        name: name.to_string(),
                    })?;
                let stage = StageNode::new(
                    model.key(),
                    model.converter.clone(),
                    Arc::clone(&model.inferer),
                    model.batcher.clone(),
                    Arc::clone(&self.metrics),
                );
                stage.process(input, ctx).await
            }
        }
    }

    /// The metrics aggregator fed by every request path; used by the
    /// `/grps/v1/monitor/*` surface.
    pub fn metrics(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.metrics)
    }

    /// Bootstrapped model keys, for `/grps/v1/metadata/model`.
    pub fn model_keys(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    /// Stop every batcher's dispatcher loop, stop the metrics ticker, and
    /// clear the converter/inferer registries. Mirrors the original's
    /// `Engine::Terminate`.
    pub async fn shutdown(&self) {
        for model in self.models.values() {
            if let Some(batcher) = &model.batcher {
                batcher.stop().await;
            }
        }
        self.ticker.abort();
        converter::clear_registry();
        inferer::clear_registry();
    }
}

fn register_builtins() {
    converter::register("generic", Box::new(GenericConverter));
    inferer::register("echo", Box::new(EchoInferer));
}

async fn build_model(cfg: &ModelConfig, max_concurrency: usize) -> Result<Model, EngineConfigError> {
    let converter: Option<Arc<dyn Converter>> = match cfg.converter_type.as_str() {
        "none" => None,
        "builtin" | "customized" => {
            let mut resolved = converter::resolve(&cfg.converter_name).ok_or_else(|| EngineConfigError::UnknownRegistryEntry {
                kind: "converter",
                name: cfg.converter_name.clone(),
            })?;
            init_converter(&mut resolved, &cfg.converter_args)?;
            Some(resolved)
        }
        other => {
            return Err(EngineConfigError::InvalidKey {
                key: "models[].converter_type".to_string(),
                reason: format!("unknown converter_type `{other}` for `{}`", cfg.key()),
            })
        }
    };

    if !matches!(cfg.inferer_type.as_str(), "builtin" | "customized") {
        return Err(EngineConfigError::InvalidKey {
            key: "models[].inferer_type".to_string(),
            reason: format!("unknown inferer_type `{}` for `{}`", cfg.inferer_type, cfg.key()),
        });
    }

    let mut inferer = inferer::resolve(&cfg.inferer_name).ok_or_else(|| EngineConfigError::UnknownRegistryEntry {
        kind: "inferer",
        name: cfg.inferer_name.clone(),
    })?;
    init_inferer(&mut inferer, &cfg.device, &cfg.inferer_args, std::path::Path::new(&cfg.inferer_path))?;

    let batcher = match &cfg.batching {
        Some(b) if b.kind == "dynamic" => {
            let batcher = Batcher::new(
                cfg.key(),
                converter.clone(),
                Arc::clone(&inferer),
                BatcherConfig {
                    max_batch_size: b.max_batch_size as usize,
                    batch_timeout: Duration::from_micros(b.batch_timeout_us.max(0) as u64),
                    max_concurrency,
                },
            );
            batcher.start().await;
            Some(batcher)
        }
        _ => None,
    };

    Ok(Model {
        name: cfg.name.clone(),
        version: cfg.version.clone(),
        converter,
        inferer,
        batcher,
    })
}

fn init_converter(converter: &mut Arc<dyn Converter>, args: &serde_yaml::Value) -> Result<(), EngineConfigError> {
    Arc::get_mut(converter)
        .map(|c| c.init(args))
        .transpose()
        .map_err(|e| EngineConfigError::InvalidKey {
            key: "models[].converter_args".to_string(),
            reason: e.to_string(),
        })?;
    Ok(())
}

fn init_inferer(
    inferer: &mut Arc<dyn Inferer>,
    device: &str,
    args: &serde_yaml::Value,
    path: &std::path::Path,
) -> Result<(), EngineConfigError> {
    let map_err = |e: crate::error::InfererError| EngineConfigError::InvalidKey {
        key: "models[].device".to_string(),
        reason: e.to_string(),
    };
    if let Some(i) = Arc::get_mut(inferer) {
        i.init(device, args).map_err(map_err)?;
        i.load(path).map_err(map_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_yml() -> &'static str {
        r#"
interface:
  framework: http
  host: 0.0.0.0
  port: "8080"
max_connections: 100
max_concurrency: 4
log:
  log_dir: /tmp/logs
  log_backup_count: 3
"#
    }

    fn inference_yml() -> &'static str {
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

    #[tokio::test]
    async fn bootstrap_then_infer_roundtrips_through_echo() {
        let server_cfg = ServerConfig::load(server_yml()).unwrap();
        let inference_cfg = InferenceConfig::load(inference_yml()).unwrap();
        let engine = Engine::bootstrap(&server_cfg, &inference_cfg).await.unwrap();

        let ctx = RequestContext::new(None, None);
        let input = GenericMessage::Str("hello".to_string());
        let out = engine.infer(input.clone(), &ctx, None).await.unwrap();
        assert_eq!(out, input);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn infer_by_model_name_bypasses_pipeline() {
        let server_cfg = ServerConfig::load(server_yml()).unwrap();
        let inference_cfg = InferenceConfig::load(inference_yml()).unwrap();
        let engine = Engine::bootstrap(&server_cfg, &inference_cfg).await.unwrap();

        let ctx = RequestContext::new(None, None);
        let input = GenericMessage::Str("direct".to_string());
        let out = engine.infer(input.clone(), &ctx, Some("echo-1")).await.unwrap();
        assert_eq!(out, input);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_inferer_type_is_rejected_at_bootstrap() {
        let server_cfg = ServerConfig::load(server_yml()).unwrap();
        let inference_cfg = InferenceConfig::load(&inference_yml().replace("inferer_type: builtin", "inferer_type: bogus")).unwrap();
        let err = Engine::bootstrap(&server_cfg, &inference_cfg).await.unwrap_err();
        assert!(matches!(err, EngineConfigError::InvalidKey { key, .. } if key == "models[].inferer_type"));
    }

    #[tokio::test]
    async fn unknown_model_name_is_an_error() {
        let server_cfg = ServerConfig::load(server_yml()).unwrap();
        let inference_cfg = InferenceConfig::load(inference_yml()).unwrap();
        let engine = Engine::bootstrap(&server_cfg, &inference_cfg).await.unwrap();

        let ctx = RequestContext::new(None, None);
        let result = engine.infer(GenericMessage::Str("x".to_string()), &ctx, Some("nope-1")).await;
        assert!(result.is_err());

        engine.shutdown().await;
    }
}
