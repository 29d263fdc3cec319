//! Stage node and sequential pipeline executor.

use std::sync::Arc;
use std::time::Instant;

use crate::batcher::Batcher;
use crate::context::RequestContext;
use crate::converter::Converter;
use crate::error::{EngineError, PipelineError};
use crate::inferer::Inferer;
use crate::message::GenericMessage;
use crate::metrics::{AggKind, MetricsAggregator};

/// One model invocation in the pipeline; optionally routed through a
/// batcher.
pub struct StageNode {
    name: String,
    converter: Option<Arc<dyn Converter>>,
    inferer: Arc<dyn Inferer>,
    batcher: Option<Arc<Batcher>>,
    metrics: Arc<MetricsAggregator>,
}

impl StageNode {
    /// Build a stage node from a model's parts.
    pub fn new(
        name: impl Into<String>,
        converter: Option<Arc<dyn Converter>>,
        inferer: Arc<dyn Inferer>,
        batcher: Option<Arc<Batcher>>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            name: name.into(),
            converter,
            inferer,
            batcher,
            metrics,
        }
    }

    /// Route one request through this stage: batcher if attached, else
    /// inline converter+inferer, else the inferer's message path directly.
    pub async fn process(&self, input: GenericMessage, ctx: &RequestContext) -> Result<GenericMessage, EngineError> {
        ctx.bind_stage(
            self.converter.as_ref().map(Arc::downgrade),
            Arc::downgrade(&self.inferer),
        );

        if self.batcher.is_some() {
            return self.process_via_batcher(input, ctx.clone()).await;
        }

        if let Some(converter) = &self.converter {
            let t0 = Instant::now();
            let tensors = converter.pre_process(&input, ctx)?;
            self.record_latency("preprocess", t0.elapsed());
            if ctx.has_error() {
                return Err(PipelineError::ContextFailed(ctx.error_msg()).into());
            }

            let t0 = Instant::now();
            let out_tensors = self.inferer.infer(&tensors)?;
            self.record_latency("infer", t0.elapsed());
            if ctx.has_error() {
                return Err(PipelineError::ContextFailed(ctx.error_msg()).into());
            }

            let t0 = Instant::now();
            let out = converter.post_process(&out_tensors, ctx)?;
            self.record_latency("postprocess", t0.elapsed());
            Ok(out)
        } else {
            let t0 = Instant::now();
            let out = self.inferer.infer_message(&input)?;
            self.record_latency("infer", t0.elapsed());
            Ok(out)
        }
    }

    async fn process_via_batcher(&self, input: GenericMessage, ctx: RequestContext) -> Result<GenericMessage, EngineError> {
        let batcher = self.batcher.as_ref().expect("checked by caller");
        batcher.submit(input, ctx).await.map_err(Into::into)
    }

    fn record_latency(&self, phase: &str, elapsed: std::time::Duration) {
        let name = format!("{}.{phase}_latency_ms", self.name);
        let metrics = Arc::clone(&self.metrics);
        let value = elapsed.as_secs_f64() * 1000.0;
        tokio::spawn(async move {
            let now = chrono::Utc::now().timestamp();
            metrics.record(&name, value, AggKind::Avg, now).await;
        });
    }
}

/// A DAG node's tagged variant. `Merger`/`Splitter` are reserved for forward
/// compatibility and are never runnable today.
pub enum DagNode {
    /// Runs one model stage.
    Model(StageNode),
    /// Reserved, unimplemented.
    Merger,
    /// Reserved, unimplemented.
    Splitter,
}

impl DagNode {
    async fn process(&self, input: GenericMessage, ctx: &RequestContext) -> Result<GenericMessage, EngineError> {
        match self {
            DagNode::Model(stage) => stage.process(input, ctx).await,
            DagNode::Merger => Err(PipelineError::UnsupportedNodeType("merger".to_string()).into()),
            DagNode::Splitter => Err(PipelineError::UnsupportedNodeType("splitter".to_string()).into()),
        }
    }
}

/// Ordered chain of stage nodes; each stage's output feeds the next stage's
/// input. Linear today; `Pipeline` is reserved for a future DAG.
pub struct SequentialPipeline {
    nodes: Vec<DagNode>,
}

impl SequentialPipeline {
    /// Build a pipeline from an ordered node list.
    pub fn new(nodes: Vec<DagNode>) -> Self {
        Self { nodes }
    }

    /// Run every stage in order, short-circuiting on the context's error
    /// flag or a stage's own error.
    pub async fn run(&self, input: GenericMessage, ctx: &RequestContext) -> Result<GenericMessage, EngineError> {
        if self.nodes.is_empty() {
            return Err(PipelineError::Empty.into());
        }
        let mut current = input;
        for node in &self.nodes {
            if ctx.has_error() {
                break;
            }
            current = node.process(current, ctx).await?;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsAggregator;

    /// Appends its own tag to a `Str` message so a test can assert that each
    /// stage actually received the previous stage's output, not the original
    /// input.
    #[derive(Clone)]
    struct TaggingInferer {
        tag: &'static str,
    }

    impl Inferer for TaggingInferer {
        fn infer(&self, inputs: &[crate::message::GenericTensor]) -> Result<Vec<crate::message::GenericTensor>, crate::error::InfererError> {
            Ok(inputs.to_vec())
        }

        fn infer_message(&self, msg: &GenericMessage) -> Result<GenericMessage, crate::error::InfererError> {
            match msg {
                GenericMessage::Str(s) => Ok(GenericMessage::Str(format!("{s}->{}", self.tag))),
                other => Ok(other.clone()),
            }
        }

        fn clone_box(&self) -> Box<dyn Inferer> {
            Box::new(self.clone())
        }
    }

    /// Marks the context errored during pre-process but otherwise returns
    /// successfully, modeling a converter that records a recoverable-looking
    /// problem on the context rather than returning `Err` itself.
    #[derive(Clone, Default)]
    struct ErrorMarkingConverter;

    impl Converter for ErrorMarkingConverter {
        fn pre_process(
            &self,
            _msg: &GenericMessage,
            ctx: &RequestContext,
        ) -> Result<Vec<crate::message::GenericTensor>, crate::error::ConverterError> {
            ctx.set_error("upstream quota exceeded");
            Ok(vec![])
        }

        fn post_process(
            &self,
            tensors: &[crate::message::GenericTensor],
            _ctx: &RequestContext,
        ) -> Result<GenericMessage, crate::error::ConverterError> {
            Ok(GenericMessage::Tensors(tensors.to_vec()))
        }

        fn clone_box(&self) -> Box<dyn Converter> {
            Box::new(self.clone())
        }
    }

    fn stage(tag: &'static str) -> DagNode {
        DagNode::Model(StageNode::new(
            tag,
            None,
            Arc::new(TaggingInferer { tag }),
            None,
            Arc::new(MetricsAggregator::new()),
        ))
    }

    #[tokio::test]
    async fn multi_stage_pipeline_chains_input_to_output() {
        let pipeline = SequentialPipeline::new(vec![stage("a"), stage("b"), stage("c")]);
        let ctx = RequestContext::new(None, None);
        let out = pipeline.run(GenericMessage::Str("in".to_string()), &ctx).await.unwrap();
        assert_eq!(out, GenericMessage::Str("in->a->b->c".to_string()));
    }

    #[tokio::test]
    async fn empty_pipeline_is_rejected() {
        let pipeline = SequentialPipeline::new(vec![]);
        let ctx = RequestContext::new(None, None);
        let err = pipeline.run(GenericMessage::Str("in".to_string()), &ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::Empty)));
    }

    #[tokio::test]
    async fn context_error_surfaces_the_real_message_not_a_fabricated_one() {
        let stage = StageNode::new(
            "boom",
            Some(Arc::new(ErrorMarkingConverter)),
            Arc::new(crate::inferer::EchoInferer),
            None,
            Arc::new(MetricsAggregator::new()),
        );
        let ctx = RequestContext::new(None, None);
        let input = GenericMessage::from_float32_tensor(vec![1], vec![1.0]);
        let err = stage.process(input, &ctx).await.unwrap_err();
        match err {
            EngineError::Pipeline(PipelineError::ContextFailed(msg)) => {
                assert_eq!(msg, "upstream quota exceeded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
