#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Request-processing engine for a general-purpose inference serving
//! gateway: dynamic batcher, per-request execution context, stage node /
//! sequential pipeline executor, metrics aggregation pipeline, and the
//! bootstrapper that wires them together from declarative configuration.

pub mod batcher;
pub mod config;
pub mod context;
pub mod converter;
pub mod engine;
pub mod error;
pub mod inferer;
pub mod message;
pub mod metrics;
pub mod model;
pub mod pipeline;

pub use batcher::{Batcher, BatcherConfig, Task};
pub use config::{InferenceConfig, ServerConfig};
pub use context::{DisconnectProbe, RequestContext, StreamSink};
pub use converter::{Converter, GenericConverter};
pub use engine::Engine;
pub use error::{EngineConfigError, EngineError};
pub use inferer::{EchoInferer, Inferer, StreamPool};
pub use message::{DType, GenericMessage, GenericTensor, TensorData};
pub use metrics::{AggKind, MetricsAggregator};
pub use model::Model;
pub use pipeline::{DagNode, SequentialPipeline, StageNode};
