//! Error taxonomy for every component of the engine.

/// Fatal error raised while validating or wiring declarative configuration.
///
/// Always aborts bootstrap; never raised once the engine is running.
#[derive(Debug, thiserror::Error)]
pub enum EngineConfigError {
    /// A required key was missing or failed validation.
    #[error("invalid config key `{key}`: {reason}")]
    InvalidKey {
        /// Dotted key path, e.g. `interface.framework`.
        key: String,
        /// Human-readable reason.
        reason: String,
    },
    /// Two models resolved to the same `name-version` key.
    #[error("model `{0}` already exists")]
    DuplicateModel(String),
    /// A DAG node referenced a model that was never defined.
    #[error("dag node `{node}` references unknown model `{model}`")]
    UnknownModel {
        /// Node name.
        node: String,
        /// Referenced model key.
        model: String,
    },
    /// A named registry entry (converter or inferer) was not found.
    #[error("no `{kind}` registered under name `{name}`")]
    UnknownRegistryEntry {
        /// `"converter"` or `"inferer"`.
        kind: &'static str,
        /// Registered name looked up.
        name: String,
    },
}

/// Per-request error raised by a [`crate::converter::Converter`].
#[derive(Debug, thiserror::Error)]
pub enum ConverterError {
    /// The capability was not implemented by this converter.
    #[error("converter capability not implemented")]
    NotImplemented,
    /// The requested back-end was not enabled at build time.
    #[error("converter back-end `{0}` unsupported")]
    Unsupported(String),
    /// A dtype this converter cannot marshal.
    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),
    /// Batched inputs disagreed on name, dtype, or shape tail.
    #[error("batch shape mismatch: {0}")]
    ShapeMismatch(String),
    /// Catch-all for malformed input.
    #[error("{0}")]
    Other(String),
}

/// Per-request error raised by an [`crate::inferer::Inferer`].
#[derive(Debug, thiserror::Error)]
pub enum InfererError {
    /// Device string did not match one of the accepted forms.
    #[error("invalid device string `{0}`")]
    InvalidDevice(String),
    /// Model file could not be loaded.
    #[error("failed to load model: {0}")]
    LoadFailed(String),
    /// A tensor dimension fell outside the engine's declared profile.
    #[error("tensor shape out of profile bounds: {0}")]
    OutOfProfile(String),
    /// Catch-all inference failure.
    #[error("{0}")]
    Other(String),
}

/// Per-request error raised by the [`crate::batcher::Batcher`].
#[derive(Debug, thiserror::Error)]
pub enum BatcherError {
    /// The batcher was stopped while the task was queued or in flight.
    #[error("batcher stopped")]
    Stopped,
    /// An unexpected panic was caught inside the batch-processing closure.
    #[error("batch processing panicked: {0}")]
    WorkerPanic(String),
    /// The converter or inferer returned an ordinary error while processing
    /// this task's batch (no panic involved).
    #[error("{0}")]
    TaskFailed(String),
}

/// Per-request error raised by [`crate::context::RequestContext`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ContextStateError {
    /// `get_user_data` was called before `set_user_data`.
    #[error("user data not set")]
    UserDataUnset,
    /// `streaming_respond_with_post_process` was called with no converter attached.
    #[error("no converter attached to this context")]
    NoConverter,
    /// A customized-HTTP-streaming call was made on a context without an HTTP controller.
    #[error("no http controller attached to this context")]
    NoHttpController,
}

/// Per-request error raised by the pipeline executor.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A DAG node type that is syntactically accepted but not runnable.
    #[error("unsupported node type: {0}")]
    UnsupportedNodeType(String),
    /// The pipeline has no stages.
    #[error("pipeline is empty")]
    Empty,
    /// A stage observed the context's sticky error flag set mid-process;
    /// carries the context's own recorded message.
    #[error("{0}")]
    ContextFailed(String),
}

/// Per-request error that must map to HTTP 400 at the transport boundary.
#[derive(Debug, thiserror::Error)]
pub enum RequestShapeError {
    /// The request body had no recognizable member.
    #[error("Bad Request, err: Have no legal member in json body.")]
    NoLegalMember,
    /// A streaming request combined with `return-ndarray=true`.
    #[error("Bad Request, err: return-ndarray is not supported for streaming requests.")]
    NdarrayWithStreaming,
    /// Catch-all malformed request.
    #[error("Bad Request, err: {0}")]
    Other(String),
}

/// Resource-exhaustion subclass, surfaced to metrics as well as the client.
#[derive(Debug, thiserror::Error)]
pub enum ResourceExhausted {
    /// Device memory (or an analogous resource) was exhausted.
    #[error("resource exhausted: {0}")]
    Oom(String),
}

/// Unified per-request error returned by [`crate::engine::Engine::infer`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// See [`EngineConfigError`].
    #[error(transparent)]
    Config(#[from] EngineConfigError),
    /// See [`ConverterError`].
    #[error(transparent)]
    Converter(#[from] ConverterError),
    /// See [`InfererError`].
    #[error(transparent)]
    Inferer(#[from] InfererError),
    /// See [`BatcherError`].
    #[error(transparent)]
    Batcher(#[from] BatcherError),
    /// See [`ContextStateError`].
    #[error(transparent)]
    Context(#[from] ContextStateError),
    /// See [`PipelineError`].
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// See [`RequestShapeError`].
    #[error(transparent)]
    RequestShape(#[from] RequestShapeError),
    /// See [`ResourceExhausted`].
    #[error(transparent)]
    ResourceExhausted(#[from] ResourceExhausted),
}

impl EngineError {
    /// HTTP status code this error maps to at the transport boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::RequestShape(_) => 400,
            _ => 500,
        }
    }
}
