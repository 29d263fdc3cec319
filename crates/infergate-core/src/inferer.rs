//! Loads a model and produces output tensors from input tensors.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::InfererError;
use crate::message::{GenericMessage, GenericTensor};

/// A validated device placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    /// CPU execution.
    Cpu,
    /// GPU execution via a generic `gpu[:N]` selector.
    Gpu(Option<u32>),
    /// CUDA execution via `cuda[:N]`.
    Cuda(Option<u32>),
    /// The framework's own original device placement (no remapping).
    Original,
}

/// Parse one of the accepted device-string forms: `cpu`, `cuda`, `gpu`,
/// `cuda:N`, `gpu:N`, or `original`.
pub fn parse_device(s: &str) -> Result<Device, InfererError> {
    let s = s.trim();
    if s == "cpu" {
        return Ok(Device::Cpu);
    }
    if s == "original" {
        return Ok(Device::Original);
    }
    if let Some(rest) = s.strip_prefix("cuda") {
        return parse_indexed(rest, Device::Cuda as fn(Option<u32>) -> Device, s);
    }
    if let Some(rest) = s.strip_prefix("gpu") {
        return parse_indexed(rest, Device::Gpu as fn(Option<u32>) -> Device, s);
    }
    Err(InfererError::InvalidDevice(s.to_string()))
}

fn parse_indexed(
    rest: &str,
    ctor: fn(Option<u32>) -> Device,
    original: &str,
) -> Result<Device, InfererError> {
    if rest.is_empty() {
        return Ok(ctor(None));
    }
    let idx = rest
        .strip_prefix(':')
        .and_then(|n| n.parse::<u32>().ok())
        .ok_or_else(|| InfererError::InvalidDevice(original.to_string()))?;
    Ok(ctor(Some(idx)))
}

/// Capability set an inferer exposes, covering both the tensor-in/tensor-out
/// path and the "no-converter mode" message-in/message-out path.
pub trait Inferer: Send + Sync {
    /// Validate the device string and perform any device-side setup.
    fn init(&mut self, device: &str, _args: &serde_yaml::Value) -> Result<(), InfererError> {
        parse_device(device)?;
        Ok(())
    }

    /// Deserialize the model file and discover its input/output bindings.
    fn load(&mut self, _path: &Path) -> Result<(), InfererError> {
        Ok(())
    }

    /// Run inference for one request.
    fn infer(&self, inputs: &[GenericTensor]) -> Result<Vec<GenericTensor>, InfererError>;

    /// Run inference for a pre-batched request.
    fn batch_infer(&self, inputs: &[GenericTensor]) -> Result<Vec<GenericTensor>, InfererError> {
        self.infer(inputs)
    }

    /// "No-converter mode": accept and produce wire messages directly,
    /// bridging to tensors internally.
    fn infer_message(&self, _msg: &GenericMessage) -> Result<GenericMessage, InfererError> {
        Err(InfererError::Other("no-converter mode not implemented".to_string()))
    }

    /// Batched "no-converter mode".
    fn batch_infer_message(&self, msgs: &[GenericMessage]) -> Result<Vec<GenericMessage>, InfererError> {
        let mut out = Vec::with_capacity(msgs.len());
        for msg in msgs {
            out.push(self.infer_message(msg)?);
        }
        Ok(out)
    }

    /// Produce a fresh, independently-mutable clone of this inferer.
    fn clone_box(&self) -> Box<dyn Inferer>;
}

/// The fixture inferer assumed by the spec's end-to-end scenarios: copies
/// every input tensor straight to the output.
#[derive(Debug, Default, Clone)]
pub struct EchoInferer;

impl Inferer for EchoInferer {
    fn infer(&self, inputs: &[GenericTensor]) -> Result<Vec<GenericTensor>, InfererError> {
        Ok(inputs.to_vec())
    }

    fn infer_message(&self, msg: &GenericMessage) -> Result<GenericMessage, InfererError> {
        Ok(msg.clone())
    }

    fn clone_box(&self) -> Box<dyn Inferer> {
        Box::new(self.clone())
    }
}

/// Fixed-size pool of independently-lockable contexts, rotated by a
/// compare-and-swap counter. Models the original's TensorRT-style
/// multi-stream inferer without depending on an actual tensor runtime.
pub struct StreamPool<T> {
    contexts: Vec<Mutex<T>>,
    next: AtomicUsize,
}

impl<T> StreamPool<T> {
    /// Build a pool of `n` contexts, each produced by `make`.
    pub fn new(n: usize, mut make: impl FnMut() -> T) -> Self {
        let contexts = (0..n.max(1)).map(|_| Mutex::new(make())).collect();
        Self {
            contexts,
            next: AtomicUsize::new(0),
        }
    }

    /// Acquire the next context in round-robin order and run `f` against it.
    pub fn with_next<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        let mut guard = self.contexts[idx].lock().unwrap();
        f(&mut guard)
    }
}

/// A second built-in inferer exercising [`StreamPool`]: replays the most
/// recent input seen by whichever stream context handled the request,
/// grounded on the original's per-stream host-buffer reuse without any
/// concrete tensor-runtime dependency.
pub struct ReplayInferer {
    streams: StreamPool<Option<Vec<GenericTensor>>>,
}

impl ReplayInferer {
    /// Build a replay inferer with `streams` independent contexts.
    pub fn new(streams: usize) -> Self {
        Self {
            streams: StreamPool::new(streams, || None),
        }
    }
}

impl Inferer for ReplayInferer {
    fn infer(&self, inputs: &[GenericTensor]) -> Result<Vec<GenericTensor>, InfererError> {
        self.streams.with_next(|slot| {
            let prev = slot.replace(inputs.to_vec());
            Ok(prev.unwrap_or_else(|| inputs.to_vec()))
        })
    }

    fn clone_box(&self) -> Box<dyn Inferer> {
        Box::new(ReplayInferer::new(self.streams.contexts.len()))
    }
}

/// Process-wide name → inferer registry, mirroring [`crate::converter`]'s.
static REGISTRY: OnceLock<Mutex<HashMap<String, Box<dyn Inferer>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Box<dyn Inferer>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register an inferer under `name`, replacing any prior binding.
pub fn register(name: impl Into<String>, inferer: Box<dyn Inferer>) {
    registry().lock().unwrap().insert(name.into(), inferer);
}

/// Obtain an inferer by name. Every call returns a fresh clone so mutable
/// per-instance state never aliases across Model entries.
pub fn resolve(name: &str) -> Option<Arc<dyn Inferer>> {
    registry().lock().unwrap().get(name).map(|i| Arc::from(i.clone_box()))
}

/// Remove every registered inferer. Called by `Engine::shutdown`.
pub fn clear_registry() {
    registry().lock().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_strings_parse() {
        assert_eq!(parse_device("cpu").unwrap(), Device::Cpu);
        assert_eq!(parse_device("original").unwrap(), Device::Original);
        assert_eq!(parse_device("cuda").unwrap(), Device::Cuda(None));
        assert_eq!(parse_device("cuda:2").unwrap(), Device::Cuda(Some(2)));
        assert_eq!(parse_device("gpu:0").unwrap(), Device::Gpu(Some(0)));
        assert!(parse_device("tpu:1").is_err());
    }

    #[test]
    fn echo_inferer_copies_inputs() {
        let inferer = EchoInferer;
        let inputs = vec![GenericTensor::new(
            None,
            vec![1],
            crate::message::TensorData::Int32(vec![7]),
        )];
        assert_eq!(inferer.infer(&inputs).unwrap(), inputs);
    }

    #[test]
    fn stream_pool_rotates_round_robin() {
        let pool = StreamPool::new(3, || 0u32);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(pool.with_next(|v| {
                *v += 1;
                *v
            }));
        }
        assert_eq!(seen, vec![1, 1, 1, 2, 2, 2]);
    }
}
