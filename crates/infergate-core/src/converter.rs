//! Pre/post transforms between wire messages and tensors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::context::RequestContext;
use crate::error::ConverterError;
use crate::message::{GenericMessage, GenericTensor, TensorData};

/// Batch size recorded into a context's user-scratch slot by
/// `batch_pre_process`, read back by `batch_post_process` to split the
/// merged output symmetrically.
#[derive(Clone, Copy, Debug)]
pub struct BatchSizes(pub Vec<usize>);

/// Capability set a converter exposes. Default method bodies fail with
/// [`ConverterError::NotImplemented`]; a converter only overrides what it
/// actually supports.
pub trait Converter: Send + Sync {
    /// Transform one request message into tensors.
    fn pre_process(&self, _msg: &GenericMessage, _ctx: &RequestContext) -> Result<Vec<GenericTensor>, ConverterError> {
        Err(ConverterError::NotImplemented)
    }

    /// Transform tensors back into a response message.
    fn post_process(&self, _tensors: &[GenericTensor], _ctx: &RequestContext) -> Result<GenericMessage, ConverterError> {
        Err(ConverterError::NotImplemented)
    }

    /// Merge `N` requests' tensors into one batch, recording each request's
    /// batch size (leading-axis extent) for the symmetric split in
    /// `batch_post_process`.
    fn batch_pre_process(
        &self,
        msgs: &[GenericMessage],
        ctxs: &[RequestContext],
    ) -> Result<Vec<GenericTensor>, ConverterError> {
        let _ = (msgs, ctxs);
        Err(ConverterError::NotImplemented)
    }

    /// Split a batched output back into per-request tensors using the sizes
    /// recorded by `batch_pre_process`.
    fn batch_post_process(
        &self,
        tensors: &[GenericTensor],
        ctxs: &[RequestContext],
    ) -> Result<Vec<GenericMessage>, ConverterError> {
        let _ = (tensors, ctxs);
        Err(ConverterError::NotImplemented)
    }

    /// Produce a fresh, independently-mutable clone of this converter.
    fn clone_box(&self) -> Box<dyn Converter>;

    /// One-time setup from declarative config.
    fn init(&mut self, _args: &serde_yaml::Value) -> Result<(), ConverterError> {
        Ok(())
    }
}

/// Identity converter over [`GenericTensor`]: the one tensor back-end this
/// crate ships without depending on an external tensor runtime (which is
/// explicitly out of scope). Honors the named-vs-positional rule and the
/// axis-0 concatenation contract for batching.
#[derive(Debug, Default, Clone)]
pub struct GenericConverter;

impl Converter for GenericConverter {
    fn pre_process(&self, msg: &GenericMessage, _ctx: &RequestContext) -> Result<Vec<GenericTensor>, ConverterError> {
        match msg {
            GenericMessage::Tensors(tensors) => Ok(tensors.clone()),
            other => Err(ConverterError::Other(format!(
                "GenericConverter cannot pre-process a {other:?} message"
            ))),
        }
    }

    fn post_process(&self, tensors: &[GenericTensor], _ctx: &RequestContext) -> Result<GenericMessage, ConverterError> {
        Ok(GenericMessage::Tensors(tensors.to_vec()))
    }

    fn batch_pre_process(
        &self,
        msgs: &[GenericMessage],
        ctxs: &[RequestContext],
    ) -> Result<Vec<GenericTensor>, ConverterError> {
        let mut per_request: Vec<Vec<GenericTensor>> = Vec::with_capacity(msgs.len());
        for msg in msgs {
            per_request.push(self.pre_process(msg, &ctxs[0])?);
        }
        let width = per_request.first().map(|t| t.len()).unwrap_or(0);
        if per_request.iter().any(|t| t.len() != width) {
            return Err(ConverterError::ShapeMismatch(
                "requests in batch disagree on tensor count".to_string(),
            ));
        }

        let mut merged = Vec::with_capacity(width);
        for slot in 0..width {
            let first = &per_request[0][slot];
            let name = first.name.clone();
            let tail = first.shape_tail().to_vec();
            let dtype = first.dtype();
            let mut batch_extent = 0i64;
            let mut merged_data = empty_like(dtype);
            for (req_idx, tensors) in per_request.iter().enumerate() {
                let t = &tensors[slot];
                if t.name != name || t.dtype() != dtype || t.shape_tail() != tail.as_slice() {
                    return Err(ConverterError::ShapeMismatch(format!(
                        "request {req_idx} tensor {slot} disagrees on name/dtype/shape tail"
                    )));
                }
                batch_extent += t.shape.first().copied().unwrap_or(1);
                append_into(&mut merged_data, &t.data)?;
            }
            let mut shape = vec![batch_extent];
            shape.extend(tail);
            merged.push(GenericTensor::new(name, shape, merged_data));
        }

        for (i, ctx) in ctxs.iter().enumerate() {
            let extent = per_request[i].first().map(|t| t.shape.first().copied().unwrap_or(1)).unwrap_or(1);
            ctx.set_user_data(BatchSizes(vec![extent as usize]));
        }

        Ok(merged)
    }

    fn batch_post_process(
        &self,
        tensors: &[GenericTensor],
        ctxs: &[RequestContext],
    ) -> Result<Vec<GenericMessage>, ConverterError> {
        let mut offsets = Vec::with_capacity(ctxs.len());
        let mut cursor = 0usize;
        for ctx in ctxs {
            let sizes = ctx
                .get_user_data::<BatchSizes>()
                .map_err(|e| ConverterError::Other(e.to_string()))?;
            let extent = sizes.0.first().copied().unwrap_or(1);
            offsets.push((cursor, extent));
            cursor += extent;
        }

        let mut out = vec![Vec::with_capacity(tensors.len()); ctxs.len()];
        for tensor in tensors {
            for (req_idx, (start, extent)) in offsets.iter().enumerate() {
                let slice = slice_rows(&tensor.data, tensor.shape_tail(), *start, *extent)?;
                let mut shape = vec![*extent as i64];
                shape.extend_from_slice(tensor.shape_tail());
                out[req_idx].push(GenericTensor::new(tensor.name.clone(), shape, slice));
            }
        }
        Ok(out.into_iter().map(GenericMessage::Tensors).collect())
    }

    fn clone_box(&self) -> Box<dyn Converter> {
        Box::new(self.clone())
    }
}

fn empty_like(dtype: crate::message::DType) -> TensorData {
    use crate::message::DType;
    match dtype {
        DType::Float32 => TensorData::Float32(Vec::new()),
        DType::Float64 => TensorData::Float64(Vec::new()),
        DType::Int32 => TensorData::Int32(Vec::new()),
        DType::Int64 => TensorData::Int64(Vec::new()),
        DType::Bool => TensorData::Bool(Vec::new()),
    }
}

fn append_into(dst: &mut TensorData, src: &TensorData) -> Result<(), ConverterError> {
    match (dst, src) {
        (TensorData::Float32(d), TensorData::Float32(s)) => d.extend_from_slice(s),
        (TensorData::Float64(d), TensorData::Float64(s)) => d.extend_from_slice(s),
        (TensorData::Int32(d), TensorData::Int32(s)) => d.extend_from_slice(s),
        (TensorData::Int64(d), TensorData::Int64(s)) => d.extend_from_slice(s),
        (TensorData::Bool(d), TensorData::Bool(s)) => d.extend_from_slice(s),
        _ => return Err(ConverterError::ShapeMismatch("dtype mismatch while batching".to_string())),
    }
    Ok(())
}

fn slice_rows(data: &TensorData, tail: &[i64], start_row: usize, rows: usize) -> Result<TensorData, ConverterError> {
    let row_len: usize = tail.iter().map(|d| *d as usize).product::<usize>().max(1);
    let start = start_row * row_len;
    let len = rows * row_len;
    macro_rules! slice_variant {
        ($variant:ident, $v:expr) => {{
            if start + len > $v.len() {
                return Err(ConverterError::ShapeMismatch("batch split out of bounds".to_string()));
            }
            TensorData::$variant($v[start..start + len].to_vec())
        }};
    }
    Ok(match data {
        TensorData::Float32(v) => slice_variant!(Float32, v),
        TensorData::Float64(v) => slice_variant!(Float64, v),
        TensorData::Int32(v) => slice_variant!(Int32, v),
        TensorData::Int64(v) => slice_variant!(Int64, v),
        TensorData::Bool(v) => slice_variant!(Bool, v),
    })
}

/// Process-wide name → converter registry. Populated explicitly by the
/// bootstrapper's `Init`; never relies on lazy static initialization.
static REGISTRY: OnceLock<Mutex<HashMap<String, Box<dyn Converter>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Box<dyn Converter>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a converter under `name`, replacing any prior binding.
pub fn register(name: impl Into<String>, converter: Box<dyn Converter>) {
    registry().lock().unwrap().insert(name.into(), converter);
}

/// Obtain a converter by name. Every call returns a fresh clone so mutable
/// per-instance state never aliases across Model entries.
pub fn resolve(name: &str) -> Option<Arc<dyn Converter>> {
    registry().lock().unwrap().get(name).map(|c| Arc::from(c.clone_box()))
}

/// Remove every registered converter. Called by `Engine::shutdown`.
pub fn clear_registry() {
    registry().lock().unwrap().clear();
}
