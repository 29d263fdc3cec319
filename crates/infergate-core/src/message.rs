//! Wire payload types shared by every stage of the pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Supported tensor element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    /// 32-bit IEEE float.
    Float32,
    /// 64-bit IEEE float.
    Float64,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// Boolean.
    Bool,
}

/// A typed flat payload, exactly one variant of which is populated for a
/// given [`GenericTensor`] — the dtype tag and the payload variant always
/// agree by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorData {
    /// `DType::Float32` payload.
    Float32(Vec<f32>),
    /// `DType::Float64` payload.
    Float64(Vec<f64>),
    /// `DType::Int32` payload.
    Int32(Vec<i32>),
    /// `DType::Int64` payload.
    Int64(Vec<i64>),
    /// `DType::Bool` payload.
    Bool(Vec<bool>),
}

impl TensorData {
    /// Number of elements in the flat payload.
    pub fn len(&self) -> usize {
        match self {
            TensorData::Float32(v) => v.len(),
            TensorData::Float64(v) => v.len(),
            TensorData::Int32(v) => v.len(),
            TensorData::Int64(v) => v.len(),
            TensorData::Bool(v) => v.len(),
        }
    }

    /// Whether the flat payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The dtype this payload corresponds to.
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::Float32(_) => DType::Float32,
            TensorData::Float64(_) => DType::Float64,
            TensorData::Int32(_) => DType::Int32,
            TensorData::Int64(_) => DType::Int64,
            TensorData::Bool(_) => DType::Bool,
        }
    }
}

/// A generic tensor: shape + dtype + one typed flat payload, with an
/// optional name used to bind it to a model's input/output slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericTensor {
    /// Binding name. If any tensor in a list carries a name, all must.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Ordered shape, signed to allow `-1` wildcard dimensions upstream.
    pub shape: Vec<i64>,
    /// Flat payload; its variant determines `dtype()`.
    pub data: TensorData,
}

impl GenericTensor {
    /// Construct a new tensor, inferring `dtype` from the payload.
    pub fn new(name: Option<String>, shape: Vec<i64>, data: TensorData) -> Self {
        Self { name, shape, data }
    }

    /// The dtype of this tensor's payload.
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Shape excluding the leading (batch) axis.
    pub fn shape_tail(&self) -> &[i64] {
        self.shape.get(1..).unwrap_or(&[])
    }
}

/// The wire payload: a tagged union of string, binary, tensor list, or map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenericMessage {
    /// Plain UTF-8 string payload (`str_data`).
    Str(String),
    /// Raw binary payload (`bin_data`).
    Bin(Vec<u8>),
    /// A list of generic tensors (`gtensors`).
    Tensors(Vec<GenericTensor>),
    /// A string-keyed map of nested messages (`gmap`).
    Map(BTreeMap<String, GenericMessage>),
}

impl GenericMessage {
    /// True if this message's payload is binary.
    pub fn is_binary(&self) -> bool {
        matches!(self, GenericMessage::Bin(_))
    }

    /// Convenience constructor for a single unnamed float32 tensor.
    pub fn from_float32_tensor(shape: Vec<i64>, data: Vec<f32>) -> Self {
        GenericMessage::Tensors(vec![GenericTensor::new(None, shape, TensorData::Float32(data))])
    }
}

/// Parses the three accepted JSON request shapes from §6: canonical,
/// `{ndarray: ...}`, and the rejected `{bin_data: ...}` form.
pub fn parse_canonical_json(value: &serde_json::Value) -> Result<GenericMessage, String> {
    use crate::error::RequestShapeError;

    if let Some(obj) = value.as_object() {
        if obj.contains_key("bin_data") {
            return Err(RequestShapeError::Other(
                "bin_data must be sent via application/octet-stream, not JSON".to_string(),
            )
            .to_string());
        }
        if let Some(s) = obj.get("str_data").and_then(|v| v.as_str()) {
            return Ok(GenericMessage::Str(s.to_string()));
        }
        if let Some(nd) = obj.get("ndarray") {
            return ndarray_to_tensor(nd).map_err(|e| e.to_string());
        }
        if obj.contains_key("gtensors") || obj.contains_key("gmap") {
            return serde_json::from_value(value.clone())
                .map_err(|e| format!("Bad Request, err: {e}"));
        }
    }
    Err(RequestShapeError::NoLegalMember.to_string())
}

fn ndarray_to_tensor(value: &serde_json::Value) -> Result<GenericMessage, String> {
    let mut shape = Vec::new();
    let mut flat = Vec::new();
    infer_shape(value, 0, &mut shape)?;
    flatten(value, &mut flat)?;
    Ok(GenericMessage::from_float32_tensor(shape, flat))
}

fn infer_shape(value: &serde_json::Value, depth: usize, shape: &mut Vec<i64>) -> Result<(), String> {
    match value {
        serde_json::Value::Array(items) => {
            if shape.len() == depth {
                shape.push(items.len() as i64);
            }
            for item in items {
                infer_shape(item, depth + 1, shape)?;
            }
            Ok(())
        }
        serde_json::Value::Number(_) => Ok(()),
        _ => Err("ndarray must contain only numbers and nested arrays".to_string()),
    }
}

fn flatten(value: &serde_json::Value, out: &mut Vec<f32>) -> Result<(), String> {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                flatten(item, out)?;
            }
            Ok(())
        }
        serde_json::Value::Number(n) => {
            out.push(n.as_f64().ok_or("invalid number in ndarray")? as f32);
            Ok(())
        }
        _ => Err("ndarray must contain only numbers and nested arrays".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_data_round_trips() {
        let v: serde_json::Value = serde_json::json!({"str_data": "hello"});
        let msg = parse_canonical_json(&v).unwrap();
        assert_eq!(msg, GenericMessage::Str("hello".to_string()));
    }

    #[test]
    fn ndarray_infers_rectangular_shape() {
        let v: serde_json::Value = serde_json::json!({"ndarray": [[1, 2, 3]]});
        let msg = parse_canonical_json(&v).unwrap();
        match msg {
            GenericMessage::Tensors(tensors) => {
                assert_eq!(tensors.len(), 1);
                assert_eq!(tensors[0].shape, vec![1, 3]);
                assert_eq!(tensors[0].data, TensorData::Float32(vec![1.0, 2.0, 3.0]));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn bin_data_in_json_is_rejected() {
        let v: serde_json::Value = serde_json::json!({"bin_data": "xx"});
        assert!(parse_canonical_json(&v).is_err());
    }

    #[test]
    fn nonsense_body_has_no_legal_member() {
        let v: serde_json::Value = serde_json::json!({"nonsense": 1});
        let err = parse_canonical_json(&v).unwrap_err();
        assert!(err.contains("Have no legal member in json body"));
    }
}
