//! Immutable post-startup model tuple.

use std::sync::Arc;

use crate::batcher::Batcher;
use crate::converter::Converter;
use crate::inferer::Inferer;

/// `{name, version, converter?, inferer, batcher?}`, immutable after
/// bootstrap.
pub struct Model {
    /// Model name (without version).
    pub name: String,
    /// Model version.
    pub version: String,
    /// Optional converter bridging wire messages to tensors.
    pub converter: Option<Arc<dyn Converter>>,
    /// The inferer that actually runs the model.
    pub inferer: Arc<dyn Inferer>,
    /// Optional batcher; when absent, requests route through inline.
    pub batcher: Option<Arc<Batcher>>,
}

impl Model {
    /// The fully-qualified registry key: `name-version`.
    pub fn key(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}
