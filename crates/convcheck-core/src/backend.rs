use anyhow::Result;

use crate::{Device, ModelArtifact, ModelSpec, TensorMap};

#[derive(Clone, Copy, Debug)]
pub struct BackendCapabilities {
    pub supports_f64: bool,
}

/// A runtime that executes converted models.
pub trait Backend: Send + Sync + 'static {
    type Model: BackendModel;

    fn name(&self) -> &'static str;
    fn load(&self, artifact: &ModelArtifact, device: Device) -> Result<Self::Model>;
    fn capabilities(&self) -> BackendCapabilities;
}

pub trait BackendModel: Send + 'static {
    fn spec(&self) -> &ModelSpec;

    /// Runs one inference. Inputs are matched to model inputs by name and
    /// outputs come back keyed by the model's output names.
    fn infer(&mut self, inputs: &TensorMap) -> Result<TensorMap>;
}
