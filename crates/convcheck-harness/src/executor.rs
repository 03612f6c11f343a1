//! Runs one set of inputs through the reference framework and through the
//! converted model on the target runtime.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use candle_core::Tensor as CTensor;
use convcheck_core::{Backend, BackendModel, Device, IOName, ModelArtifact, TensorMap};
use convcheck_onnx::{proto::ModelProto, save_model};
use convcheck_reference::{declared_dtype, from_candle, natural_dtype, to_candle, SdpaModel};
use tracing::debug;

use crate::loader::ModelHandle;

/// Native inference in the reference framework.
pub fn infer_fw_model(handle: &ModelHandle, inputs: &TensorMap) -> Result<TensorMap> {
    match handle {
        ModelHandle::StaticGraph(frozen) => {
            let graph = frozen.graph();
            let mut feed = HashMap::with_capacity(inputs.len());
            for (name, value) in inputs {
                ensure!(
                    graph.inputs().iter().any(|i| &i.name == name),
                    "graph {} has no tensor named `{name}`",
                    frozen.path().display()
                );
                feed.insert(name.0.clone(), to_candle(value, graph.device())?);
            }

            let output_names: Vec<IOName> = graph.outputs().iter().map(|o| o.name.clone()).collect();
            let mut computed = graph.run(feed)?;

            let mut outputs = TensorMap::new();
            for (name, spec) in output_names.into_iter().zip(graph.outputs()) {
                let value = computed
                    .remove(name.as_str())
                    .with_context(|| format!("output `{name}` was not computed"))?;
                outputs.insert(name, unwrap_value(&value, declared_dtype(spec))?);
            }
            Ok(outputs)
        }
        ModelHandle::Callable(signature) => {
            let device = signature.graph().device();
            let constants = inputs
                .iter()
                .map(|(name, value)| Ok((name.0.clone(), to_candle(value, device)?)))
                .collect::<Result<HashMap<_, _>>>()?;

            let declared: HashMap<&str, _> = signature
                .graph()
                .outputs()
                .iter()
                .map(|o| (o.name.as_str(), declared_dtype(o)))
                .collect();

            let mut outputs = TensorMap::new();
            for (name, value) in signature.call(constants)? {
                let want = declared.get(name.as_str()).copied().flatten();
                outputs.insert(IOName(name), unwrap_value(&value, want)?);
            }
            Ok(outputs)
        }
    }
}

fn unwrap_value(value: &CTensor, declared: Option<convcheck_core::DType>) -> Result<convcheck_core::Tensor> {
    let dtype = match declared {
        Some(dtype) => dtype,
        None => natural_dtype(value)?,
    };
    from_candle(value, dtype)
}

/// Something that can be expressed as a static graph for conversion.
pub trait ToGraph {
    fn to_graph(&self) -> Result<ModelProto>;
}

impl ToGraph for ModelHandle {
    fn to_graph(&self) -> Result<ModelProto> {
        Ok(self.model().clone())
    }
}

impl ToGraph for SdpaModel {
    fn to_graph(&self) -> Result<ModelProto> {
        self.lower()
    }
}

/// Produces an artifact the target runtime can load.
pub trait Converter {
    fn name(&self) -> &'static str;
    fn convert(&self, model: &dyn ToGraph, work_dir: &Path, stem: &str) -> Result<ModelArtifact>;
}

/// Serializes the graph into the work directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct GraphExport;

impl Converter for GraphExport {
    fn name(&self) -> &'static str {
        "graph-export"
    }

    fn convert(&self, model: &dyn ToGraph, work_dir: &Path, stem: &str) -> Result<ModelArtifact> {
        let graph = model.to_graph()?;
        let path = work_dir.join(format!("{stem}.onnx"));
        save_model(&graph, &path)?;
        debug!(artifact = %path.display(), "converted model written");
        Ok(ModelArtifact::OnnxPath(path))
    }
}

/// Inference of a converted artifact on the target runtime.
pub fn infer_converted<B: Backend>(
    backend: &B,
    artifact: &ModelArtifact,
    device: Device,
    inputs: &TensorMap,
) -> Result<TensorMap> {
    let mut model = backend
        .load(artifact, device)
        .with_context(|| format!("{} failed to load the converted model", backend.name()))?;
    model
        .infer(inputs)
        .with_context(|| format!("{} inference failed", backend.name()))
}

/// Outputs of the same inputs on both sides.
pub struct DualOutputs {
    pub reference: TensorMap,
    pub target: TensorMap,
}

/// Drives both runtimes for one model and one set of inputs.
pub struct DualRuntimeExecutor<'a, B: Backend, C: Converter> {
    pub backend: &'a B,
    pub converter: &'a C,
    pub device: Device,
    pub work_dir: &'a Path,
}

impl<B: Backend, C: Converter> DualRuntimeExecutor<'_, B, C> {
    pub fn run_handle(&self, handle: &ModelHandle, stem: &str, inputs: &TensorMap) -> Result<DualOutputs> {
        let reference = infer_fw_model(handle, inputs)?;
        let artifact = self.convert(handle, stem)?;
        let target = infer_converted(self.backend, &artifact, self.device.clone(), inputs)?;
        Ok(DualOutputs { reference, target })
    }

    pub fn run_sdpa(&self, model: &SdpaModel, stem: &str, inputs: &TensorMap) -> Result<DualOutputs> {
        let reference = model.forward_named(inputs)?;
        let artifact = self.convert(model, stem)?;
        let target = infer_converted(self.backend, &artifact, self.device.clone(), inputs)?;
        Ok(DualOutputs { reference, target })
    }

    fn convert(&self, model: &dyn ToGraph, stem: &str) -> Result<ModelArtifact> {
        self.converter
            .convert(model, self.work_dir, stem)
            .with_context(|| format!("{} failed to convert `{stem}`", self.converter.name()))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use convcheck_backend_ort::OrtBackend;
    use convcheck_core::DType;
    use convcheck_reference::{build_model, SdpaConfig};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::inputs::InputGenerator;

    struct Rejecting;

    impl Converter for Rejecting {
        fn name(&self) -> &'static str {
            "rejecting"
        }

        fn convert(&self, _: &dyn ToGraph, _: &Path, _: &str) -> Result<ModelArtifact> {
            bail!("unsupported operator")
        }
    }

    #[test]
    fn conversion_errors_name_the_converter() -> Result<()> {
        let config = SdpaConfig::new(false, false, DType::F32);
        let (model, _) = build_model(config, &mut StdRng::seed_from_u64(1))?;
        let inputs = InputGenerator::with_seed(1).attention_inputs(DType::F32)?;
        let dir = tempfile::tempdir()?;
        let backend = OrtBackend::new();
        let executor = DualRuntimeExecutor {
            backend: &backend,
            converter: &Rejecting,
            device: Device::Cpu,
            work_dir: dir.path(),
        };

        let err = executor
            .run_sdpa(&model, "sdpa", &inputs)
            .err()
            .context("conversion succeeded")?;
        assert!(err.to_string().contains("rejecting failed to convert `sdpa`"), "{err}");
        assert_eq!(GraphExport.name(), "graph-export");
        Ok(())
    }
}
