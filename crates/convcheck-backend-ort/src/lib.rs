use std::collections::HashSet;

use anyhow::{bail, ensure, Context, Result};
use convcheck_core::{
    Backend, BackendCapabilities, BackendModel, DType, Device, ElementType, IOName, ModelArtifact,
    ModelSpec, Shape, Tensor, TensorMap, TensorSpec,
};
use ort::{
    session::{builder::SessionBuilder, Session, SessionInputValue},
    tensor::TensorElementType,
    value::{DynValue, ValueType},
};
use tracing::debug;

/// Target runtime: executes converted models with ONNX Runtime.
pub struct OrtBackend;

impl OrtBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OrtBackend {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OrtModel {
    spec: ModelSpec,
    session: Session,
}

impl Backend for OrtBackend {
    type Model = OrtModel;

    fn name(&self) -> &'static str {
        "onnxruntime"
    }

    fn load(&self, artifact: &ModelArtifact, device: Device) -> Result<Self::Model> {
        let builder = Session::builder()
            .context("failed to create ORT session builder")?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .context("failed to configure ORT session builder")?;

        let builder = configure_session_builder(builder, &device)?;

        let session = match artifact {
            ModelArtifact::OnnxPath(path) => builder
                .commit_from_file(path)
                .with_context(|| format!("failed to load ONNX model {}", path.display()))?,
            ModelArtifact::OnnxBytes(bytes) => builder
                .commit_from_memory(bytes)
                .context("failed to load in-memory ONNX model")?,
        };

        let spec = build_model_spec(&session)?;
        debug!(
            inputs = spec.inputs.len(),
            outputs = spec.outputs.len(),
            %device,
            "ORT session ready"
        );

        Ok(OrtModel { spec, session })
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_f64: true,
        }
    }
}

impl BackendModel for OrtModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn infer(&mut self, inputs: &TensorMap) -> Result<TensorMap> {
        let declared: HashSet<&str> = self.spec.inputs.iter().map(|i| i.name.as_str()).collect();
        for name in inputs.keys() {
            ensure!(
                declared.contains(name.as_str()),
                "model has no input named `{name}`"
            );
        }

        let mut ort_inputs = Vec::with_capacity(inputs.len());
        for input in &self.spec.inputs {
            let tensor = inputs
                .get(&input.name)
                .with_context(|| format!("missing input `{}`", input.name))?;
            let value = tensor_to_ort_value(tensor)?;
            ort_inputs.push((input.name.0.clone(), SessionInputValue::from(value)));
        }

        let outputs = self.session.run(ort_inputs)?;
        let mut out_tensors = TensorMap::new();
        for (name, value) in outputs.iter() {
            out_tensors.insert(IOName(name.to_string()), ort_value_to_tensor(&value)?);
        }

        Ok(out_tensors)
    }
}

fn build_model_spec(session: &Session) -> Result<ModelSpec> {
    let inputs = session
        .inputs
        .iter()
        .map(|input| tensor_spec_from_value_type(&input.name, &input.input_type))
        .collect::<Result<Vec<_>>>()?;

    let outputs = session
        .outputs
        .iter()
        .map(|output| tensor_spec_from_value_type(&output.name, &output.output_type))
        .collect::<Result<Vec<_>>>()?;

    Ok(ModelSpec { inputs, outputs })
}

fn configure_session_builder(builder: SessionBuilder, device: &Device) -> Result<SessionBuilder> {
    match device {
        Device::Cpu => Ok(builder),
        Device::Cuda { device_id } => configure_cuda(builder, *device_id),
    }
}

fn configure_cuda(builder: SessionBuilder, device_id: u32) -> Result<SessionBuilder> {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::cuda::CUDAExecutionProvider;
        let ep = CUDAExecutionProvider::default()
            .with_device_id(device_id as i32)
            .build();
        builder
            .with_execution_providers([ep])
            .context("failed to enable ORT CUDA execution provider")
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = (builder, device_id);
        bail!("CUDA requested but convcheck-backend-ort was built without the `cuda` feature")
    }
}

fn tensor_spec_from_value_type(name: &str, value_type: &ValueType) -> Result<TensorSpec> {
    let ValueType::Tensor { ty, shape, .. } = value_type else {
        bail!("unsupported non-tensor IO value type for `{name}`");
    };

    let elem = match ort_tensor_element_to_dtype(*ty) {
        Some(dtype) => ElementType::Known(dtype),
        None => ElementType::Other(*ty as i32),
    };
    let dims = shape
        .iter()
        .map(|d| if *d < 0 { None } else { Some(*d as usize) })
        .collect::<Vec<_>>();

    Ok(TensorSpec {
        name: IOName(name.to_string()),
        elem,
        dims: Some(dims),
        bound: false,
    })
}

fn ort_tensor_element_to_dtype(ty: TensorElementType) -> Option<DType> {
    match ty {
        TensorElementType::Float32 => Some(DType::F32),
        TensorElementType::Float64 => Some(DType::F64),
        TensorElementType::Float16 => Some(DType::F16),
        TensorElementType::Int64 => Some(DType::I64),
        TensorElementType::Int32 => Some(DType::I32),
        TensorElementType::Uint8 => Some(DType::U8),
        TensorElementType::Bool => Some(DType::Bool),
        _ => None,
    }
}

fn tensor_to_ort_value(tensor: &Tensor) -> Result<DynValue> {
    let shape: Vec<usize> = tensor.shape().dims().to_vec();

    let value = match tensor.dtype() {
        DType::F32 => ort::value::Tensor::from_array((shape, tensor.to_vec::<f32>()?))?.into_dyn(),
        DType::F64 => ort::value::Tensor::from_array((shape, tensor.to_vec::<f64>()?))?.into_dyn(),
        DType::I64 => ort::value::Tensor::from_array((shape, tensor.to_vec::<i64>()?))?.into_dyn(),
        DType::I32 => ort::value::Tensor::from_array((shape, tensor.to_vec::<i32>()?))?.into_dyn(),
        DType::U8 => ort::value::Tensor::from_array((shape, tensor.bytes.to_vec()))?.into_dyn(),
        DType::Bool => {
            let data: Vec<bool> = tensor.bytes.iter().map(|b| *b != 0).collect();
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::F16 => bail!("f16 inputs are not supported yet"),
    };

    Ok(value)
}

fn ort_value_to_tensor(value: &ort::value::ValueRef<'_>) -> Result<Tensor> {
    let ValueType::Tensor { ty, shape, .. } = value.dtype() else {
        bail!("non-tensor outputs are not supported");
    };

    let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
    let shape = Shape::from_slice(&dims);

    match *ty {
        TensorElementType::Float32 => Tensor::from_vec(shape, extract::<f32>(value)?),
        TensorElementType::Float64 => Tensor::from_vec(shape, extract::<f64>(value)?),
        TensorElementType::Int64 => Tensor::from_vec(shape, extract::<i64>(value)?),
        TensorElementType::Int32 => Tensor::from_vec(shape, extract::<i32>(value)?),
        TensorElementType::Uint8 => Tensor::from_vec(shape, extract::<u8>(value)?),
        TensorElementType::Bool => Tensor::from_bools(shape, extract::<bool>(value)?),
        TensorElementType::Float16 => bail!("f16 outputs are not supported yet"),
        _ => bail!("unsupported output tensor element type: {ty}"),
    }
}

fn extract<T>(value: &ort::value::ValueRef<'_>) -> Result<Vec<T>>
where
    T: ort::tensor::PrimitiveTensorElementType + Clone + std::fmt::Debug + 'static,
{
    let array = value.try_extract_array::<T>()?;
    Ok(match array.as_slice() {
        Some(slice) => slice.to_vec(),
        None => array.iter().cloned().collect(),
    })
}
