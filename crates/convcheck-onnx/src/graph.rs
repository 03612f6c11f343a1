use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use convcheck_core::{DType, ElementType, IOName, Shape, Tensor, TensorSpec};
use prost::Message;

use crate::proto::{
    attribute_proto::AttributeType, tensor_proto::DataType, tensor_shape_proto::dimension,
    tensor_shape_proto::Dimension, type_proto, AttributeProto, GraphProto, ModelProto, NodeProto,
    OperatorSetIdProto, TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
};

pub const IR_VERSION: i64 = 8;
pub const DEFAULT_OPSET: i64 = 17;

pub fn load_model(path: &Path) -> Result<ModelProto> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read graph file {}", path.display()))?;
    decode_model(&bytes).with_context(|| format!("failed to decode {}", path.display()))
}

pub fn decode_model(bytes: &[u8]) -> Result<ModelProto> {
    let model = ModelProto::decode(bytes).context("invalid model protobuf")?;
    ensure!(model.graph.is_some(), "model has no graph");
    Ok(model)
}

pub fn encode_model(model: &ModelProto) -> Bytes {
    Bytes::from(model.encode_to_vec())
}

pub fn save_model(model: &ModelProto, path: &Path) -> Result<()> {
    std::fs::write(path, model.encode_to_vec())
        .with_context(|| format!("failed to write graph file {}", path.display()))
}

pub fn graph(model: &ModelProto) -> Result<&GraphProto> {
    model.graph.as_ref().context("model has no graph")
}

pub fn elem_from_code(code: i32) -> ElementType {
    match DataType::try_from(code) {
        Ok(DataType::Float) => ElementType::Known(DType::F32),
        Ok(DataType::Double) => ElementType::Known(DType::F64),
        Ok(DataType::Float16) => ElementType::Known(DType::F16),
        Ok(DataType::Int64) => ElementType::Known(DType::I64),
        Ok(DataType::Int32) => ElementType::Known(DType::I32),
        Ok(DataType::Uint8) => ElementType::Known(DType::U8),
        Ok(DataType::Bool) => ElementType::Known(DType::Bool),
        _ => ElementType::Other(code),
    }
}

pub fn code_from_dtype(dtype: DType) -> i32 {
    let ty = match dtype {
        DType::F32 => DataType::Float,
        DType::F64 => DataType::Double,
        DType::F16 => DataType::Float16,
        DType::I64 => DataType::Int64,
        DType::I32 => DataType::Int32,
        DType::U8 => DataType::Uint8,
        DType::Bool => DataType::Bool,
    };
    ty as i32
}

fn tensor_spec(info: &ValueInfoProto, bound: bool) -> TensorSpec {
    let tensor_type = match info.r#type.as_ref().and_then(|t| t.value.as_ref()) {
        Some(type_proto::Value::TensorType(t)) => Some(t),
        None => None,
    };

    let elem = tensor_type.map_or(ElementType::Other(0), |t| elem_from_code(t.elem_type));
    let dims = tensor_type.and_then(|t| t.shape.as_ref()).map(|shape| {
        shape
            .dim
            .iter()
            .map(|d| match d.value {
                Some(dimension::Value::DimValue(v)) if v >= 0 => Some(v as usize),
                _ => None,
            })
            .collect()
    });

    TensorSpec {
        name: IOName(info.name.clone()),
        elem,
        dims,
        bound,
    }
}

/// Declared graph inputs. Inputs that also appear as initializers are
/// variables with stored values and are marked as bound.
pub fn input_signature(graph: &GraphProto) -> Vec<TensorSpec> {
    let initializers: HashSet<&str> = graph.initializer.iter().map(|t| t.name.as_str()).collect();
    graph
        .input
        .iter()
        .map(|info| tensor_spec(info, initializers.contains(info.name.as_str())))
        .collect()
}

pub fn output_signature(graph: &GraphProto) -> Vec<TensorSpec> {
    graph.output.iter().map(|info| tensor_spec(info, false)).collect()
}

fn proto_dims(proto: &TensorProto) -> Result<Shape> {
    let dims = proto
        .dims
        .iter()
        .map(|d| usize::try_from(*d).with_context(|| format!("negative dim in `{}`", proto.name)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Shape::from_slice(&dims))
}

/// Decodes a stored tensor, from either raw little-endian data or the typed fields.
pub fn tensor_from_proto(proto: &TensorProto) -> Result<Tensor> {
    let shape = proto_dims(proto)?;
    let ElementType::Known(dtype) = elem_from_code(proto.data_type) else {
        bail!("tensor `{}` has unsupported data type {}", proto.name, proto.data_type);
    };

    if !proto.raw_data.is_empty() {
        return Tensor::from_cpu_bytes(dtype, shape, Bytes::copy_from_slice(&proto.raw_data))
            .with_context(|| format!("bad raw data in `{}`", proto.name));
    }

    let tensor = match dtype {
        DType::F32 => Tensor::from_vec(shape, proto.float_data.clone()),
        DType::F64 => Tensor::from_vec(shape, proto.double_data.clone()),
        DType::I64 => Tensor::from_vec(shape, proto.int64_data.clone()),
        DType::I32 => Tensor::from_vec(shape, proto.int32_data.clone()),
        DType::U8 => Tensor::from_vec(shape, proto.int32_data.iter().map(|v| *v as u8).collect()),
        DType::Bool => Tensor::from_bools(shape, proto.int32_data.iter().map(|v| *v != 0).collect()),
        DType::F16 => bail!("f16 tensor `{}` is not supported yet", proto.name),
    };
    tensor.with_context(|| format!("bad typed data in `{}`", proto.name))
}

pub fn tensor_to_proto(name: &str, tensor: &Tensor) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        dims: tensor.shape().dims().iter().map(|d| *d as i64).collect(),
        data_type: code_from_dtype(tensor.dtype()),
        raw_data: tensor.bytes.to_vec(),
        ..Default::default()
    }
}

pub fn attr_int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Int as i32,
        i: value,
        ..Default::default()
    }
}

pub fn attr_ints(name: &str, values: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Ints as i32,
        ints: values.to_vec(),
        ..Default::default()
    }
}

pub fn attr_float(name: &str, value: f32) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Float as i32,
        f: value,
        ..Default::default()
    }
}

/// Incrementally assembles a single-graph model.
pub struct GraphBuilder {
    graph: GraphProto,
    opset: i64,
}

impl GraphBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            graph: GraphProto {
                name: name.to_string(),
                ..Default::default()
            },
            opset: DEFAULT_OPSET,
        }
    }

    /// Default-domain operator set recorded in the model.
    pub fn opset(&mut self, version: i64) -> &mut Self {
        self.opset = version;
        self
    }

    fn value_info(name: &str, dtype: DType, dims: &[usize]) -> ValueInfoProto {
        let dim = dims
            .iter()
            .map(|d| Dimension {
                value: Some(dimension::Value::DimValue(*d as i64)),
                ..Default::default()
            })
            .collect();
        ValueInfoProto {
            name: name.to_string(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: code_from_dtype(dtype),
                    shape: Some(TensorShapeProto { dim }),
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn input(&mut self, name: &str, dtype: DType, dims: &[usize]) -> &mut Self {
        self.graph.input.push(Self::value_info(name, dtype, dims));
        self
    }

    pub fn output(&mut self, name: &str, dtype: DType, dims: &[usize]) -> &mut Self {
        self.graph.output.push(Self::value_info(name, dtype, dims));
        self
    }

    pub fn initializer(&mut self, name: &str, tensor: &Tensor) -> &mut Self {
        self.graph.initializer.push(tensor_to_proto(name, tensor));
        self
    }

    pub fn node(
        &mut self,
        op_type: &str,
        inputs: &[&str],
        outputs: &[&str],
        attribute: Vec<AttributeProto>,
    ) -> &mut Self {
        let name = format!("{}_{}", op_type, self.graph.node.len());
        self.graph.node.push(NodeProto {
            name,
            op_type: op_type.to_string(),
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: outputs.iter().map(|s| s.to_string()).collect(),
            attribute,
            ..Default::default()
        });
        self
    }

    pub fn finish(self, producer: &str) -> ModelProto {
        ModelProto {
            ir_version: IR_VERSION,
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: self.opset,
            }],
            producer_name: producer.to_string(),
            graph: Some(self.graph),
            ..Default::default()
        }
    }
}
