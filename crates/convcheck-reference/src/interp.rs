//! A small candle-backed interpreter for static graphs.
//!
//! Covers the operator set found in the classification and encoder models the
//! conversion suites exercise. Nodes are executed in file order, which the
//! format guarantees to be topological.

use std::collections::HashMap;

use anyhow::{bail, ensure, Context, Result};
use candle_core::{DType as CDType, Device, Tensor};
use convcheck_core::{DType, ElementType, TensorSpec};
use convcheck_onnx::proto::{AttributeProto, GraphProto, ModelProto, NodeProto};
use convcheck_onnx::{
    elem_from_code, input_signature, output_signature, tensor_from_proto, DEFAULT_OPSET,
};
use tracing::trace;

use crate::convert::{candle_dtype, to_candle};

/// A decoded graph with its stored weights materialized on the reference device.
pub struct ReferenceGraph {
    graph: GraphProto,
    weights: HashMap<String, Tensor>,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    opset: i64,
    device: Device,
}

impl ReferenceGraph {
    pub fn new(model: &ModelProto) -> Result<Self> {
        let graph = model.graph.clone().context("model has no graph")?;
        let device = Device::Cpu;

        let mut weights = HashMap::with_capacity(graph.initializer.len());
        for init in &graph.initializer {
            let tensor = tensor_from_proto(init)?;
            weights.insert(init.name.clone(), to_candle(&tensor, &device)?);
        }

        let opset = model
            .opset_import
            .iter()
            .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
            .map_or(DEFAULT_OPSET, |o| o.version);

        let inputs = input_signature(&graph);
        let outputs = output_signature(&graph);
        Ok(Self {
            graph,
            weights,
            inputs,
            outputs,
            opset,
            device,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    /// Runs the graph once. Every feed must name a declared, unbound input and
    /// every declared, unbound input must be fed.
    pub fn run(&self, feeds: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        for name in feeds.keys() {
            ensure!(
                self.inputs.iter().any(|i| i.name.as_str() == name),
                "graph `{}` has no input named `{name}`",
                self.graph.name
            );
        }
        for input in self.inputs.iter().filter(|i| !i.bound) {
            ensure!(
                feeds.contains_key(input.name.as_str()),
                "missing feed for input `{}`",
                input.name
            );
        }

        let mut values: HashMap<String, Tensor> = self.weights.clone();
        values.extend(feeds);

        for node in &self.graph.node {
            trace!(op = %node.op_type, name = %node.name, "executing node");
            let args = node
                .input
                .iter()
                .map(|name| {
                    if name.is_empty() {
                        Ok(None)
                    } else {
                        values
                            .get(name)
                            .cloned()
                            .map(Some)
                            .with_context(|| format!("value `{name}` is not computed yet"))
                    }
                })
                .collect::<Result<Vec<_>>>()?;

            let results = eval_node(node, &args, self.opset, &self.device)
                .with_context(|| format!("node `{}` ({}) failed", node.name, node.op_type))?;
            ensure!(
                results.len() >= node.output.len(),
                "{} produced {} values for {} outputs",
                node.op_type,
                results.len(),
                node.output.len()
            );
            for (name, value) in node.output.iter().zip(results) {
                values.insert(name.clone(), value);
            }
        }

        self.outputs
            .iter()
            .map(|o| {
                let value = values
                    .remove(o.name.as_str())
                    .with_context(|| format!("graph output `{}` was never produced", o.name))?;
                Ok((o.name.0.clone(), value))
            })
            .collect()
    }
}

fn attr<'a>(node: &'a NodeProto, name: &str) -> Option<&'a AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

fn attr_i(node: &NodeProto, name: &str, default: i64) -> i64 {
    attr(node, name).map_or(default, |a| a.i)
}

fn attr_f(node: &NodeProto, name: &str, default: f32) -> f32 {
    attr(node, name).map_or(default, |a| a.f)
}

fn attr_ints(node: &NodeProto, name: &str) -> Option<Vec<i64>> {
    attr(node, name).map(|a| a.ints.clone())
}

fn arg<'a>(args: &'a [Option<Tensor>], idx: usize, op: &str) -> Result<&'a Tensor> {
    args.get(idx)
        .and_then(Option::as_ref)
        .with_context(|| format!("{op} expects input #{idx}"))
}

fn axis(axis: i64, rank: usize) -> Result<usize> {
    let rank = rank as i64;
    let resolved = if axis < 0 { axis + rank } else { axis };
    ensure!((0..rank.max(1)).contains(&resolved), "axis {axis} out of range for rank {rank}");
    Ok(resolved as usize)
}

fn int_values(t: &Tensor) -> Result<Vec<i64>> {
    Ok(t.to_dtype(CDType::I64)?.flatten_all()?.to_vec1::<i64>()?)
}

/// Integer axes given either as an attribute (older opsets) or as the second input.
fn axes_arg(node: &NodeProto, args: &[Option<Tensor>]) -> Result<Option<Vec<i64>>> {
    if let Some(axes) = attr_ints(node, "axes") {
        return Ok(Some(axes));
    }
    match args.get(1).and_then(Option::as_ref) {
        Some(t) => Ok(Some(int_values(t)?)),
        None => Ok(None),
    }
}

fn eval_node(
    node: &NodeProto,
    args: &[Option<Tensor>],
    opset: i64,
    device: &Device,
) -> Result<Vec<Tensor>> {
    let op = node.op_type.as_str();
    let x = || arg(args, 0, op);
    let y = || arg(args, 1, op);

    let out = match op {
        "Identity" => x()?.clone(),
        "Constant" => {
            let value = attr(node, "value")
                .and_then(|a| a.t.as_ref())
                .context("Constant without a tensor `value`")?;
            to_candle(&tensor_from_proto(value)?, device)?
        }
        "Cast" => {
            let to = attr_i(node, "to", 0) as i32;
            let ElementType::Known(dtype) = elem_from_code(to) else {
                bail!("Cast to unsupported element type {to}");
            };
            x()?.to_dtype(candle_dtype(dtype)?)?
        }
        "Add" => x()?.broadcast_add(y()?)?,
        "Sub" => x()?.broadcast_sub(y()?)?,
        "Mul" => x()?.broadcast_mul(y()?)?,
        "Div" => x()?.broadcast_div(y()?)?,
        "Pow" => {
            let exp = y()?.to_dtype(x()?.dtype())?;
            x()?.broadcast_pow(&exp)?
        }
        "MatMul" => x()?.broadcast_matmul(y()?)?,
        "Gemm" => gemm(node, args)?,
        "Relu" => x()?.relu()?,
        "Sigmoid" => candle_nn::ops::sigmoid(x()?)?,
        "Tanh" => x()?.tanh()?,
        "Exp" => x()?.exp()?,
        "Sqrt" => x()?.sqrt()?,
        "Neg" => x()?.neg()?,
        "Erf" => x()?.erf()?,
        // Before opset 13 the input is coerced to 2D at `axis` and each row is normalized.
        "Softmax" if opset < 13 => {
            let t = x()?;
            let dim = axis(attr_i(node, "axis", 1), t.rank())?;
            let rows: usize = t.dims()[..dim].iter().product();
            let cols: usize = t.dims()[dim..].iter().product();
            candle_nn::ops::softmax(&t.reshape((rows, cols))?, 1)?.reshape(t.dims())?
        }
        "Softmax" => {
            let t = x()?;
            let dim = axis(attr_i(node, "axis", -1), t.rank())?;
            candle_nn::ops::softmax(t, dim)?
        }
        "Transpose" => {
            let t = x()?;
            let perm = match attr_ints(node, "perm") {
                Some(perm) => perm
                    .iter()
                    .map(|p| axis(*p, t.rank()))
                    .collect::<Result<Vec<_>>>()?,
                None => (0..t.rank()).rev().collect(),
            };
            t.permute(perm)?.contiguous()?
        }
        "Reshape" => {
            let t = x()?;
            let target = int_values(y()?)?;
            t.reshape(reshape_dims(t.dims(), &target)?)?
        }
        "Flatten" => {
            let t = x()?;
            let raw = attr_i(node, "axis", 1);
            let split = if raw < 0 { raw + t.rank() as i64 } else { raw };
            ensure!((0..=t.rank() as i64).contains(&split), "Flatten axis {raw} out of range");
            let split = split as usize;
            let outer: usize = t.dims()[..split].iter().product();
            let inner: usize = t.dims()[split..].iter().product();
            t.reshape((outer, inner))?
        }
        "Unsqueeze" => {
            let t = x()?;
            let axes = axes_arg(node, args)?.context("Unsqueeze without axes")?;
            let out_rank = t.rank() + axes.len();
            let mut axes = axes
                .iter()
                .map(|a| axis(*a, out_rank))
                .collect::<Result<Vec<_>>>()?;
            axes.sort_unstable();
            let mut t = t.clone();
            for a in axes {
                t = t.unsqueeze(a)?;
            }
            t
        }
        "Squeeze" => {
            let t = x()?;
            let axes = match axes_arg(node, args)? {
                Some(axes) => axes
                    .iter()
                    .map(|a| axis(*a, t.rank()))
                    .collect::<Result<Vec<_>>>()?,
                None => (0..t.rank()).filter(|d| t.dims()[*d] == 1).collect(),
            };
            let dims: Vec<usize> = t
                .dims()
                .iter()
                .enumerate()
                .filter(|(i, _)| !axes.contains(i))
                .map(|(_, d)| *d)
                .collect();
            t.reshape(dims)?
        }
        "Concat" => {
            let parts: Vec<&Tensor> = args.iter().flatten().collect();
            let first = parts.first().context("Concat without inputs")?;
            let dim = axis(attr_i(node, "axis", 0), first.rank())?;
            Tensor::cat(&parts, dim)?
        }
        "ReduceMean" => {
            let t = x()?;
            let axes = match axes_arg(node, args)? {
                Some(axes) => axes
                    .iter()
                    .map(|a| axis(*a, t.rank()))
                    .collect::<Result<Vec<_>>>()?,
                None => (0..t.rank()).collect(),
            };
            let mut out = t.clone();
            for a in &axes {
                out = out.mean_keepdim(*a)?;
            }
            if attr_i(node, "keepdims", 1) == 0 {
                let dims: Vec<usize> = out
                    .dims()
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !axes.contains(i))
                    .map(|(_, d)| *d)
                    .collect();
                out = out.reshape(dims)?;
            }
            out
        }
        "Gather" => {
            let data = x()?;
            let indices = y()?;
            ensure!(data.rank() > 0, "Gather on a scalar");
            let dim = axis(attr_i(node, "axis", 0), data.rank())?;
            let extent = data.dims()[dim] as i64;
            let flat: Vec<i64> = int_values(indices)?
                .into_iter()
                .map(|i| if i < 0 { i + extent } else { i })
                .collect();
            let idx = Tensor::from_vec(flat, indices.elem_count(), device)?;
            let picked = data.index_select(&idx, dim)?;
            let mut dims = data.dims()[..dim].to_vec();
            dims.extend_from_slice(indices.dims());
            dims.extend_from_slice(&data.dims()[dim + 1..]);
            picked.reshape(dims)?
        }
        "Where" => {
            let cond = x()?.to_dtype(CDType::U8)?;
            let on_true = y()?;
            let on_false = arg(args, 2, op)?;
            let shape = broadcast_dims(&[cond.dims(), on_true.dims(), on_false.dims()])?;
            cond.broadcast_as(shape.clone())?
                .where_cond(&on_true.broadcast_as(shape.clone())?, &on_false.broadcast_as(shape)?)?
        }
        other => bail!("operator `{other}` is not supported by the reference runtime"),
    };
    Ok(vec![out])
}

fn gemm(node: &NodeProto, args: &[Option<Tensor>]) -> Result<Tensor> {
    let mut a = arg(args, 0, "Gemm")?.clone();
    let mut b = arg(args, 1, "Gemm")?.clone();
    if attr_i(node, "transA", 0) != 0 {
        a = a.t()?;
    }
    if attr_i(node, "transB", 0) != 0 {
        b = b.t()?;
    }
    let alpha = f64::from(attr_f(node, "alpha", 1.0));
    let beta = f64::from(attr_f(node, "beta", 1.0));

    let mut out = a.matmul(&b)?.affine(alpha, 0.0)?;
    if let Some(c) = args.get(2).and_then(Option::as_ref) {
        out = out.broadcast_add(&c.affine(beta, 0.0)?)?;
    }
    Ok(out)
}

/// Applies the reshape conventions: `0` copies the input dim, `-1` is inferred.
fn reshape_dims(input: &[usize], target: &[i64]) -> Result<Vec<usize>> {
    let total: usize = input.iter().product();
    let mut dims = Vec::with_capacity(target.len());
    let mut inferred = None;
    for (i, d) in target.iter().enumerate() {
        match *d {
            0 => dims.push(*input.get(i).context("reshape copies a missing dim")?),
            -1 => {
                ensure!(inferred.is_none(), "reshape with more than one -1");
                inferred = Some(i);
                dims.push(1);
            }
            d if d > 0 => dims.push(d as usize),
            d => bail!("invalid reshape dim {d}"),
        }
    }
    if let Some(i) = inferred {
        let known: usize = dims.iter().product();
        ensure!(known > 0 && total % known == 0, "cannot infer reshape dim");
        dims[i] = total / known;
    }
    Ok(dims)
}

fn broadcast_dims(shapes: &[&[usize]]) -> Result<Vec<usize>> {
    let rank = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut out = vec![1usize; rank];
    for shape in shapes {
        let offset = rank - shape.len();
        for (i, d) in shape.iter().enumerate() {
            let slot = &mut out[offset + i];
            if *slot == 1 {
                *slot = *d;
            } else {
                ensure!(*d == 1 || *d == *slot, "shapes {shapes:?} do not broadcast");
            }
        }
    }
    Ok(out)
}

/// Declared dtype for each output, when the graph states one.
pub fn declared_dtype(spec: &TensorSpec) -> Option<DType> {
    match spec.elem {
        ElementType::Known(dtype) => Some(dtype),
        ElementType::Other(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use convcheck_onnx::{attr_int, GraphBuilder};

    use super::*;

    #[test]
    fn reshape_handles_copy_and_infer() -> Result<()> {
        assert_eq!(reshape_dims(&[2, 3, 4], &[0, -1])?, vec![2, 12]);
        assert_eq!(reshape_dims(&[2, 3, 4], &[4, 6])?, vec![4, 6]);
        assert!(reshape_dims(&[2, 3], &[-1, -1]).is_err());
        Ok(())
    }

    #[test]
    fn broadcast_follows_numpy_rules() -> Result<()> {
        assert_eq!(broadcast_dims(&[&[8, 8], &[1, 2, 8, 8], &[1]])?, vec![1, 2, 8, 8]);
        assert!(broadcast_dims(&[&[3], &[4]]).is_err());
        Ok(())
    }

    fn softmax_model(opset: i64) -> ModelProto {
        let mut b = GraphBuilder::new("softmax");
        b.opset(opset)
            .input("x", DType::F32, &[2, 2, 3])
            .node("Softmax", &["x"], &["y"], vec![attr_int("axis", 1)])
            .output("y", DType::F32, &[2, 2, 3]);
        b.finish("interp-test")
    }

    fn run_softmax(opset: i64) -> Result<Vec<Vec<f32>>> {
        let graph = ReferenceGraph::new(&softmax_model(opset))?;
        let x = Tensor::arange(0f32, 12., &Device::Cpu)?.reshape((2, 2, 3))?;
        let mut out = graph.run(HashMap::from([("x".to_string(), x)]))?;
        let y = out.remove("y").context("no output")?;
        Ok(y.reshape((2, 6))?.to_vec2::<f32>()?)
    }

    #[test]
    fn legacy_softmax_normalizes_flattened_rows() -> Result<()> {
        for row in run_softmax(11)? {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5, "{row:?}");
        }
        Ok(())
    }

    #[test]
    fn softmax_normalizes_single_axis() -> Result<()> {
        for row in run_softmax(13)? {
            // Each flattened row holds three columns, each summing to one over the axis.
            assert!((row.iter().sum::<f32>() - 3.0).abs() < 1e-5, "{row:?}");
        }
        Ok(())
    }

    #[test]
    fn gather_rejects_scalar_data() -> Result<()> {
        let node = NodeProto {
            op_type: "Gather".to_string(),
            ..Default::default()
        };
        let data = Tensor::new(1f32, &Device::Cpu)?;
        let indices = Tensor::new(&[0i64], &Device::Cpu)?;
        let err = eval_node(&node, &[Some(data), Some(indices)], DEFAULT_OPSET, &Device::Cpu)
            .err()
            .context("scalar gather succeeded")?;
        assert!(err.to_string().contains("scalar"), "{err}");
        Ok(())
    }
}
