//! Scaled dot-product attention: reference operator, model builder and lowering.

use std::fmt;

use anyhow::{ensure, Context, Result};
use candle_core::{Device, Tensor as CTensor, D};
use convcheck_core::{DType, IOName, Shape, Tensor, TensorMap};
use convcheck_onnx::{attr_int, attr_ints, proto::ModelProto, GraphBuilder};
use rand::Rng;

use crate::convert::{from_candle, to_candle};

pub const SDPA_OP: &str = "aten::scaled_dot_product_attention";

/// Shape of query, key and value: (batch, heads, sequence, embedding).
pub const QKV_SHAPE: [usize; 4] = [1, 2, 8, 4];

/// Explicit scale passed to the second attention call.
pub const OVERRIDE_SCALE: f64 = 5.0;

pub const INPUT_NAMES: [&str; 3] = ["query", "key", "value"];
pub const OUTPUT_NAMES: [&str; 2] = ["output_0", "output_1"];

/// Computes `softmax(q @ k^T * scale + bias) @ v`.
///
/// `attn_mask` is added to the scores. `is_causal` masks every position
/// after the query position with `-inf`. `scale` defaults to `1/sqrt(E)`.
pub fn scaled_dot_product_attention(
    query: &CTensor,
    key: &CTensor,
    value: &CTensor,
    attn_mask: Option<&CTensor>,
    is_causal: bool,
    scale: Option<f64>,
) -> candle_core::Result<CTensor> {
    let embed = query.dim(D::Minus1)?;
    let scale = scale.unwrap_or(1.0 / (embed as f64).sqrt());

    let mut scores = query
        .broadcast_matmul(&key.transpose(D::Minus2, D::Minus1)?.contiguous()?)?
        .affine(scale, 0.0)?;
    if is_causal {
        let bias = causal_bias(query.dim(D::Minus2)?, key.dim(D::Minus2)?, query.device())?;
        scores = scores.broadcast_add(&bias.to_dtype(scores.dtype())?)?;
    }
    if let Some(mask) = attn_mask {
        scores = scores.broadcast_add(mask)?;
    }
    let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
    probs.broadcast_matmul(value)
}

/// Zero on and below the diagonal, `-inf` above it.
fn causal_bias(rows: usize, cols: usize, device: &Device) -> candle_core::Result<CTensor> {
    let data: Vec<f64> = (0..rows)
        .flat_map(|i| (0..cols).map(move |j| if j > i { f64::NEG_INFINITY } else { 0.0 }))
        .collect();
    CTensor::from_vec(data, (rows, cols), device)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SdpaConfig {
    pub use_mask: bool,
    pub is_causal: bool,
    pub dtype: DType,
}

impl SdpaConfig {
    pub fn new(use_mask: bool, is_causal: bool, dtype: DType) -> Self {
        Self {
            use_mask,
            is_causal,
            dtype,
        }
    }

    /// An explicit mask takes precedence: requesting both yields a masked,
    /// non-causal configuration.
    pub fn effective(self) -> Self {
        Self {
            is_causal: self.is_causal && !self.use_mask,
            ..self
        }
    }

    /// Every mask/causal combination for both float widths.
    pub fn grid() -> Vec<Self> {
        let mut grid = Vec::with_capacity(8);
        for dtype in [DType::F32, DType::F64] {
            for (use_mask, is_causal) in [(false, false), (false, true), (true, true), (true, false)] {
                grid.push(Self::new(use_mask, is_causal, dtype));
            }
        }
        grid
    }
}

impl fmt::Display for SdpaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mask={}-is_causal={}-dtype={}",
            self.use_mask, self.is_causal, self.dtype
        )
    }
}

/// Two attention calls over the same inputs: default scale and [`OVERRIDE_SCALE`].
#[derive(Clone, Debug)]
pub struct SdpaModel {
    requested: SdpaConfig,
    config: SdpaConfig,
    mask: Option<Tensor>,
}

/// Builds the reference model and returns it with the operator it exercises.
pub fn build_model<R: Rng>(config: SdpaConfig, rng: &mut R) -> Result<(SdpaModel, &'static str)> {
    ensure!(
        matches!(config.dtype, DType::F32 | DType::F64),
        "attention reference model supports f32 and f64, got {}",
        config.dtype
    );
    let seq = QKV_SHAPE[2];
    let mask = if config.use_mask {
        let bits: Vec<f64> = (0..seq * seq).map(|_| f64::from(rng.gen_range(0u8..2))).collect();
        let shape = Shape::from_slice(&[seq, seq]);
        Some(match config.dtype {
            DType::F64 => Tensor::from_vec(shape, bits)?,
            _ => Tensor::from_vec(shape, bits.into_iter().map(|b| b as f32).collect())?,
        })
    } else {
        None
    };

    let model = SdpaModel {
        requested: config,
        config: config.effective(),
        mask,
    };
    Ok((model, SDPA_OP))
}

impl SdpaModel {
    /// Configuration as requested by the caller.
    pub fn requested(&self) -> SdpaConfig {
        self.requested
    }

    /// Configuration actually executed, after mask precedence.
    pub fn config(&self) -> SdpaConfig {
        self.config
    }

    pub fn mask(&self) -> Option<&Tensor> {
        self.mask.as_ref()
    }

    pub fn forward(
        &self,
        query: &CTensor,
        key: &CTensor,
        value: &CTensor,
    ) -> Result<(CTensor, CTensor)> {
        let mask = self
            .mask
            .as_ref()
            .map(|m| to_candle(m, query.device()))
            .transpose()?;
        let a = scaled_dot_product_attention(query, key, value, mask.as_ref(), self.config.is_causal, None)?;
        let b = scaled_dot_product_attention(
            query,
            key,
            value,
            mask.as_ref(),
            self.config.is_causal,
            Some(OVERRIDE_SCALE),
        )?;
        Ok((a, b))
    }

    /// Native execution over named tensors: `query`, `key`, `value` in,
    /// `output_0`, `output_1` out.
    pub fn forward_named(&self, inputs: &TensorMap) -> Result<TensorMap> {
        let device = Device::Cpu;
        let [q, k, v] = INPUT_NAMES.map(|name| {
            inputs
                .get(&IOName::from(name))
                .with_context(|| format!("missing `{name}` input"))
                .and_then(|t| to_candle(t, &device))
        });
        let (a, b) = self.forward(&q?, &k?, &v?)?;

        let mut outputs = TensorMap::new();
        outputs.insert(IOName::from(OUTPUT_NAMES[0]), from_candle(&a, self.config.dtype)?);
        outputs.insert(IOName::from(OUTPUT_NAMES[1]), from_candle(&b, self.config.dtype)?);
        Ok(outputs)
    }

    /// Lowers the model into a static graph of primitive operators.
    pub fn lower(&self) -> Result<ModelProto> {
        let dtype = self.config.dtype;
        let seq = QKV_SHAPE[2];
        let embed = QKV_SHAPE[3];

        let mut b = GraphBuilder::new("scaled_dot_product_attention");
        for name in INPUT_NAMES {
            b.input(name, dtype, &QKV_SHAPE);
        }
        b.node("Transpose", &["key"], &["key_t"], vec![attr_ints("perm", &[0, 1, 3, 2])])
            .node("MatMul", &["query", "key_t"], &["scores"], vec![]);

        let bias = match (&self.mask, self.config.is_causal) {
            (Some(mask), _) => Some(mask.clone()),
            (None, true) => {
                let data: Vec<f64> = (0..seq)
                    .flat_map(|i| (0..seq).map(move |j| if j > i { f64::NEG_INFINITY } else { 0.0 }))
                    .collect();
                Some(scalar_or_matrix(dtype, Shape::from_slice(&[seq, seq]), data)?)
            }
            (None, false) => None,
        };
        if let Some(bias) = &bias {
            b.initializer("attn_bias", bias);
        }

        let scales = [1.0 / (embed as f64).sqrt(), OVERRIDE_SCALE];
        for (i, (scale, output)) in scales.iter().zip(OUTPUT_NAMES).enumerate() {
            let scale_name = format!("scale_{i}");
            let scaled = format!("scaled_{i}");
            let biased = format!("biased_{i}");
            let probs = format!("probs_{i}");

            b.initializer(&scale_name, &scalar_or_matrix(dtype, Shape::scalar(), vec![*scale])?)
                .node("Mul", &["scores", scale_name.as_str()], &[scaled.as_str()], vec![]);
            let logits = if bias.is_some() {
                b.node("Add", &[scaled.as_str(), "attn_bias"], &[biased.as_str()], vec![]);
                biased.as_str()
            } else {
                scaled.as_str()
            };
            b.node("Softmax", &[logits], &[probs.as_str()], vec![attr_int("axis", -1)])
                .node("MatMul", &[probs.as_str(), "value"], &[output], vec![])
                .output(output, dtype, &QKV_SHAPE);
        }

        Ok(b.finish("convcheck-sdpa"))
    }
}

fn scalar_or_matrix(dtype: DType, shape: Shape, data: Vec<f64>) -> Result<Tensor> {
    match dtype {
        DType::F64 => Tensor::from_vec(shape, data),
        _ => Tensor::from_vec(shape, data.into_iter().map(|v| v as f32).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_wins_over_causal() {
        let cfg = SdpaConfig::new(true, true, DType::F32).effective();
        assert!(cfg.use_mask);
        assert!(!cfg.is_causal);
        assert!(SdpaConfig::new(false, true, DType::F32).effective().is_causal);
    }

    #[test]
    fn grid_covers_all_combinations() {
        let grid = SdpaConfig::grid();
        assert_eq!(grid.len(), 8);
        for dtype in [DType::F32, DType::F64] {
            for (m, c) in [(false, false), (false, true), (true, true), (true, false)] {
                assert!(grid.contains(&SdpaConfig::new(m, c, dtype)));
            }
        }
    }

    #[test]
    fn causal_bias_hides_future_positions() -> candle_core::Result<()> {
        let bias = causal_bias(3, 3, &Device::Cpu)?.to_vec2::<f64>()?;
        assert_eq!(bias[0][0], 0.0);
        assert_eq!(bias[0][1], f64::NEG_INFINITY);
        assert_eq!(bias[2][1], 0.0);
        Ok(())
    }
}
