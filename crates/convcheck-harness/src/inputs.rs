use anyhow::{bail, Result};
use convcheck_core::{DType, IOName, InputSpec, Shape, Tensor, TensorMap};
use convcheck_reference::sdpa::{INPUT_NAMES, QKV_SHAPE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Exclusive upper bound for generated integer inputs (token ids, indices).
const INT_INPUT_BOUND: i64 = 10;

/// Produces random input tensors for declared input signatures.
pub struct InputGenerator {
    rng: StdRng,
}

impl InputGenerator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Floats are standard normal, integers uniform in `[0, 10)`, bytes and
    /// booleans uniform over their range.
    pub fn tensor(&mut self, dtype: DType, shape: Shape) -> Result<Tensor> {
        let n = shape.numel();
        let rng = &mut self.rng;
        match dtype {
            DType::F32 => Tensor::from_vec(shape, (0..n).map(|_| rng.sample::<f32, _>(StandardNormal)).collect()),
            DType::F64 => Tensor::from_vec(shape, (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)).collect()),
            DType::I64 => Tensor::from_vec(shape, (0..n).map(|_| rng.gen_range(0..INT_INPUT_BOUND)).collect()),
            DType::I32 => Tensor::from_vec(
                shape,
                (0..n).map(|_| rng.gen_range(0..INT_INPUT_BOUND as i32)).collect(),
            ),
            DType::U8 => Tensor::from_vec(shape, (0..n).map(|_| rng.gen::<u8>()).collect()),
            DType::Bool => Tensor::from_bools(shape, (0..n).map(|_| rng.gen::<bool>()).collect()),
            DType::F16 => bail!("cannot generate f16 inputs"),
        }
    }

    pub fn generate(&mut self, spec: &InputSpec) -> Result<TensorMap> {
        let mut inputs = TensorMap::new();
        for info in &spec.0 {
            let tensor = self.tensor(info.dtype, info.shape.clone())?;
            inputs.insert(info.name.clone(), tensor);
        }
        Ok(inputs)
    }

    /// `query`, `key` and `value`, each `(1, 2, 8, 4)` and drawn independently.
    pub fn attention_inputs(&mut self, dtype: DType) -> Result<TensorMap> {
        let mut inputs = TensorMap::new();
        for name in INPUT_NAMES {
            let tensor = self.tensor(dtype, Shape::from_slice(&QKV_SHAPE))?;
            inputs.insert(IOName::from(name), tensor);
        }
        Ok(inputs)
    }
}

impl Default for InputGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convcheck_core::InputInfo;

    #[test]
    fn attention_inputs_match_declared_shape() -> Result<()> {
        let mut gen = InputGenerator::with_seed(5);
        for dtype in [DType::F32, DType::F64] {
            let inputs = gen.attention_inputs(dtype)?;
            assert_eq!(inputs.len(), 3);
            for tensor in inputs.values() {
                assert_eq!(tensor.shape().dims(), &[1, 2, 8, 4]);
                assert_eq!(tensor.dtype(), dtype);
            }
        }
        Ok(())
    }

    #[test]
    fn calls_draw_fresh_values() -> Result<()> {
        let mut gen = InputGenerator::with_seed(9);
        let a = gen.tensor(DType::F32, Shape::from_slice(&[16]))?;
        let b = gen.tensor(DType::F32, Shape::from_slice(&[16]))?;
        assert_ne!(a, b);
        Ok(())
    }

    #[test]
    fn integer_inputs_stay_in_range() -> Result<()> {
        let mut gen = InputGenerator::with_seed(2);
        let spec = InputSpec(vec![InputInfo {
            name: IOName::from("input_ids"),
            shape: Shape::from_slice(&[1, 128]),
            dtype: DType::I64,
        }]);
        let inputs = gen.generate(&spec)?;
        let ids = inputs[&IOName::from("input_ids")].to_vec::<i64>()?;
        assert_eq!(ids.len(), 128);
        assert!(ids.iter().all(|v| (0..INT_INPUT_BOUND).contains(v)));
        Ok(())
    }
}
