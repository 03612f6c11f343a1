//! Moves tensors between the harness representation and candle.

use anyhow::{bail, Result};
use candle_core::{DType as CDType, Device, Tensor as CTensor};
use convcheck_core::{DType, Shape, Tensor};

pub fn candle_dtype(dtype: DType) -> Result<CDType> {
    Ok(match dtype {
        DType::F32 => CDType::F32,
        DType::F64 => CDType::F64,
        DType::F16 => CDType::F16,
        // candle has no i32; widen and narrow again on the way out.
        DType::I64 | DType::I32 => CDType::I64,
        DType::U8 | DType::Bool => CDType::U8,
    })
}

pub fn to_candle(tensor: &Tensor, device: &Device) -> Result<CTensor> {
    let dims = tensor.shape().dims().to_vec();
    let t = match tensor.dtype() {
        DType::F32 => CTensor::from_vec(tensor.to_vec::<f32>()?, dims, device)?,
        DType::F64 => CTensor::from_vec(tensor.to_vec::<f64>()?, dims, device)?,
        DType::I64 => CTensor::from_vec(tensor.to_vec::<i64>()?, dims, device)?,
        DType::I32 => {
            let data: Vec<i64> = tensor.to_vec::<i32>()?.into_iter().map(i64::from).collect();
            CTensor::from_vec(data, dims, device)?
        }
        DType::U8 | DType::Bool => CTensor::from_vec(tensor.bytes.to_vec(), dims, device)?,
        DType::F16 => bail!("f16 tensors are not supported by the reference runtime"),
    };
    Ok(t)
}

/// Converts back, casting to `want` (the dtype the graph declares for this value).
pub fn from_candle(tensor: &CTensor, want: DType) -> Result<Tensor> {
    let shape = Shape::from_slice(tensor.dims());
    let flat = tensor.to_dtype(candle_dtype(want)?)?.flatten_all()?;
    match want {
        DType::F32 => Tensor::from_vec(shape, flat.to_vec1::<f32>()?),
        DType::F64 => Tensor::from_vec(shape, flat.to_vec1::<f64>()?),
        DType::I64 => Tensor::from_vec(shape, flat.to_vec1::<i64>()?),
        DType::I32 => {
            let data = flat
                .to_vec1::<i64>()?
                .into_iter()
                .map(i32::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            Tensor::from_vec(shape, data)
        }
        DType::U8 => Tensor::from_vec(shape, flat.to_vec1::<u8>()?),
        DType::Bool => Tensor::from_bools(shape, flat.to_vec1::<u8>()?.into_iter().map(|b| b != 0).collect()),
        DType::F16 => bail!("f16 tensors are not supported by the reference runtime"),
    }
}

/// Best harness dtype for a candle value when the graph declares none.
pub fn natural_dtype(tensor: &CTensor) -> Result<DType> {
    Ok(match tensor.dtype() {
        CDType::F32 => DType::F32,
        CDType::F64 => DType::F64,
        CDType::I64 => DType::I64,
        CDType::U8 => DType::U8,
        other => bail!("reference runtime produced unsupported dtype {other:?}"),
    })
}
