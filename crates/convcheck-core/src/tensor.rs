use std::fmt;

use anyhow::{ensure, Result};
use bytes::Bytes;
use smallvec::SmallVec;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda { device_id: u32 },
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    F16,
    I64,
    I32,
    U8,
    Bool,
}

impl DType {
    pub fn byte_size(self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 => 2,
            DType::U8 | DType::Bool => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::F16 => "f16",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::U8 => "u8",
            DType::Bool => "bool",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn scalar() -> Self {
        Self(SmallVec::new())
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }
    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.as_slice())
    }
}

/// Plain-old-data element types that can back a [`Tensor`].
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
    fn to_f64(self) -> f64;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr, $n:literal) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; $n];
                buf.copy_from_slice(&bytes[..$n]);
                <$ty>::from_le_bytes(buf)
            }

            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

impl_element!(f32, DType::F32, 4);
impl_element!(f64, DType::F64, 8);
impl_element!(i64, DType::I64, 8);
impl_element!(i32, DType::I32, 4);
impl_element!(u8, DType::U8, 1);

#[derive(Clone, Debug, PartialEq)]
pub struct TensorDesc {
    pub dtype: DType,
    pub shape: Shape,
}

/// A dense, contiguous, little-endian CPU tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub desc: TensorDesc,
    pub bytes: Bytes,
}

impl Tensor {
    pub fn from_cpu_bytes(dtype: DType, shape: Shape, bytes: Bytes) -> Result<Self> {
        let expected = shape.numel() * dtype.byte_size();
        ensure!(
            bytes.len() == expected,
            "tensor byte size mismatch: got {}, expected {} for {dtype}{shape}",
            bytes.len(),
            expected
        );
        Ok(Self {
            desc: TensorDesc { dtype, shape },
            bytes,
        })
    }

    pub fn from_vec<T: Element>(shape: Shape, data: Vec<T>) -> Result<Self> {
        ensure!(
            data.len() == shape.numel(),
            "expected {} elements for shape {shape}, got {}",
            shape.numel(),
            data.len()
        );
        let mut out = Vec::with_capacity(data.len() * T::DTYPE.byte_size());
        for v in data {
            v.write_le(&mut out);
        }
        Self::from_cpu_bytes(T::DTYPE, shape, Bytes::from(out))
    }

    /// Boolean tensors are stored one byte per element.
    pub fn from_bools(shape: Shape, data: Vec<bool>) -> Result<Self> {
        let bytes: Vec<u8> = data.into_iter().map(u8::from).collect();
        Self::from_cpu_bytes(DType::Bool, shape, Bytes::from(bytes))
    }

    pub fn dtype(&self) -> DType {
        self.desc.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.desc.shape
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        let matches = T::DTYPE == self.dtype() || (T::DTYPE == DType::U8 && self.dtype() == DType::Bool);
        ensure!(
            matches,
            "tensor holds {} but {} was requested",
            self.dtype(),
            T::DTYPE
        );
        let width = T::DTYPE.byte_size();
        Ok(self.bytes.chunks_exact(width).map(T::read_le).collect())
    }

    /// Widens every element to f64; used when comparing outputs of different runtimes.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        Ok(match self.dtype() {
            DType::F32 => self.to_vec::<f32>()?.into_iter().map(Element::to_f64).collect(),
            DType::F64 => self.to_vec::<f64>()?,
            DType::I64 => self.to_vec::<i64>()?.into_iter().map(Element::to_f64).collect(),
            DType::I32 => self.to_vec::<i32>()?.into_iter().map(Element::to_f64).collect(),
            DType::U8 | DType::Bool => self.bytes.iter().map(|b| f64::from(*b)).collect(),
            DType::F16 => anyhow::bail!("f16 tensors are not supported yet"),
        })
    }
}
