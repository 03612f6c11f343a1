use std::collections::BTreeMap;
use std::fmt;

use crate::{DType, HarnessError, Shape, Tensor};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IOName(pub String);

impl IOName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IOName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl fmt::Display for IOName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named tensors produced or consumed by one runtime. Ordered so that two maps
/// can be compared key-for-key.
pub type TensorMap = BTreeMap<IOName, Tensor>;

/// Declared element type of a model input or output, as the model format names it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementType {
    Known(DType),
    /// A type the harness has no tensor representation for (strings, complex, ...).
    Other(i32),
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Known(dtype) => write!(f, "{dtype}"),
            ElementType::Other(code) => write!(f, "element type #{code}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TensorSpec {
    pub name: IOName,
    pub elem: ElementType,
    /// `None` when the rank is unknown; `None` per dimension marks a wildcard.
    pub dims: Option<Vec<Option<usize>>>,
    /// Set for inputs that are bound to stored weights (variables) rather than fed.
    pub bound: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ModelSpec {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl ModelSpec {
    pub fn output_names(&self) -> Vec<IOName> {
        self.outputs.iter().map(|o| o.name.clone()).collect()
    }
}

/// Element types the harness can generate inputs for.
pub const SUPPORTED_INPUT_TYPES: &[DType] = &[
    DType::F32,
    DType::F64,
    DType::I64,
    DType::I32,
    DType::U8,
    DType::Bool,
];

const IMAGE_SHAPE: [usize; 4] = [1, 200, 200, 3];

#[derive(Clone, Debug, PartialEq)]
pub struct InputInfo {
    pub name: IOName,
    pub shape: Shape,
    pub dtype: DType,
}

/// Concrete shapes and dtypes for every input that has to be fed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InputSpec(pub Vec<InputInfo>);

impl InputSpec {
    /// Resolves declared input signatures into concrete ones.
    ///
    /// Wildcard dimensions become 1, an unknown rank becomes a scalar, and a
    /// float `[?, ?, ?, 3]` input is treated as an image of `[1, 200, 200, 3]`.
    /// Weight-bound inputs are skipped.
    pub fn resolve(inputs: &[TensorSpec]) -> Result<Self, HarnessError> {
        let mut resolved = Vec::with_capacity(inputs.len());
        for input in inputs.iter().filter(|i| !i.bound) {
            let dtype = match input.elem {
                ElementType::Known(dtype) if SUPPORTED_INPUT_TYPES.contains(&dtype) => dtype,
                elem => {
                    return Err(HarnessError::UnsupportedType {
                        input: input.name.0.clone(),
                        dtype: elem.to_string(),
                    })
                }
            };

            let shape = match &input.dims {
                None => Shape::scalar(),
                Some(dims) if is_image_like(dims, dtype) => Shape::from_slice(&IMAGE_SHAPE),
                Some(dims) => Shape(dims.iter().map(|d| d.unwrap_or(1)).collect()),
            };

            resolved.push(InputInfo {
                name: input.name.clone(),
                shape,
                dtype,
            });
        }
        Ok(Self(resolved))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn is_image_like(dims: &[Option<usize>], dtype: DType) -> bool {
    dtype == DType::F32 && matches!(dims, [None, None, None, Some(3)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, elem: ElementType, dims: Option<Vec<Option<usize>>>) -> TensorSpec {
        TensorSpec {
            name: IOName::from(name),
            elem,
            dims,
            bound: false,
        }
    }

    #[test]
    fn wildcards_resolve_to_one() {
        let inputs = [spec(
            "ids",
            ElementType::Known(DType::I64),
            Some(vec![None, Some(16)]),
        )];
        let resolved = InputSpec::resolve(&inputs).unwrap();
        assert_eq!(resolved.0[0].shape, Shape::from_slice(&[1, 16]));
    }

    #[test]
    fn float_nhwc_input_is_treated_as_image() {
        let inputs = [spec(
            "image",
            ElementType::Known(DType::F32),
            Some(vec![None, None, None, Some(3)]),
        )];
        let resolved = InputSpec::resolve(&inputs).unwrap();
        assert_eq!(resolved.0[0].shape, Shape::from_slice(&[1, 200, 200, 3]));

        let inputs = [spec(
            "pixels",
            ElementType::Known(DType::U8),
            Some(vec![None, None, None, Some(3)]),
        )];
        let resolved = InputSpec::resolve(&inputs).unwrap();
        assert_eq!(resolved.0[0].shape, Shape::from_slice(&[1, 1, 1, 3]));
    }

    #[test]
    fn unknown_rank_is_scalar() {
        let inputs = [spec("x", ElementType::Known(DType::F64), None)];
        let resolved = InputSpec::resolve(&inputs).unwrap();
        assert_eq!(resolved.0[0].shape.rank(), 0);
    }

    #[test]
    fn bound_inputs_are_skipped() {
        let mut weight = spec("w", ElementType::Other(8), Some(vec![Some(4)]));
        weight.bound = true;
        let inputs = [weight, spec("x", ElementType::Known(DType::F32), Some(vec![Some(4)]))];
        let resolved = InputSpec::resolve(&inputs).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved.0[0].name, IOName::from("x"));
    }

    #[test]
    fn unsupported_dtype_fails_fast() {
        let inputs = [
            spec("x", ElementType::Known(DType::F32), Some(vec![Some(1)])),
            spec("text", ElementType::Other(8), Some(vec![Some(1)])),
        ];
        let err = InputSpec::resolve(&inputs).unwrap_err();
        assert!(matches!(err, HarnessError::UnsupportedType { ref input, .. } if input == "text"));
    }
}
