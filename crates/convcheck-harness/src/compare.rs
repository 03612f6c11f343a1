use std::collections::BTreeSet;

use anyhow::Result;
use convcheck_core::{DType, HarnessError, IOName, TensorMap};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Tolerance {
    pub const EXACT: Tolerance = Tolerance { atol: 0.0, rtol: 0.0 };

    fn accepts(&self, expected: f64, actual: f64) -> bool {
        if expected.is_nan() || actual.is_nan() {
            return expected.is_nan() && actual.is_nan();
        }
        if expected.is_infinite() || actual.is_infinite() {
            return expected == actual;
        }
        (expected - actual).abs() <= self.atol + self.rtol * expected.abs()
    }
}

/// Per-output summary of a comparison.
#[derive(Clone, Debug)]
pub struct OutputReport {
    pub name: IOName,
    pub dtype: DType,
    pub elements: usize,
    pub max_abs_diff: f64,
    pub mismatches: usize,
}

/// Checks that two runtimes produced the same outputs within tolerance.
#[derive(Clone, Debug)]
pub struct Comparator {
    pub f32_tolerance: Tolerance,
    pub f64_tolerance: Tolerance,
}

impl Default for Comparator {
    fn default() -> Self {
        Self {
            f32_tolerance: Tolerance { atol: 1e-4, rtol: 1e-4 },
            f64_tolerance: Tolerance { atol: 1e-7, rtol: 1e-7 },
        }
    }
}

impl Comparator {
    fn tolerance(&self, dtype: DType) -> Tolerance {
        match dtype {
            DType::F32 | DType::F16 => self.f32_tolerance,
            DType::F64 => self.f64_tolerance,
            DType::I64 | DType::I32 | DType::U8 | DType::Bool => Tolerance::EXACT,
        }
    }

    /// Compares `actual` against `expected`. Both maps must carry exactly the
    /// same output names.
    pub fn compare(&self, expected: &TensorMap, actual: &TensorMap) -> Result<Vec<OutputReport>> {
        let want: BTreeSet<&IOName> = expected.keys().collect();
        let got: BTreeSet<&IOName> = actual.keys().collect();
        if want != got {
            let missing: Vec<_> = want.difference(&got).map(|n| n.as_str()).collect();
            let extra: Vec<_> = got.difference(&want).map(|n| n.as_str()).collect();
            return Err(HarnessError::OutputMismatch(format!(
                "output names differ: missing {missing:?}, unexpected {extra:?}"
            ))
            .into());
        }

        let mut reports = Vec::with_capacity(expected.len());
        let mut failures = Vec::new();
        for (name, reference) in expected {
            let target = &actual[name];
            if reference.shape() != target.shape() {
                failures.push(format!(
                    "`{name}` shape {} vs {}",
                    reference.shape(),
                    target.shape()
                ));
                continue;
            }
            if reference.dtype() != target.dtype() {
                failures.push(format!(
                    "`{name}` dtype {} vs {}",
                    reference.dtype(),
                    target.dtype()
                ));
                continue;
            }

            let tol = self.tolerance(reference.dtype());
            let a = reference.to_f64_vec()?;
            let b = target.to_f64_vec()?;
            let mut max_abs_diff = 0.0f64;
            let mut mismatches = 0;
            for (x, y) in a.iter().zip(&b) {
                if !tol.accepts(*x, *y) {
                    mismatches += 1;
                }
                let diff = (x - y).abs();
                if diff.is_finite() {
                    max_abs_diff = max_abs_diff.max(diff);
                }
            }

            debug!(output = %name, elements = a.len(), max_abs_diff, mismatches, "compared output");
            if mismatches > 0 {
                failures.push(format!(
                    "`{name}`: {mismatches} of {} elements out of tolerance (max abs diff {max_abs_diff:e})",
                    a.len()
                ));
            }
            reports.push(OutputReport {
                name: name.clone(),
                dtype: reference.dtype(),
                elements: a.len(),
                max_abs_diff,
                mismatches,
            });
        }

        if !failures.is_empty() {
            return Err(HarnessError::OutputMismatch(failures.join("; ")).into());
        }
        Ok(reports)
    }
}
