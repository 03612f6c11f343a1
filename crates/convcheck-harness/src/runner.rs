use std::fmt;

use anyhow::{ensure, Context, Result};
use convcheck_core::{Backend, DType, Device, InputSpec, Mark, TestCase};
use convcheck_reference::{build_model, SdpaConfig, SDPA_OP};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::compare::{Comparator, OutputReport};
use crate::executor::{DualRuntimeExecutor, GraphExport};
use crate::fixture::Fixture;
use crate::inputs::InputGenerator;
use crate::loader::ModelLoader;
use crate::HarnessConfig;

/// Result of one test case.
#[derive(Debug)]
pub enum Outcome {
    Passed,
    Skipped(String),
    XFailed(String),
    Failed(anyhow::Error),
}

impl Outcome {
    fn from_result(result: Result<Vec<OutputReport>>) -> Self {
        match result {
            Ok(_) => Outcome::Passed,
            Err(err) => Outcome::Failed(err),
        }
    }

    /// Skip and xfail marks never reach the loader.
    fn from_mark(case: &TestCase) -> Option<Self> {
        let reason = if case.reason.is_empty() {
            format!("marked {}", case.mark)
        } else {
            case.reason.clone()
        };
        match case.mark {
            Mark::None => None,
            Mark::Skip => Some(Outcome::Skipped(reason)),
            Mark::Xfail => Some(Outcome::XFailed(reason)),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => f.write_str("passed"),
            Outcome::Skipped(reason) => write!(f, "skipped ({reason})"),
            Outcome::XFailed(reason) => write!(f, "xfailed ({reason})"),
            Outcome::Failed(err) => write!(f, "failed: {err:#}"),
        }
    }
}

/// Outcome counts of a suite run.
#[derive(Debug, Default)]
pub struct Summary {
    pub passed: usize,
    pub skipped: usize,
    pub xfailed: usize,
    pub failed: Vec<(String, anyhow::Error)>,
}

impl Summary {
    pub fn record(&mut self, id: String, outcome: Outcome) {
        match outcome {
            Outcome::Passed => self.passed += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::XFailed(_) => self.xfailed += 1,
            Outcome::Failed(err) => self.failed.push((id, err)),
        }
    }

    pub fn total(&self) -> usize {
        self.passed + self.skipped + self.xfailed + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} skipped, {} xfailed",
            self.passed,
            self.failed.len(),
            self.skipped,
            self.xfailed
        )
    }
}

fn artifact_stem(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Hub models: load, convert, run on both runtimes, compare.
pub struct ConvertModelTest<B: Backend> {
    fixture: Fixture,
    backend: B,
    comparator: Comparator,
    converter: GraphExport,
    inputs: InputGenerator,
}

impl<B: Backend> ConvertModelTest<B> {
    pub fn new(config: HarnessConfig, backend: B) -> Result<Self> {
        Ok(Self {
            fixture: Fixture::setup_class(config)?,
            backend,
            comparator: Comparator::default(),
            converter: GraphExport,
            inputs: InputGenerator::new(),
        })
    }

    pub fn with_comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn with_inputs(mut self, inputs: InputGenerator) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn fixture(&self) -> &Fixture {
        &self.fixture
    }

    /// Runs one case. Both caches are cleared when it returns, whatever the
    /// outcome, including cases a mark kept from running.
    pub fn run_case(&mut self, case: &TestCase) -> Outcome {
        let Self {
            fixture,
            backend,
            comparator,
            converter,
            inputs,
        } = self;
        let _scope = fixture.case_scope();

        if let Some(outcome) = Outcome::from_mark(case) {
            info!(case = %case.id(), %outcome, "case not executed");
            return outcome;
        }
        let outcome = Outcome::from_result(convert_and_compare(
            fixture, backend, comparator, converter, inputs, case,
        ));
        match &outcome {
            Outcome::Failed(err) => warn!(case = %case.id(), error = %format!("{err:#}"), "case failed"),
            other => info!(case = %case.id(), outcome = %other, "case finished"),
        }
        outcome
    }

    /// Runs one case regardless of its mark. The caches are cleared when this
    /// returns, after the loaded model has been released.
    pub fn run(&mut self, case: &TestCase) -> Result<Vec<OutputReport>> {
        let _scope = self.fixture.case_scope();
        convert_and_compare(
            &self.fixture,
            &self.backend,
            &self.comparator,
            &self.converter,
            &mut self.inputs,
            case,
        )
    }

    pub fn run_suite(&mut self, cases: &[TestCase]) -> Summary {
        let mut summary = Summary::default();
        for case in cases {
            let outcome = self.run_case(case);
            summary.record(case.id(), outcome);
        }
        info!(%summary, "model suite finished");
        summary
    }
}

fn convert_and_compare<B: Backend>(
    fixture: &Fixture,
    backend: &B,
    comparator: &Comparator,
    converter: &GraphExport,
    inputs: &mut InputGenerator,
    case: &TestCase,
) -> Result<Vec<OutputReport>> {
    let handle = ModelLoader::new(fixture.config(), fixture.work_dir()).load(case)?;
    debug!(case = %case.name, kind = handle.kind(), "model loaded");

    let spec = InputSpec::resolve(handle.input_signature())
        .with_context(|| format!("cannot derive inputs of `{}`", case.name))?;
    let feed = inputs.generate(&spec)?;

    let executor = DualRuntimeExecutor {
        backend,
        converter,
        device: fixture.config().device.clone(),
        work_dir: fixture.work_dir(),
    };
    let outputs = executor.run_handle(&handle, &artifact_stem(&case.name), &feed)?;
    drop(handle);

    comparator.compare(&outputs.reference, &outputs.target)
}

/// The attention operator in isolation, one configuration at a time.
pub struct SdpaLayerTest<B: Backend> {
    backend: B,
    device: Device,
    comparator: Comparator,
    converter: GraphExport,
    inputs: InputGenerator,
    rng: StdRng,
    work_dir: TempDir,
}

impl<B: Backend> SdpaLayerTest<B> {
    pub fn new(backend: B) -> Result<Self> {
        let work_dir = tempfile::Builder::new()
            .prefix("convcheck-sdpa-")
            .tempdir()
            .context("failed to create work directory")?;
        Ok(Self {
            backend,
            device: Device::Cpu,
            comparator: Comparator::default(),
            converter: GraphExport,
            inputs: InputGenerator::new(),
            rng: StdRng::from_entropy(),
            work_dir,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.inputs = InputGenerator::with_seed(seed);
        self.rng = StdRng::seed_from_u64(seed.wrapping_add(1));
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn run(&mut self, config: SdpaConfig) -> Result<Vec<OutputReport>> {
        ensure!(
            config.dtype != DType::F64 || self.backend.capabilities().supports_f64,
            "{} cannot execute f64 graphs",
            self.backend.name()
        );
        let (model, op) = build_model(config, &mut self.rng)?;
        debug!(%config, effective = %model.config(), op, "reference model built");

        let inputs = self.inputs.attention_inputs(config.dtype)?;
        let executor = DualRuntimeExecutor {
            backend: &self.backend,
            converter: &self.converter,
            device: self.device.clone(),
            work_dir: self.work_dir.path(),
        };
        let stem = artifact_stem(&format!("sdpa-{config}"));
        let outputs = executor.run_sdpa(&model, &stem, &inputs)?;
        self.comparator
            .compare(&outputs.reference, &outputs.target)
            .with_context(|| format!("{SDPA_OP} [{config}]"))
    }

    pub fn run_grid(&mut self) -> Summary {
        let mut summary = Summary::default();
        for config in SdpaConfig::grid() {
            let outcome = Outcome::from_result(self.run(config));
            info!(%config, %outcome, "attention case finished");
            summary.record(config.to_string(), outcome);
        }
        info!(%summary, "attention suite finished");
        summary
    }
}
