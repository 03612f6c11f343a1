//! Conversion checks: run a model in the reference framework and on the
//! target runtime, then compare what both produced.

pub mod compare;
pub mod config;
pub mod executor;
pub mod fixture;
pub mod inputs;
pub mod loader;
pub mod runner;

pub use compare::{Comparator, OutputReport, Tolerance};
pub use config::HarnessConfig;
pub use executor::{infer_converted, infer_fw_model, Converter, DualOutputs, DualRuntimeExecutor, GraphExport, ToGraph};
pub use fixture::{clean_dir, CaseScope, CleanupPolicy, Fixture};
pub use inputs::InputGenerator;
pub use loader::{FrozenGraph, ModelHandle, ModelLoader, FROZEN_GRAPH_FILE};
pub use runner::{ConvertModelTest, Outcome, SdpaLayerTest, Summary};
