mod cli;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use convcheck_backend_ort::OrtBackend;
use convcheck_core::{load_models_list, DType, Device};
use convcheck_harness::{ConvertModelTest, HarnessConfig, Outcome, SdpaLayerTest, Summary};
use convcheck_reference::SdpaConfig;
use tracing_subscriber::EnvFilter;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let summary = match cli.command {
        Command::Run {
            list,
            hub_cache,
            hf_cache,
            storage_domains,
            device,
            log,
        } => {
            init_tracing(&log);
            let device = parse_device(&device)?;
            run_list(list, hub_cache, hf_cache, storage_domains, device)?
        }
        Command::Sdpa {
            dtype,
            seed,
            device,
            log,
        } => {
            init_tracing(&log);
            let device = parse_device(&device)?;
            let dtype = dtype.as_deref().map(parse_dtype).transpose()?;
            run_sdpa(dtype, seed, device)?
        }
    };

    for (id, err) in &summary.failed {
        tracing::error!(case = %id, error = %format!("{err:#}"), "failed");
    }
    println!("{summary}");
    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_tracing(log: &str) {
    std::env::set_var("RUST_LOG", log);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

fn run_list(
    list: PathBuf,
    hub_cache: Option<PathBuf>,
    hf_cache: Option<PathBuf>,
    storage_domains: Vec<String>,
    device: Device,
) -> Result<Summary> {
    let mut config = HarnessConfig::from_env().with_device(device);
    if let Some(dir) = hub_cache {
        config.hub_cache_dir = dir;
    }
    if let Some(dir) = hf_cache {
        config.hf_cache_dir = dir;
    }
    config.storage_domains.extend(storage_domains);

    let cases = load_models_list(&list, &config.storage_domains)?;
    tracing::info!(list = %list.display(), cases = cases.len(), device = %config.device, "model list loaded");

    let mut suite = ConvertModelTest::new(config, OrtBackend::new())?;
    Ok(suite.run_suite(&cases))
}

fn run_sdpa(dtype: Option<DType>, seed: Option<u64>, device: Device) -> Result<Summary> {
    let mut suite = SdpaLayerTest::new(OrtBackend::new())?.with_device(device);
    if let Some(seed) = seed {
        suite = suite.with_seed(seed);
    }

    let Some(dtype) = dtype else {
        return Ok(suite.run_grid());
    };
    let mut summary = Summary::default();
    for config in SdpaConfig::grid().into_iter().filter(|c| c.dtype == dtype) {
        let outcome = match suite.run(config) {
            Ok(_) => Outcome::Passed,
            Err(err) => Outcome::Failed(err),
        };
        tracing::info!(%config, %outcome, "attention case finished");
        summary.record(config.to_string(), outcome);
    }
    Ok(summary)
}

fn parse_dtype(raw: &str) -> Result<DType> {
    match raw.to_ascii_lowercase().as_str() {
        "f32" | "float32" => Ok(DType::F32),
        "f64" | "float64" => Ok(DType::F64),
        _ => anyhow::bail!("unsupported dtype: {raw} (expected f32 or f64)"),
    }
}

fn parse_device(raw: &str) -> Result<Device> {
    if raw.eq_ignore_ascii_case("cpu") {
        return Ok(Device::Cpu);
    }

    if let Some(rest) = raw.strip_prefix("cuda:") {
        let device_id: u32 = rest.parse().context("invalid cuda device id")?;
        return Ok(Device::Cuda { device_id });
    }

    anyhow::bail!("unsupported device: {raw} (expected cpu or cuda:N)");
}
