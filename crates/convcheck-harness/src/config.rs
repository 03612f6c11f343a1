use std::path::PathBuf;

use convcheck_core::{Device, DEFAULT_STORAGE_DOMAINS};

/// Everything a conversion run needs from its environment, passed explicitly.
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    /// Download cache of the generic model hub.
    pub hub_cache_dir: PathBuf,
    /// Download cache of the named (`hf_`) hub.
    pub hf_cache_dir: PathBuf,
    /// Link substrings that identify frozen-graph archive storage.
    pub storage_domains: Vec<String>,
    /// Device the target runtime executes on.
    pub device: Device,
}

impl HarnessConfig {
    pub fn new(hub_cache_dir: impl Into<PathBuf>, hf_cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            hub_cache_dir: hub_cache_dir.into(),
            hf_cache_dir: hf_cache_dir.into(),
            storage_domains: DEFAULT_STORAGE_DOMAINS.iter().map(|d| d.to_string()).collect(),
            device: Device::Cpu,
        }
    }

    /// Cache locations from `TFHUB_CACHE_DIR` and `HF_HUB_CACHE`, falling back
    /// to the locations the hub clients use by default.
    pub fn from_env() -> Self {
        let hub = std::env::var_os("TFHUB_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("tfhub_modules"));
        let hf = std::env::var_os("HF_HUB_CACHE")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME")
                    .map(|home| PathBuf::from(home).join(".cache/huggingface/hub"))
            })
            .unwrap_or_else(|| std::env::temp_dir().join("huggingface/hub"));
        Self::new(hub, hf)
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}
