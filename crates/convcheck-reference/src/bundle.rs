//! Hub model bundles: a directory holding one graph file per signature.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Tensor;
use convcheck_onnx::{load_model, proto::ModelProto};
use tracing::debug;

use crate::interp::ReferenceGraph;

const SIGNATURE_EXT: &str = "onnx";

/// Signature keys tried before falling back to the first key in order.
pub const PREFERRED_SIGNATURES: &[&str] = &["serving_default", "default"];

#[derive(Debug)]
pub struct Bundle {
    root: PathBuf,
    signatures: BTreeMap<String, PathBuf>,
}

impl Bundle {
    pub fn open(root: &Path) -> Result<Self> {
        let mut signatures = BTreeMap::new();
        let entries = std::fs::read_dir(root)
            .with_context(|| format!("failed to open model bundle {}", root.display()))?;
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(SIGNATURE_EXT) {
                continue;
            }
            if let Some(key) = path.file_stem().and_then(|s| s.to_str()) {
                signatures.insert(key.to_string(), path.clone());
            }
        }
        debug!(bundle = %root.display(), signatures = signatures.len(), "opened model bundle");
        Ok(Self {
            root: root.to_path_buf(),
            signatures,
        })
    }

    /// Signature keys in lexicographic order.
    pub fn signature_keys(&self) -> impl Iterator<Item = &str> {
        self.signatures.keys().map(String::as_str)
    }

    /// Picks `serving_default`, then `default`, then the first key. `None`
    /// when the bundle exposes no signatures at all.
    pub fn default_signature_key(&self) -> Option<&str> {
        PREFERRED_SIGNATURES
            .iter()
            .copied()
            .find(|key| self.signatures.contains_key(*key))
            .or_else(|| self.signature_keys().next())
    }

    pub fn signature(&self, key: &str) -> Result<Signature> {
        let path = self
            .signatures
            .get(key)
            .with_context(|| format!("bundle {} has no signature `{key}`", self.root.display()))?;
        let model = load_model(path)?;
        Signature::new(key, model, self.root.clone())
    }
}

/// A callable inference entry point of a bundle.
pub struct Signature {
    key: String,
    model: ModelProto,
    graph: ReferenceGraph,
    bundle_root: PathBuf,
}

impl Signature {
    pub fn new(key: &str, model: ModelProto, bundle_root: PathBuf) -> Result<Self> {
        let graph = ReferenceGraph::new(&model)?;
        Ok(Self {
            key: key.to_string(),
            model,
            graph,
            bundle_root,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The graph behind the signature, for exporting it to other runtimes.
    pub fn model(&self) -> &ModelProto {
        &self.model
    }

    pub fn graph(&self) -> &ReferenceGraph {
        &self.graph
    }

    /// Directory of the bundle the signature was loaded from.
    pub fn bundle_root(&self) -> &Path {
        &self.bundle_root
    }

    pub fn call(&self, inputs: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        self.graph
            .run(inputs)
            .with_context(|| format!("signature `{}` failed", self.key))
    }
}
