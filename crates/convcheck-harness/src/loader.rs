use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, ensure, Context, Result};
use convcheck_core::{HarnessError, HubLibrary, SourceKind, TensorSpec, TestCase};
use convcheck_onnx::{load_model, proto::ModelProto};
use convcheck_reference::{Bundle, ReferenceGraph, Signature};
use tracing::{debug, info};

use crate::HarnessConfig;

/// Graph file expected inside frozen-graph archives.
pub const FROZEN_GRAPH_FILE: &str = "frozen_inference_graph.onnx";

const ARCHIVE_SUFFIX: &str = ".tar.gz";

const TFHUB_COMPRESSED_QUERY: &str = "tf-hub-format=compressed";

/// Signature key given to graphs fetched from the named hub.
const NAMED_HUB_SIGNATURE: &str = "serving_default";

/// A static graph with fixed weights, loaded from a single file.
pub struct FrozenGraph {
    path: PathBuf,
    model: ModelProto,
    graph: ReferenceGraph,
}

impl FrozenGraph {
    pub fn load(path: &Path) -> Result<Self> {
        let model = load_model(path)?;
        let graph = ReferenceGraph::new(&model)?;
        Ok(Self {
            path: path.to_path_buf(),
            model,
            graph,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn graph(&self) -> &ReferenceGraph {
        &self.graph
    }
}

/// A model loaded for one test case. Dropping it releases the decoded weights.
pub enum ModelHandle {
    StaticGraph(FrozenGraph),
    Callable(Signature),
}

impl ModelHandle {
    pub fn kind(&self) -> &'static str {
        match self {
            ModelHandle::StaticGraph(_) => "static graph",
            ModelHandle::Callable(_) => "callable",
        }
    }

    pub fn model(&self) -> &ModelProto {
        match self {
            ModelHandle::StaticGraph(g) => &g.model,
            ModelHandle::Callable(s) => s.model(),
        }
    }

    pub fn input_signature(&self) -> &[TensorSpec] {
        match self {
            ModelHandle::StaticGraph(g) => g.graph.inputs(),
            ModelHandle::Callable(s) => s.graph().inputs(),
        }
    }

    pub fn output_signature(&self) -> &[TensorSpec] {
        match self {
            ModelHandle::StaticGraph(g) => g.graph.outputs(),
            ModelHandle::Callable(s) => s.graph().outputs(),
        }
    }
}

/// Resolves a test case to a loaded model.
pub struct ModelLoader<'a> {
    config: &'a HarnessConfig,
    work_dir: &'a Path,
}

impl<'a> ModelLoader<'a> {
    pub fn new(config: &'a HarnessConfig, work_dir: &'a Path) -> Self {
        Self { config, work_dir }
    }

    pub fn load(&self, case: &TestCase) -> Result<ModelHandle> {
        info!(model = %case.name, link = %case.link, "loading model");
        match &case.source {
            SourceKind::NamedHub(library) => self.load_named_hub(&case.name, library),
            SourceKind::ArchiveUrl(url) => self.load_archive(&case.name, url),
            SourceKind::GenericHub(link) => self.load_generic_hub(&case.name, link),
        }
    }

    fn load_named_hub(&self, name: &str, library: &HubLibrary) -> Result<ModelHandle> {
        let candidates: &[&str] = match library {
            HubLibrary::Transformers => &["model.onnx", "onnx/model.onnx"],
            HubLibrary::SentenceTransformers => &["onnx/model.onnx", "model.onnx"],
            HubLibrary::Other(tag) => {
                return Err(HarnessError::Config {
                    row: format!("{name},hf_{tag}"),
                    detail: format!("unsupported hub library `{tag}`"),
                }
                .into())
            }
        };

        // Without HF_TOKEN the builder keeps the token stored by the hub CLI.
        let mut builder =
            hf_hub::api::sync::ApiBuilder::new().with_cache_dir(self.config.hf_cache_dir.clone());
        if let Some(token) = hub_token(std::env::var("HF_TOKEN").ok()) {
            builder = builder.with_token(Some(token));
        }
        let api = builder.build().context("failed to create hub client")?;
        let repo = api.model(name.to_string());

        let mut last_err = None;
        for file in candidates {
            match repo.get(file) {
                Ok(path) => {
                    debug!(model = name, file, "fetched graph from named hub");
                    let model = load_model(&path)?;
                    let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
                    return Ok(ModelHandle::Callable(Signature::new(
                        NAMED_HUB_SIGNATURE,
                        model,
                        root,
                    )?));
                }
                Err(err) => last_err = Some(anyhow!("{name}/{file}: {err}")),
            }
        }
        let err = last_err.unwrap_or_else(|| anyhow!("no graph candidates for {library}"));
        Err(err.context(format!("no {library} graph found for `{name}`")))
    }

    fn load_archive(&self, name: &str, url: &str) -> Result<ModelHandle> {
        let layout = archive_layout(self.work_dir, url)?;
        if layout == ArchiveLayout::Other {
            debug!(model = name, url, "artifact is not a graph file, trying hub loader");
            return self.load_generic_hub(name, url);
        }
        run_tool("wget", &["-nv", url], self.work_dir)?;
        self.open_archive(&layout)
    }

    /// Loads the graph of an archive already downloaded into the work dir.
    fn open_archive(&self, layout: &ArchiveLayout) -> Result<ModelHandle> {
        let graph = match layout {
            ArchiveLayout::Compressed { archive, graph } => {
                run_tool("tar", &["-xvzf", archive.as_str()], self.work_dir)?;
                ensure!(graph.is_file(), "archive {archive} has no {FROZEN_GRAPH_FILE}");
                graph
            }
            ArchiveLayout::Graph(graph) => graph,
            ArchiveLayout::Other => bail!("artifact holds no graph file"),
        };
        Ok(ModelHandle::StaticGraph(FrozenGraph::load(graph)?))
    }

    fn load_generic_hub(&self, name: &str, link: &str) -> Result<ModelHandle> {
        let root = self.resolve_bundle(link)?;
        let bundle = Bundle::open(&root)?;
        let Some(key) = bundle.default_signature_key() else {
            return Err(HarnessError::MissingSignature {
                model: name.to_string(),
                link: link.to_string(),
            }
            .into());
        };
        debug!(model = name, signature = key, "selected signature");
        Ok(ModelHandle::Callable(bundle.signature(key)?))
    }

    /// Local bundles are used in place; remote ones are downloaded into the
    /// hub cache once and reused until the cache is cleared.
    fn resolve_bundle(&self, link: &str) -> Result<PathBuf> {
        if !(link.starts_with("http://") || link.starts_with("https://")) {
            return Ok(PathBuf::from(link.strip_prefix("file://").unwrap_or(link)));
        }

        let cache = &self.config.hub_cache_dir;
        let target = cache.join(cache_key(link));
        if target.is_dir() {
            return Ok(target);
        }

        std::fs::create_dir_all(&target)
            .with_context(|| format!("failed to create {}", target.display()))?;
        let archive = cache.join(format!("{}{ARCHIVE_SUFFIX}", cache_key(link)));
        let archive_arg = archive.to_string_lossy().into_owned();
        let target_arg = target.to_string_lossy().into_owned();

        let url = bundle_download_url(link);
        let fetched = run_tool("wget", &["-nv", "-O", archive_arg.as_str(), url.as_str()], cache)
            .and_then(|()| run_tool("tar", &["-xzf", archive_arg.as_str(), "-C", target_arg.as_str()], cache));
        let _ = std::fs::remove_file(&archive);
        if let Err(err) = fetched {
            let _ = std::fs::remove_dir_all(&target);
            return Err(err);
        }
        Ok(target)
    }

    /// Loads a frozen graph that is already on disk.
    pub fn load_frozen_graph(path: &Path) -> Result<ModelHandle> {
        Ok(ModelHandle::StaticGraph(FrozenGraph::load(path)?))
    }
}

/// Where the graph of a downloaded archive url ends up.
#[derive(Debug, PartialEq, Eq)]
enum ArchiveLayout {
    /// A `.tar.gz` to extract; the graph sits in the directory named by its stem.
    Compressed { archive: String, graph: PathBuf },
    Graph(PathBuf),
    /// Anything else is handed to the generic hub loader.
    Other,
}

fn archive_layout(work_dir: &Path, url: &str) -> Result<ArchiveLayout> {
    let file_name = url
        .rsplit('/')
        .next()
        .filter(|f| !f.is_empty())
        .with_context(|| format!("cannot derive a file name from {url}"))?;

    if let Some(stem) = file_name.strip_suffix(ARCHIVE_SUFFIX) {
        return Ok(ArchiveLayout::Compressed {
            archive: file_name.to_string(),
            graph: work_dir.join(stem).join(FROZEN_GRAPH_FILE),
        });
    }
    let path = work_dir.join(file_name);
    Ok(match path.extension().and_then(|e| e.to_str()) {
        Some("onnx") => ArchiveLayout::Graph(path),
        _ => ArchiveLayout::Other,
    })
}

/// tfhub.dev serves an html page unless the compressed bundle is asked for.
fn bundle_download_url(link: &str) -> String {
    if link.contains("tfhub.dev/") && !link.contains('?') {
        format!("{link}?{TFHUB_COMPRESSED_QUERY}")
    } else {
        link.to_string()
    }
}

fn hub_token(value: Option<String>) -> Option<String> {
    value.filter(|token| !token.trim().is_empty())
}

fn cache_key(link: &str) -> String {
    let trimmed = link
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    trimmed
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Runs an external tool in `cwd`; a non-zero exit status fails the case.
pub fn run_tool(program: &str, args: &[&str], cwd: &Path) -> Result<()> {
    debug!(program, ?args, cwd = %cwd.display(), "running tool");
    let status = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .status()
        .with_context(|| format!("failed to spawn `{program}`"))?;
    if !status.success() {
        bail!(HarnessError::Subprocess {
            program: program.to_string(),
            status: status.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use convcheck_core::DType;
    use convcheck_onnx::{save_model, GraphBuilder};

    use super::*;

    #[test]
    fn cache_keys_are_path_safe() {
        assert_eq!(
            cache_key("https://tfhub.dev/google/imagenet/mobilenet_v2/5"),
            "tfhub_dev_google_imagenet_mobilenet_v2_5"
        );
    }

    #[test]
    fn failing_tool_reports_subprocess_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_tool("tar", &["-xzf", "does-not-exist.tar.gz"], dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::Subprocess { .. })
        ));
    }

    fn write_graph(path: &Path) -> Result<()> {
        let mut b = GraphBuilder::new("identity");
        b.input("x", DType::F32, &[1, 2])
            .node("Relu", &["x"], &["y"], vec![])
            .output("y", DType::F32, &[1, 2]);
        save_model(&b.finish("loader-test"), path)
    }

    struct Dirs {
        hub: tempfile::TempDir,
        hf: tempfile::TempDir,
        work: tempfile::TempDir,
    }

    impl Dirs {
        fn new() -> Result<Self> {
            Ok(Self {
                hub: tempfile::tempdir()?,
                hf: tempfile::tempdir()?,
                work: tempfile::tempdir()?,
            })
        }

        fn config(&self) -> HarnessConfig {
            HarnessConfig::new(self.hub.path(), self.hf.path())
        }
    }

    #[test]
    fn archive_layouts() -> Result<()> {
        let work = Path::new("/work");
        assert_eq!(
            archive_layout(work, "https://storage.example.org/zoo/ssd_2018.tar.gz")?,
            ArchiveLayout::Compressed {
                archive: "ssd_2018.tar.gz".to_string(),
                graph: work.join("ssd_2018").join(FROZEN_GRAPH_FILE),
            }
        );
        assert_eq!(
            archive_layout(work, "https://storage.example.org/zoo/resnet.onnx")?,
            ArchiveLayout::Graph(work.join("resnet.onnx"))
        );
        assert_eq!(
            archive_layout(work, "https://storage.example.org/zoo/resnet.pb")?,
            ArchiveLayout::Other
        );
        assert!(archive_layout(work, "https://storage.example.org/zoo/").is_err());
        Ok(())
    }

    #[test]
    fn compressed_archive_is_extracted_and_loaded() -> Result<()> {
        let dirs = Dirs::new()?;
        let staging = tempfile::tempdir()?;
        std::fs::create_dir(staging.path().join("detector"))?;
        write_graph(&staging.path().join("detector").join(FROZEN_GRAPH_FILE))?;
        let archive = dirs.work.path().join("detector.tar.gz");
        let archive_arg = archive.to_string_lossy().into_owned();
        run_tool("tar", &["-czf", archive_arg.as_str(), "detector"], staging.path())?;

        let config = dirs.config();
        let loader = ModelLoader::new(&config, dirs.work.path());
        let layout = archive_layout(dirs.work.path(), "https://storage.example.org/zoo/detector.tar.gz")?;
        let handle = loader.open_archive(&layout)?;
        assert_eq!(handle.kind(), "static graph");
        assert_eq!(handle.input_signature()[0].name.as_str(), "x");
        Ok(())
    }

    #[test]
    fn archive_without_graph_is_reported() -> Result<()> {
        let dirs = Dirs::new()?;
        let staging = tempfile::tempdir()?;
        std::fs::create_dir(staging.path().join("detector"))?;
        std::fs::write(staging.path().join("detector/frozen_inference_graph.pb"), b"graph")?;
        let archive = dirs.work.path().join("detector.tar.gz");
        let archive_arg = archive.to_string_lossy().into_owned();
        run_tool("tar", &["-czf", archive_arg.as_str(), "detector"], staging.path())?;

        let config = dirs.config();
        let loader = ModelLoader::new(&config, dirs.work.path());
        let layout = archive_layout(dirs.work.path(), "https://storage.example.org/zoo/detector.tar.gz")?;
        let err = loader.open_archive(&layout).err().context("archive has no onnx graph")?;
        assert!(err.to_string().contains(FROZEN_GRAPH_FILE), "{err}");
        Ok(())
    }

    #[test]
    fn downloaded_graph_is_loaded_in_place() -> Result<()> {
        let dirs = Dirs::new()?;
        write_graph(&dirs.work.path().join("resnet.onnx"))?;
        let config = dirs.config();
        let loader = ModelLoader::new(&config, dirs.work.path());
        let layout = archive_layout(dirs.work.path(), "https://storage.example.org/zoo/resnet.onnx")?;
        assert_eq!(loader.open_archive(&layout)?.kind(), "static graph");
        Ok(())
    }

    #[test]
    fn cached_remote_bundle_is_reused() -> Result<()> {
        let dirs = Dirs::new()?;
        let link = "https://hub.example.org/org/encoder/1";
        let cached = dirs.hub.path().join(cache_key(link));
        std::fs::create_dir(&cached)?;
        write_graph(&cached.join("serving_default.onnx"))?;

        let config = dirs.config();
        let loader = ModelLoader::new(&config, dirs.work.path());
        let handle = loader.load_generic_hub("encoder", link)?;
        assert_eq!(handle.kind(), "callable");
        Ok(())
    }

    #[test]
    fn failed_fetch_leaves_no_partial_bundle() -> Result<()> {
        let dirs = Dirs::new()?;
        let link = "http://127.0.0.1:9/bundle.tar.gz";
        let config = dirs.config();
        let loader = ModelLoader::new(&config, dirs.work.path());

        assert!(loader.resolve_bundle(link).is_err());
        assert!(!dirs.hub.path().join(cache_key(link)).exists());
        assert_eq!(std::fs::read_dir(dirs.hub.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn tfhub_links_request_compressed_bundles() {
        assert_eq!(
            bundle_download_url("https://tfhub.dev/google/elmo/3"),
            "https://tfhub.dev/google/elmo/3?tf-hub-format=compressed"
        );
        assert_eq!(
            bundle_download_url("https://tfhub.dev/google/elmo/3?tf-hub-format=compressed"),
            "https://tfhub.dev/google/elmo/3?tf-hub-format=compressed"
        );
        assert_eq!(
            bundle_download_url("https://hub.example.org/bundle.tar.gz"),
            "https://hub.example.org/bundle.tar.gz"
        );
    }

    #[test]
    fn unset_or_blank_token_keeps_stored_login() {
        assert_eq!(hub_token(None), None);
        assert_eq!(hub_token(Some("  ".to_string())), None);
        assert_eq!(hub_token(Some("hf_abc".to_string())), Some("hf_abc".to_string()));
    }
}
