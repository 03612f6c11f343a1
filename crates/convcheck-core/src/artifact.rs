use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;

/// A converted model ready to be loaded by a target backend.
#[derive(Clone, Debug)]
pub enum ModelArtifact {
    OnnxPath(PathBuf),
    OnnxBytes(Bytes),
}

/// Domain of the public artifact storage that serves frozen-graph archives.
pub const DEFAULT_STORAGE_DOMAINS: &[&str] = &["storage.openvinotoolkit.org"];

const NAMED_HUB_PREFIX: &str = "hf_";

/// Model library served by the named hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HubLibrary {
    Transformers,
    SentenceTransformers,
    Other(String),
}

impl HubLibrary {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "transformers" => HubLibrary::Transformers,
            "sentence-transformers" => HubLibrary::SentenceTransformers,
            other => HubLibrary::Other(other.to_string()),
        }
    }
}

impl fmt::Display for HubLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubLibrary::Transformers => f.write_str("transformers"),
            HubLibrary::SentenceTransformers => f.write_str("sentence-transformers"),
            HubLibrary::Other(tag) => f.write_str(tag),
        }
    }
}

/// How a model link is sourced. Resolved once when the case is parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// `hf_<library>`: the model name is a repository id on the named hub.
    NamedHub(HubLibrary),
    /// A direct URL on a recognized artifact storage domain.
    ArchiveUrl(String),
    /// Anything else: a hub bundle URL or a local bundle directory.
    GenericHub(String),
}

impl SourceKind {
    pub fn parse(link: &str) -> Self {
        Self::parse_with_domains(link, DEFAULT_STORAGE_DOMAINS)
    }

    pub fn parse_with_domains<S: AsRef<str>>(link: &str, storage_domains: &[S]) -> Self {
        if let Some(tag) = link.strip_prefix(NAMED_HUB_PREFIX) {
            return SourceKind::NamedHub(HubLibrary::from_tag(tag));
        }
        if storage_domains.iter().any(|d| link.contains(d.as_ref())) {
            return SourceKind::ArchiveUrl(link.to_string());
        }
        SourceKind::GenericHub(link.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_hub_prefix_selects_library() {
        assert_eq!(
            SourceKind::parse("hf_transformers"),
            SourceKind::NamedHub(HubLibrary::Transformers)
        );
        assert_eq!(
            SourceKind::parse("hf_sentence-transformers"),
            SourceKind::NamedHub(HubLibrary::SentenceTransformers)
        );
        assert_eq!(
            SourceKind::parse("hf_timm"),
            SourceKind::NamedHub(HubLibrary::Other("timm".into()))
        );
    }

    #[test]
    fn storage_domain_selects_archive() {
        let link = "https://storage.openvinotoolkit.org/models/ssd.tar.gz";
        assert_eq!(SourceKind::parse(link), SourceKind::ArchiveUrl(link.into()));
    }

    #[test]
    fn unrecognized_links_fall_through_to_generic_hub() {
        for link in ["https://tfhub.dev/google/imagenet/mobilenet_v2/5", "/models/local", "hf"] {
            assert_eq!(SourceKind::parse(link), SourceKind::GenericHub(link.into()));
        }
    }

    #[test]
    fn storage_domains_are_configurable() {
        let link = "https://mirror.example.org/a.onnx";
        assert_eq!(
            SourceKind::parse_with_domains(link, &["mirror.example.org"]),
            SourceKind::ArchiveUrl(link.into())
        );
    }
}
