use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};

use crate::{HarnessError, SourceKind};

/// Expected-failure marker attached to a test case.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mark {
    None,
    Skip,
    Xfail,
}

impl Mark {
    /// Accepts an empty value, `skip` or `xfail`; anything else names the offending row.
    pub fn parse(raw: &str, row: &str) -> Result<Self, HarnessError> {
        match raw.trim() {
            "" => Ok(Mark::None),
            "skip" => Ok(Mark::Skip),
            "xfail" => Ok(Mark::Xfail),
            other => Err(HarnessError::Config {
                row: row.to_string(),
                detail: format!("unknown failure mark `{other}`"),
            }),
        }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mark::None => f.write_str("none"),
            Mark::Skip => f.write_str("skip"),
            Mark::Xfail => f.write_str("xfail"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub link: String,
    pub source: SourceKind,
    pub mark: Mark,
    pub reason: String,
}

impl TestCase {
    pub fn new(name: &str, link: &str) -> Self {
        Self {
            name: name.to_string(),
            link: link.to_string(),
            source: SourceKind::parse(link),
            mark: Mark::None,
            reason: String::new(),
        }
    }

    pub fn with_mark(mut self, mark: Mark, reason: &str) -> Self {
        self.mark = mark;
        self.reason = reason.to_string();
        self
    }

    pub fn id(&self) -> String {
        format!("{}[{}]", self.name, self.link)
    }
}

/// Reads a model list file: one `name,link[,mark,reason]` row per line.
pub fn load_models_list(path: &Path, storage_domains: &[String]) -> Result<Vec<TestCase>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read model list {}", path.display()))?;
    Ok(parse_models_list(&text, storage_domains)?)
}

/// Parses model list rows. Blank lines and `#` comments are ignored; a row
/// must carry either two or four comma separated fields.
pub fn parse_models_list(
    text: &str,
    storage_domains: &[String],
) -> Result<Vec<TestCase>, HarnessError> {
    let mut cases = Vec::new();
    for line in text.lines() {
        let row = line.trim();
        if row.is_empty() || row.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = row.split(',').map(str::trim).collect();
        let (name, link, mark, reason) = match fields.as_slice() {
            [name, link] => (*name, *link, Mark::None, ""),
            [name, link, mark, reason] => {
                let mark = Mark::parse(mark, row)?;
                if mark == Mark::None {
                    return Err(HarnessError::Config {
                        row: row.to_string(),
                        detail: "a four-field row must carry `skip` or `xfail`".into(),
                    });
                }
                (*name, *link, mark, *reason)
            }
            _ => {
                return Err(HarnessError::Config {
                    row: row.to_string(),
                    detail: format!("expected 2 or 4 fields, got {}", fields.len()),
                })
            }
        };

        if name.is_empty() || link.is_empty() {
            return Err(HarnessError::Config {
                row: row.to_string(),
                detail: "model name and link must not be empty".into(),
            });
        }

        cases.push(TestCase {
            name: name.to_string(),
            link: link.to_string(),
            source: SourceKind::parse_with_domains(link, storage_domains),
            mark,
            reason: reason.to_string(),
        });
    }
    Ok(cases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HubLibrary, DEFAULT_STORAGE_DOMAINS};

    fn domains() -> Vec<String> {
        DEFAULT_STORAGE_DOMAINS.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn parses_rows_comments_and_marks() {
        let text = "\
# precommit models
bert-base-uncased,hf_transformers

mobilenet,https://tfhub.dev/google/mobilenet/5,skip,too slow for precommit
ssd,https://storage.openvinotoolkit.org/ssd.tar.gz,xfail,known accuracy issue
";
        let cases = parse_models_list(text, &domains()).unwrap();
        assert_eq!(cases.len(), 3);
        assert_eq!(cases[0].source, SourceKind::NamedHub(HubLibrary::Transformers));
        assert_eq!(cases[0].mark, Mark::None);
        assert_eq!(cases[1].mark, Mark::Skip);
        assert_eq!(cases[1].reason, "too slow for precommit");
        assert!(matches!(cases[2].source, SourceKind::ArchiveUrl(_)));
        assert_eq!(cases[2].mark, Mark::Xfail);
    }

    #[test]
    fn malformed_mark_names_the_row() {
        let err = parse_models_list("m,https://x/y,flaky,sometimes", &domains()).unwrap_err();
        match err {
            HarnessError::Config { row, .. } => assert_eq!(row, "m,https://x/y,flaky,sometimes"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        assert!(parse_models_list("only-a-name", &domains()).is_err());
        assert!(parse_models_list("a,b,skip", &domains()).is_err());
    }

    #[test]
    fn reads_list_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("precommit");
        std::fs::write(&path, "m,/bundles/m\n")?;
        let cases = load_models_list(&path, &domains())?;
        assert_eq!(cases, vec![TestCase::new("m", "/bundles/m")]);
        Ok(())
    }
}
