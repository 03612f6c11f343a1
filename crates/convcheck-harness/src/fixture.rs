use std::path::Path;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::HarnessConfig;

/// What to do when removing an entry of a cache directory fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Log the failure and keep going.
    IgnoreErrors,
    /// Stop at the first failure and return it.
    Propagate,
}

/// Removes everything inside `dir`, leaving the directory itself in place.
/// A missing directory is already clean.
pub fn clean_dir(dir: &Path, policy: CleanupPolicy) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if policy == CleanupPolicy::IgnoreErrors => {
            warn!(dir = %dir.display(), error = %err, "cannot list cache directory");
            return Ok(());
        }
        Err(err) => return Err(err).with_context(|| format!("cannot list {}", dir.display())),
    };

    for entry in entries {
        let removed = entry.map_err(anyhow::Error::from).and_then(|entry| {
            let path = entry.path();
            let removal = if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            removal.with_context(|| format!("cannot remove {}", path.display()))
        });

        if let Err(err) = removed {
            match policy {
                CleanupPolicy::IgnoreErrors => {
                    warn!(dir = %dir.display(), error = %err, "skipping cache entry")
                }
                CleanupPolicy::Propagate => return Err(err),
            }
        }
    }
    Ok(())
}

/// Owns the scratch directory of a suite and resets the download caches
/// after every case.
pub struct Fixture {
    config: HarnessConfig,
    work_dir: TempDir,
}

impl Fixture {
    /// Creates the work directory shared by all cases of a suite.
    pub fn setup_class(config: HarnessConfig) -> Result<Self> {
        let work_dir = tempfile::Builder::new()
            .prefix("convcheck-")
            .tempdir()
            .context("failed to create work directory")?;
        debug!(work_dir = %work_dir.path().display(), "suite work directory created");
        Ok(Self { config, work_dir })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    /// Clears the generic hub cache and the named hub cache. Never fails.
    pub fn teardown_case(&self) {
        for dir in [&self.config.hub_cache_dir, &self.config.hf_cache_dir] {
            // IgnoreErrors never returns an error.
            let _ = clean_dir(dir, CleanupPolicy::IgnoreErrors);
        }
        debug!("case caches cleared");
    }

    /// Guard that runs [`Fixture::teardown_case`] when dropped, including on
    /// early returns and panics.
    pub fn case_scope(&self) -> CaseScope<'_> {
        CaseScope { fixture: self }
    }
}

pub struct CaseScope<'a> {
    fixture: &'a Fixture,
}

impl Drop for CaseScope<'_> {
    fn drop(&mut self) {
        self.fixture.teardown_case();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir.join("models--org--name/snapshots"))?;
        std::fs::write(dir.join("models--org--name/snapshots/model.onnx"), b"graph")?;
        std::fs::write(dir.join("stale.lock"), b"")?;
        Ok(())
    }

    #[test]
    fn clean_dir_empties_but_keeps_directory() -> Result<()> {
        let root = tempfile::tempdir()?;
        populate(root.path())?;
        clean_dir(root.path(), CleanupPolicy::Propagate)?;
        assert!(root.path().exists());
        assert_eq!(std::fs::read_dir(root.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn clean_dir_is_idempotent() -> Result<()> {
        let root = tempfile::tempdir()?;
        clean_dir(root.path(), CleanupPolicy::Propagate)?;
        clean_dir(root.path(), CleanupPolicy::Propagate)?;
        clean_dir(&root.path().join("absent"), CleanupPolicy::Propagate)?;
        Ok(())
    }

    #[test]
    fn scope_clears_both_caches_on_drop() -> Result<()> {
        let hub = tempfile::tempdir()?;
        let hf = tempfile::tempdir()?;
        populate(hub.path())?;
        populate(hf.path())?;

        let fixture = Fixture::setup_class(HarnessConfig::new(hub.path(), hf.path()))?;
        {
            let _scope = fixture.case_scope();
        }
        assert_eq!(std::fs::read_dir(hub.path())?.count(), 0);
        assert_eq!(std::fs::read_dir(hf.path())?.count(), 0);
        assert!(fixture.work_dir().exists());
        Ok(())
    }
}
