use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Local directory that receives downloaded artifacts, their `.sum` sidecars
/// and the raw search dump.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve against the current directory and create it if missing.
    pub fn init(raw: &Path) -> Result<Self> {
        let root = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
            cwd.join(raw)
        };
        fs::create_dir_all(&root).map_err(|e| {
            Error::msg(format!("failed to create work dir {}: {e}", root.display()))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path for a bare file name. Names come from remote listings, so anything
    /// that could step outside the work dir is refused.
    pub fn file(&self, name: &str) -> Result<PathBuf> {
        validate_file_name(name)?;
        Ok(self.root.join(name))
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.file(name)?.exists())
    }
}

pub fn validate_file_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::msg("file name is empty"));
    }
    let mut comps = Path::new(name).components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::msg(format!(
            "invalid file name '{}' (must be a single path segment)",
            name
        ))),
    }
}

/// Last `/`-separated segment of a repository path.
pub fn file_name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
