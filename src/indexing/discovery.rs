use crate::core::error::{Error, Result};
use ignore::WalkBuilder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Case-insensitive set of file extensions; empty accepts every file
#[derive(Debug, Clone, Default)]
pub struct ExtensionFilter {
    extensions: HashSet<String>,
}

impl ExtensionFilter {
    /// Accepts `md`, `.md` and `MD` alike
    pub fn new<S: AsRef<str>>(extensions: &[S]) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|e| e.as_ref().trim().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.contains(&ext.to_lowercase()))
            .unwrap_or(false)
    }
}

/// Find files under `root` whose extension passes the filter, respecting .gitignore rules.
///
/// Results are sorted so chunk ids are assigned in a stable order.
pub fn scan_directory(root: &Path, filter: &ExtensionFilter, recursive: bool) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Err(Error::InvalidInput(format!(
            "Directory does not exist: {}",
            root.display()
        )));
    }

    if !root.is_dir() {
        return Err(Error::InvalidInput(format!(
            "Path is not a directory: {}",
            root.display()
        )));
    }

    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(false)
        .git_ignore(true)
        .git_exclude(true);
    if !recursive {
        builder.max_depth(Some(1));
    }

    let mut files = Vec::new();
    for result in builder.build() {
        match result {
            Ok(entry) => {
                let path = entry.path();
                if path.is_dir() {
                    continue;
                }
                if filter.matches(path) {
                    files.push(path.to_path_buf());
                }
            }
            Err(err) => {
                // Some files might be inaccessible
                warn!(error = %err, "Failed to access file during scan");
            }
        }
    }

    files.sort();
    Ok(files)
}
