// Path confinement for tool-initiated filesystem access

use crate::error::{GatewayError, GatewayResult};
use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};

/// Root directory that every tool path must stay inside
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Create the root directory if needed and pin it to its canonical form.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create sandbox root {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve sandbox root {}", root.display()))?;

        tracing::info!("Sandbox root: {}", root.display());
        Ok(Self { root })
    }

    /// Use `root` as given, normalized lexically, without touching the filesystem.
    pub fn lexical(root: impl AsRef<Path>) -> Self {
        Self {
            root: normalize(root.as_ref()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a tool-supplied path against the root.
    ///
    /// Resolution is purely lexical; no syscall happens before the prefix
    /// check. Absolute inputs are accepted only if they already lie inside
    /// the root.
    pub fn resolve(&self, input: &str) -> GatewayResult<PathBuf> {
        let resolved = normalize(&self.root.join(input.trim()));

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            tracing::warn!(path = input, "Rejected path outside sandbox");
            Err(GatewayError::SandboxViolation {
                path: input.to_string(),
            })
        }
    }

    /// Render a resolved path relative to the root, `.` for the root itself.
    pub fn display(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(relative) if relative.as_os_str().is_empty() => ".".to_string(),
            Ok(relative) => relative.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}
