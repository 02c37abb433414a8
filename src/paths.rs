use std::path::{Component, Path, PathBuf};

use crate::error::AppError;

/// A request path that has been checked against the work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Absolute filesystem path, always inside the work directory
    pub absolute: PathBuf,
    /// Cleaned forward-slash path relative to the work directory; empty for the root
    pub relative: String,
}

impl ResolvedPath {
    pub fn is_root(&self) -> bool {
        self.relative.is_empty()
    }
}

/// Maps untrusted request paths onto the work directory.
///
/// Resolution is lexical: `.` is dropped and `..` pops the previous component. A `..` with
/// nothing left to pop would climb above the root and is rejected. Backslashes are treated as
/// separators on every platform.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// `root` must already be absolute (the config layer canonicalizes it).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, request_path: &str) -> Result<ResolvedPath, AppError> {
        let unified = request_path.replace('\\', "/");
        let trimmed = unified.strip_prefix('/').unwrap_or(&unified);

        let mut segments: Vec<String> = Vec::new();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir => {
                    if segments.pop().is_none() {
                        return Err(AppError::PathTraversal);
                    }
                }
                Component::Prefix(_) => return Err(AppError::PathTraversal),
            }
        }

        let mut absolute = self.root.clone();
        absolute.extend(&segments);

        // Lexical containment check on the final path, after normalization.
        if !absolute.starts_with(&self.root) {
            return Err(AppError::PathTraversal);
        }

        Ok(ResolvedPath {
            absolute,
            relative: segments.join("/"),
        })
    }
}
