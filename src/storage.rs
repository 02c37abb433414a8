use std::fs::Metadata;
use std::io::ErrorKind;

use tokio::fs;

use crate::error::AppError;
use crate::models::FileEntry;
use crate::paths::{PathResolver, ResolvedPath};

/// Filesystem access for the work directory. Every path goes through the resolver first.
#[derive(Debug, Clone)]
pub struct Storage {
    resolver: PathResolver,
}

impl Storage {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    pub fn resolve(&self, request_path: &str) -> Result<ResolvedPath, AppError> {
        self.resolver.resolve(request_path)
    }

    /// Metadata for an existing path. Missing paths become `NotFound`; other
    /// failures (permissions) become `BadRequest` without the OS error text.
    pub async fn stat(&self, target: &ResolvedPath) -> Result<Metadata, AppError> {
        match fs::metadata(&target.absolute).await {
            Ok(meta) => Ok(meta),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found(target)),
            Err(e) => {
                tracing::warn!(path = %target.absolute.display(), error = %e, "stat failed");
                Err(AppError::BadRequest(format!(
                    "'{}' is not accessible",
                    display_name(target)
                )))
            }
        }
    }

    /// Immediate children of a directory, in the order the OS returns them.
    pub async fn list_children(&self, dir: &ResolvedPath) -> Result<Vec<FileEntry>, AppError> {
        let mut reader = fs::read_dir(&dir.absolute)
            .await
            .map_err(|e| AppError::internal("failed to open directory", e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| AppError::internal("failed to read directory", e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Follows symlinks; a dangling link is listed as a plain file.
            let meta = fs::metadata(entry.path()).await.ok();
            let is_dir = meta.as_ref().map(|m| m.is_dir()).unwrap_or(false);
            let size = meta.filter(|m| m.is_file()).map(|m| m.len());

            let href = if dir.relative.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", dir.relative, name)
            };
            entries.push(FileEntry { name, href, is_dir, size });
        }
        Ok(entries)
    }

    /// Open a regular file for streaming.
    pub async fn open_file(&self, target: &ResolvedPath) -> Result<(fs::File, Metadata), AppError> {
        let meta = self.stat(target).await?;
        if meta.is_dir() {
            return Err(AppError::BadRequest(format!(
                "'{}' is a directory",
                display_name(target)
            )));
        }
        let file = fs::File::open(&target.absolute)
            .await
            .map_err(|e| AppError::internal("failed to open file", e))?;
        Ok((file, meta))
    }

    /// Remove a file, or a directory with everything below it.
    pub async fn delete(&self, target: &ResolvedPath) -> Result<(), AppError> {
        if target.is_root() {
            return Err(AppError::BadRequest(
                "the work directory itself cannot be deleted".to_string(),
            ));
        }

        let meta = self.stat(target).await?;
        if meta.is_dir() {
            fs::remove_dir_all(&target.absolute)
                .await
                .map_err(|e| AppError::internal("failed to delete directory", e))?;
        } else {
            fs::remove_file(&target.absolute)
                .await
                .map_err(|e| AppError::internal("failed to delete file", e))?;
        }

        tracing::info!(path = %target.relative, dir = meta.is_dir(), "deleted");
        Ok(())
    }

    /// Create a new, empty destination file `file_name` inside `dir`, creating missing
    /// parent directories. Never truncates an existing file. The file is removed again
    /// unless the returned [`PendingUpload`] is committed.
    pub async fn create_upload_target(
        &self,
        dir: &ResolvedPath,
        file_name: &str,
    ) -> Result<(fs::File, PendingUpload), AppError> {
        let joined = if dir.relative.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", dir.relative, file_name)
        };
        let target = self.resolve(&joined)?;
        if target.absolute.parent() != Some(dir.absolute.as_path()) {
            return Err(AppError::BadRequest(format!("invalid file name '{}'", file_name)));
        }

        if fs::try_exists(&target.absolute).await.unwrap_or(false) {
            return Err(AppError::FileExists(target.relative));
        }

        fs::create_dir_all(&dir.absolute)
            .await
            .map_err(|e| AppError::internal("failed to create destination directory", e))?;

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target.absolute)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => AppError::FileExists(target.relative.clone()),
                _ => AppError::internal("failed to create file", e),
            })?;

        Ok((file, PendingUpload { target, committed: false }))
    }
}

/// An upload file created by this request. Dropping it uncommitted deletes the file, which
/// also covers a handler future dropped mid-stream (response timeout, client disconnect).
#[derive(Debug)]
pub struct PendingUpload {
    target: ResolvedPath,
    committed: bool,
}

impl PendingUpload {
    pub fn target(&self) -> &ResolvedPath {
        &self.target
    }

    /// Keep the file on disk.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.target.absolute) {
            Ok(()) => tracing::debug!(path = %self.target.relative, "removed unfinished upload"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.target.absolute.display(), error = %e, "failed to remove unfinished upload")
            }
        }
    }
}

fn not_found(target: &ResolvedPath) -> AppError {
    AppError::NotFound(display_name(target).to_string())
}

fn display_name(target: &ResolvedPath) -> &str {
    if target.relative.is_empty() {
        "/"
    } else {
        &target.relative
    }
}

pub fn human_readable_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;
    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }
    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> Storage {
        Storage::new(PathResolver::new(dir.path().canonicalize().unwrap()))
    }

    #[tokio::test]
    async fn delete_directory_removes_contents() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("tree/inner")).unwrap();
        std::fs::write(dir.path().join("tree/a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("tree/inner/b.txt"), "b").unwrap();

        let storage = storage(&dir);
        let target = storage.resolve("tree").unwrap();
        storage.delete(&target).await.unwrap();
        assert!(!dir.path().join("tree").exists());
    }

    #[tokio::test]
    async fn delete_missing_path_is_not_found_and_touches_nothing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "k").unwrap();

        let storage = storage(&dir);
        let target = storage.resolve("ghost.txt").unwrap();
        let err = storage.delete(&target).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(std::fs::read_to_string(dir.path().join("keep.txt")).unwrap(), "k");
    }

    #[tokio::test]
    async fn root_cannot_be_deleted() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let target = storage.resolve("/").unwrap();
        assert!(matches!(storage.delete(&target).await, Err(AppError::BadRequest(_))));
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn upload_target_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.txt"), "original").unwrap();

        let storage = storage(&dir);
        let root = storage.resolve("").unwrap();
        let err = storage.create_upload_target(&root, "b.txt").await.unwrap_err();
        assert!(matches!(err, AppError::FileExists(_)));
        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "original");
    }

    #[tokio::test]
    async fn upload_target_creates_intermediate_dirs() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let dest = storage.resolve("x/y").unwrap();
        let (_file, pending) = storage.create_upload_target(&dest, "c.bin").await.unwrap();
        assert_eq!(pending.target().relative, "x/y/c.bin");
        assert!(dir.path().join("x/y/c.bin").is_file());
    }

    #[tokio::test]
    async fn uncommitted_upload_is_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let root = storage.resolve("").unwrap();

        let (file, pending) = storage.create_upload_target(&root, "gone.bin").await.unwrap();
        drop(file);
        drop(pending);
        assert!(!dir.path().join("gone.bin").exists());

        let (file, pending) = storage.create_upload_target(&root, "kept.bin").await.unwrap();
        drop(file);
        pending.commit();
        assert!(dir.path().join("kept.bin").is_file());
    }

    #[tokio::test]
    async fn open_file_rejects_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let storage = storage(&dir);
        let target = storage.resolve("sub").unwrap();
        assert!(matches!(storage.open_file(&target).await, Err(AppError::BadRequest(_))));
    }

    #[test]
    fn sizes_are_humanized() {
        assert_eq!(human_readable_size(512), "512 B");
        assert_eq!(human_readable_size(2048), "2.00 KB");
    }
}
