//! File relocation primitives used by every stage transition.
//!
//! All destructive operations run under one lock so two job tasks touching
//! overlapping paths (an operator dropping a duplicate job, for instance)
//! never interleave partial deletes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

/// File operation errors.
#[derive(Debug, Error)]
pub enum FileOpsError {
    #[error("Source directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("Failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> FileOpsError + 'a {
    move |source| FileOpsError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Serialized copy / move / delete operations.
#[derive(Debug, Default)]
pub struct FileOps {
    lock: Mutex<()>,
}

impl FileOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies every file of `src` into `dst` (created if absent).
    ///
    /// With `overwrite`, a same-named file already in `dst` is deleted first;
    /// without it, that file is left alone and the source copy is skipped.
    /// With `delete_source`, each source file is removed after copying and
    /// finally the source directory itself. Subdirectories are handled
    /// recursively. Returns the number of files copied.
    pub fn move_directory_contents(
        &self,
        src: &Path,
        dst: &Path,
        delete_source: bool,
        overwrite: bool,
    ) -> Result<usize, FileOpsError> {
        let _guard = self.lock.lock();
        if !src.is_dir() {
            return Err(FileOpsError::MissingDirectory(src.to_path_buf()));
        }
        let copied = copy_tree(src, dst, overwrite)?;
        if delete_source {
            remove_tree(src)?;
        }
        debug!(
            src = %src.display(),
            dst = %dst.display(),
            files = copied,
            delete_source,
            "Moved directory contents"
        );
        Ok(copied)
    }

    /// Copies one file, replacing any existing destination.
    pub fn copy_file(&self, src: &Path, dst: &Path) -> Result<(), FileOpsError> {
        let _guard = self.lock.lock();
        replace_file(src, dst)
    }

    /// Clears read-only flags and deletes `path` with everything under it.
    /// A missing directory is not an error.
    pub fn delete_directory(&self, path: &Path) -> Result<(), FileOpsError> {
        let _guard = self.lock.lock();
        if !path.exists() {
            return Ok(());
        }
        remove_tree(path)
    }
}

fn copy_tree(src: &Path, dst: &Path, overwrite: bool) -> Result<usize, FileOpsError> {
    fs::create_dir_all(dst).map_err(io_err("create directory", dst))?;

    let mut copied = 0;
    for entry in fs::read_dir(src).map_err(io_err("read directory", src))? {
        let entry = entry.map_err(io_err("read directory", src))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(io_err("stat", &from))?;

        if file_type.is_dir() {
            copied += copy_tree(&from, &to, overwrite)?;
        } else if to.exists() && !overwrite {
            trace!(path = %to.display(), "Destination exists, keeping it");
        } else {
            replace_file(&from, &to)?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn replace_file(src: &Path, dst: &Path) -> Result<(), FileOpsError> {
    if dst.exists() {
        clear_readonly(dst);
        fs::remove_file(dst).map_err(io_err("delete", dst))?;
    }
    fs::copy(src, dst).map_err(io_err("copy", src))?;
    Ok(())
}

fn remove_tree(path: &Path) -> Result<(), FileOpsError> {
    for entry in fs::read_dir(path).map_err(io_err("read directory", path))? {
        let entry = entry.map_err(io_err("read directory", path))?;
        let child = entry.path();
        let file_type = entry.file_type().map_err(io_err("stat", &child))?;
        if file_type.is_dir() {
            remove_tree(&child)?;
        } else {
            clear_readonly(&child);
            fs::remove_file(&child).map_err(io_err("delete", &child))?;
        }
    }
    clear_readonly(path);
    fs::remove_dir(path).map_err(io_err("delete directory", path))
}

#[cfg(unix)]
fn clear_readonly(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = fs::metadata(path) {
        let mut perms = meta.permissions();
        if perms.mode() & 0o200 == 0 {
            perms.set_mode(perms.mode() | 0o200);
            let _ = fs::set_permissions(path, perms);
        }
    }
}

#[cfg(not(unix))]
fn clear_readonly(path: &Path) {
    if let Ok(meta) = fs::metadata(path) {
        let mut perms = meta.permissions();
        if perms.readonly() {
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
            let _ = fs::set_permissions(path, perms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_move_with_delete_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in").join("job_1");
        let dst = dir.path().join("proc").join("job_1");
        write(&src.join("a.txt"), "a");
        write(&src.join("b.txt"), "b");
        write(&src.join("nested").join("c.txt"), "c");

        let ops = FileOps::new();
        let copied = ops.move_directory_contents(&src, &dst, true, true).unwrap();

        assert_eq!(copied, 3);
        assert!(!src.exists());
        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "a");
        assert_eq!(fs::read_to_string(dst.join("nested").join("c.txt")).unwrap(), "c");
    }

    #[test]
    fn test_move_keeps_source_when_asked() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src.join("a.txt"), "a");

        FileOps::new()
            .move_directory_contents(&src, &dst, false, true)
            .unwrap();

        assert!(src.join("a.txt").exists());
        assert!(dst.join("a.txt").exists());
    }

    #[test]
    fn test_overwrite_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src.join("a.txt"), "new");
        write(&dst.join("a.txt"), "old");

        FileOps::new()
            .move_directory_contents(&src, &dst, false, true)
            .unwrap();
        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "new");
    }

    #[test]
    fn test_no_overwrite_keeps_existing() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src.join("a.txt"), "new");
        write(&dst.join("a.txt"), "old");

        let copied = FileOps::new()
            .move_directory_contents(&src, &dst, false, false)
            .unwrap();
        assert_eq!(copied, 0);
        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "old");
    }

    #[test]
    fn test_missing_source_is_error() {
        let dir = TempDir::new().unwrap();
        let result = FileOps::new().move_directory_contents(
            &dir.path().join("absent"),
            &dir.path().join("dst"),
            true,
            true,
        );
        assert!(matches!(result, Err(FileOpsError::MissingDirectory(_))));
    }

    #[test]
    fn test_copy_file_replaces_destination() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("b.txt");
        write(&src, "fresh");
        write(&dst, "stale");

        FileOps::new().copy_file(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "fresh");
    }

    #[test]
    fn test_delete_directory_with_readonly_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("job");
        let file = target.join("locked.txt");
        write(&file, "x");
        let mut perms = fs::metadata(&file).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&file, perms).unwrap();

        let ops = FileOps::new();
        ops.delete_directory(&target).unwrap();
        assert!(!target.exists());

        // Deleting again is a no-op.
        ops.delete_directory(&target).unwrap();
    }
}
