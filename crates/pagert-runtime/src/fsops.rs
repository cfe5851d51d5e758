//! Blocking filesystem work behind the page operations.
//!
//! Every entry point resolves its paths, consults the extension access guard and
//! only then touches the filesystem. A denial is reported as an ordinary
//! [`OpError`] so it flows through the outcome contract like any I/O failure.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempPath;

use crate::error::OpError;
use crate::guard::{self, OperationKind};

#[derive(Debug, Clone)]
pub(crate) struct FsScope {
    pub(crate) content_root: PathBuf,
    pub(crate) allow_executable: bool,
    /// Relative operation paths are resolved against this directory.
    pub(crate) base_dir: PathBuf,
}

impl FsScope {
    pub(crate) fn resolve(&self, path: &Path) -> PathBuf {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        };
        canonicalize_existing_prefix(&guard::normalize_lexically(&joined))
    }

    fn check(&self, kind: OperationKind, syscall: &'static str, paths: &[&Path]) -> Result<(), OpError> {
        if guard::permit_all(kind, paths, &self.content_root, self.allow_executable) {
            return Ok(());
        }
        let denied = paths
            .iter()
            .find(|p| !guard::permit(kind, p, &self.content_root, self.allow_executable))
            .copied()
            .unwrap_or(Path::new(""));
        Err(OpError::denied(syscall, denied))
    }
}

/// Canonicalizes the longest existing ancestor of `path` and re-appends the rest,
/// so symlinks cannot smuggle a path into or out of the content root.
pub(crate) fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut cur = path.to_path_buf();
    let mut missing: Vec<std::ffi::OsString> = Vec::new();
    while !cur.exists() {
        let Some(name) = cur.file_name() else {
            break;
        };
        missing.push(name.to_os_string());
        let Some(parent) = cur.parent() else {
            break;
        };
        cur = parent.to_path_buf();
    }

    let mut base = cur.canonicalize().unwrap_or(cur);
    for part in missing.iter().rev() {
        base.push(part);
    }
    base
}

pub(crate) fn read(scope: &FsScope, path: &Path) -> Result<Vec<u8>, OpError> {
    let abs = scope.resolve(path);
    scope.check(OperationKind::Read, "open", &[abs.as_path()])?;
    std::fs::read(&abs).map_err(|e| OpError::from_io(&e, "open", &abs))
}

pub(crate) fn read_to_string(scope: &FsScope, path: &Path) -> Result<String, OpError> {
    let abs = scope.resolve(path);
    scope.check(OperationKind::Read, "open", &[abs.as_path()])?;
    std::fs::read_to_string(&abs).map_err(|e| OpError::from_io(&e, "read", &abs))
}

pub(crate) fn copy(scope: &FsScope, from: &Path, to: &Path) -> Result<(), OpError> {
    let src = scope.resolve(from);
    let dst = scope.resolve(to);
    scope.check(OperationKind::Copy, "copyfile", &[src.as_path(), dst.as_path()])?;
    std::fs::copy(&src, &dst)
        .map(|_| ())
        .map_err(|e| OpError::from_io(&e, "copyfile", &src))
}

pub(crate) fn rename(scope: &FsScope, from: &Path, to: &Path) -> Result<(), OpError> {
    let src = scope.resolve(from);
    let dst = scope.resolve(to);
    scope.check(OperationKind::Move, "rename", &[src.as_path(), dst.as_path()])?;
    move_path(&src, &dst)
}

/// Renames, falling back to copy + remove when source and destination live on
/// different filesystems.
pub(crate) fn move_path(src: &Path, dst: &Path) -> Result<(), OpError> {
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device(&err) => {
            std::fs::copy(src, dst).map_err(|e| OpError::from_io(&e, "copyfile", src))?;
            std::fs::remove_file(src).map_err(|e| OpError::from_io(&e, "unlink", src))
        }
        Err(err) => Err(OpError::from_io(&err, "rename", src)),
    }
}

fn is_cross_device(err: &io::Error) -> bool {
    matches!(
        crate::error::ErrorCode::from_io(err),
        crate::error::ErrorCode::CrossDevice
    )
}

pub(crate) fn remove(scope: &FsScope, path: &Path) -> Result<(), OpError> {
    let abs = scope.resolve(path);
    scope.check(OperationKind::Delete, "unlink", &[abs.as_path()])?;
    std::fs::remove_file(&abs).map_err(|e| OpError::from_io(&e, "unlink", &abs))
}

pub(crate) fn exists(scope: &FsScope, path: &Path) -> Result<bool, OpError> {
    let abs = scope.resolve(path);
    scope.check(OperationKind::Exists, "access", &[abs.as_path()])?;
    abs.try_exists()
        .map_err(|e| OpError::from_io(&e, "access", &abs))
}

/// Moves an upload's temp file to `to`. Dropping `temp` on any failure removes
/// the temp file.
pub(crate) fn relocate(scope: &FsScope, temp: TempPath, to: &Path) -> Result<PathBuf, OpError> {
    let dst = scope.resolve(to);
    scope.check(OperationKind::Move, "rename", &[&*temp, dst.as_path()])?;
    match temp.persist(&dst) {
        Ok(()) => Ok(dst),
        Err(err) if is_cross_device(&err.error) => {
            let temp = err.path;
            let src = temp.to_path_buf();
            std::fs::copy(&src, &dst).map_err(|e| OpError::from_io(&e, "copyfile", &src))?;
            temp.close()
                .map_err(|e| OpError::from_io(&e, "unlink", &src))?;
            Ok(dst)
        }
        Err(err) => Err(OpError::from_io(&err.error, "rename", &err.path)),
    }
}
