//! Extension access guard.
//!
//! Pages may not read, copy, move, delete or probe page/module sources that live
//! inside their own site's content root unless the site opts in. Paths outside the
//! content root are never restricted by this guard.

use std::path::{Component, Path, PathBuf};

use pagert_contracts::EXECUTABLE_EXTENSIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Copy,
    Move,
    Delete,
    Exists,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Copy => "copy",
            OperationKind::Move => "move",
            OperationKind::Delete => "delete",
            OperationKind::Exists => "exists",
        }
    }

    /// True for operations that touch two paths (source and destination).
    pub fn is_transfer(self) -> bool {
        matches!(self, OperationKind::Copy | OperationKind::Move)
    }
}

pub fn is_executable_path(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    EXECUTABLE_EXTENSIONS
        .iter()
        .any(|exe| ext.eq_ignore_ascii_case(exe))
}

/// Lexically removes `.` and `..` components. Does not touch the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(comp.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub fn is_inside_root(path: &Path, content_root: &Path) -> bool {
    normalize_lexically(path).starts_with(normalize_lexically(content_root))
}

/// Decides whether a single path may be touched by an operation of `kind`.
/// Every operation kind is held to the same rule today.
pub fn permit(_kind: OperationKind, path: &Path, content_root: &Path, allow_executable: bool) -> bool {
    if allow_executable {
        return true;
    }
    if !is_inside_root(path, content_root) {
        return true;
    }
    !is_executable_path(path)
}

/// Like [`permit`], for every path an operation touches. A copy or move is denied
/// when either side is an in-root executable path.
pub fn permit_all(
    kind: OperationKind,
    paths: &[&Path],
    content_root: &Path,
    allow_executable: bool,
) -> bool {
    paths
        .iter()
        .all(|p| permit(kind, p, content_root, allow_executable))
}
