//! C1: canonicalize and validate user-supplied filesystem paths; enforce
//! base-directory containment; reject device/UNC/system paths (spec §4.1).

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::CoreError;

/// A path produced only by [`canonicalize_absolute`] and friends, so
/// downstream code cannot accept an unchecked string (spec §9 "Path safety").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SafePath(PathBuf);

impl SafePath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for SafePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

#[cfg(windows)]
const WINDOWS_DEVICE_PREFIXES: [&str; 3] = [r"\\?\", r"\\.\", r"\\"];

#[cfg(unix)]
const UNIX_FORBIDDEN_ROOTS: [&str; 3] = ["/dev", "/proc", "/sys"];

fn contains_nul(raw: &str) -> bool {
    raw.as_bytes().contains(&0)
}

/// Rejects empty/NUL-containing/non-absolute paths and, per-platform, device
/// namespace or system-root paths (spec §4.1).
pub fn canonicalize_absolute(raw: &str, label: &str) -> Result<SafePath, CoreError> {
    if raw.is_empty() {
        return Err(CoreError::InvalidPath {
            label: label.to_string(),
            reason: "path is empty".to_string(),
        });
    }
    if contains_nul(raw) {
        return Err(CoreError::InvalidPath {
            label: label.to_string(),
            reason: "path contains a NUL byte".to_string(),
        });
    }

    let path = Path::new(raw);
    if !path.is_absolute() {
        return Err(CoreError::InvalidPath {
            label: label.to_string(),
            reason: "path is not absolute".to_string(),
        });
    }

    #[cfg(windows)]
    {
        for prefix in WINDOWS_DEVICE_PREFIXES {
            if raw.starts_with(prefix) {
                return Err(CoreError::InvalidPath {
                    label: label.to_string(),
                    reason: format!("path uses a device/UNC/namespace prefix ({prefix})"),
                });
            }
        }
    }

    #[cfg(unix)]
    {
        for root in UNIX_FORBIDDEN_ROOTS {
            if path == Path::new(root) || path.starts_with(format!("{root}/")) {
                return Err(CoreError::InvalidPath {
                    label: label.to_string(),
                    reason: format!("path is rooted at {root}"),
                });
            }
        }
    }

    Ok(SafePath(path.to_path_buf()))
}

fn real_path(path: &Path, label: &str) -> Result<PathBuf, CoreError> {
    fs::canonicalize(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            CoreError::NotFound {
                label: label.to_string(),
                path: path.display().to_string(),
            }
        } else if err.kind() == std::io::ErrorKind::PermissionDenied {
            CoreError::PermissionDenied {
                label: label.to_string(),
                path: path.display().to_string(),
            }
        } else {
            CoreError::NotFound {
                label: label.to_string(),
                path: path.display().to_string(),
            }
        }
    })
}

/// Resolves symlinks (real-path), requires the target to exist and be a
/// directory, and checks read+execute permission (spec §4.1).
pub fn ensure_existing_dir(p: &Path, label: &str) -> Result<SafePath, CoreError> {
    let real = real_path(p, label)?;
    let meta = fs::metadata(&real).map_err(|_| CoreError::NotFound {
        label: label.to_string(),
        path: real.display().to_string(),
    })?;
    if !meta.is_dir() {
        return Err(CoreError::InvalidPath {
            label: label.to_string(),
            reason: "expected a directory".to_string(),
        });
    }
    check_readable(&real, label, true)?;
    Ok(SafePath(real))
}

/// Resolves symlinks (real-path), requires the target to exist and be a
/// regular file, and checks read permission (spec §4.1).
pub fn ensure_existing_file(p: &Path, label: &str) -> Result<SafePath, CoreError> {
    let real = real_path(p, label)?;
    let meta = fs::metadata(&real).map_err(|_| CoreError::NotFound {
        label: label.to_string(),
        path: real.display().to_string(),
    })?;
    if !meta.is_file() {
        return Err(CoreError::InvalidPath {
            label: label.to_string(),
            reason: "expected a regular file".to_string(),
        });
    }
    check_readable(&real, label, false)?;
    Ok(SafePath(real))
}

#[cfg(unix)]
fn check_readable(path: &Path, label: &str, need_exec: bool) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path).map_err(|_| CoreError::NotFound {
        label: label.to_string(),
        path: path.display().to_string(),
    })?;
    let mode = meta.permissions().mode();
    let readable = mode & 0o444 != 0;
    let executable = mode & 0o111 != 0;
    if !readable || (need_exec && !executable) {
        return Err(CoreError::PermissionDenied {
            label: label.to_string(),
            path: path.display().to_string(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_readable(path: &Path, label: &str, _need_exec: bool) -> Result<(), CoreError> {
    fs::File::open(path).map(|_| ()).map_err(|_| CoreError::PermissionDenied {
        label: label.to_string(),
        path: path.display().to_string(),
    })
}

/// Relative-path containment: the relative path from `base` to `target` must
/// not start with `..` and must not itself be absolute (spec §4.1).
pub fn is_within_base(base: &Path, target: &Path) -> bool {
    match target.strip_prefix(base) {
        Ok(rel) => !rel.is_absolute() && !rel.starts_with(".."),
        Err(_) => false,
    }
}

/// Verifies write permission by creating and deleting a unique zero-byte
/// sentinel file (spec §4.1).
pub fn ensure_writable_dir(p: &Path) -> Result<(), CoreError> {
    let probe = p.join(format!(".albumtovideo-write-probe-{}", uuid::Uuid::new_v4()));
    match fs::File::create(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            Ok(())
        }
        Err(_) => Err(CoreError::PermissionDenied {
            label: "export folder".to_string(),
            path: p.display().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_path() {
        let err = canonicalize_absolute("", "audio").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPath { .. }));
    }

    #[test]
    fn rejects_relative_path() {
        let err = canonicalize_absolute("foo/bar.wav", "audio").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPath { .. }));
    }

    #[test]
    fn rejects_nul_byte() {
        let err = canonicalize_absolute("/tmp/foo\0bar", "audio").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPath { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_dev_root() {
        let err = canonicalize_absolute("/dev/null", "audio").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPath { .. }));
    }

    #[test]
    fn within_base_rejects_parent_escape() {
        let base = Path::new("/export/album");
        assert!(is_within_base(base, Path::new("/export/album/track.mp4")));
        assert!(!is_within_base(base, Path::new("/export/other/track.mp4")));
    }

    #[test]
    fn ensure_existing_dir_and_writable() {
        let dir = tempfile::tempdir().unwrap();
        let safe = ensure_existing_dir(dir.path(), "export folder").unwrap();
        assert_eq!(safe.as_path(), dir.path().canonicalize().unwrap());
        ensure_writable_dir(dir.path()).unwrap();
    }

    #[test]
    fn ensure_existing_file_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_existing_file(dir.path(), "image").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPath { .. }));
    }
}
