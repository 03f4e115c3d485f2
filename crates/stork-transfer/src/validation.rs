use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Validate a remote-supplied file name and turn it into a relative path.
///
/// Batch transfers send folder-relative paths like `photos/2024/a.jpg`;
/// backslash separators are accepted. Rejects empty names, absolute paths,
/// drive prefixes and any `..` component.
pub fn validate_relative_path(name: &str) -> Result<PathBuf, TransferError> {
    if name.trim().is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }
    if name.contains('\0') {
        return Err(TransferError::InvalidPath("file name contains NUL".into()));
    }

    let normalized = name.replace('\\', "/");
    let path = Path::new(&normalized);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!("absolute path: {name}")));
    }

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!("path traversal: {name}")));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!("absolute path: {name}")));
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Err(TransferError::InvalidPath(format!("no file name in {name}")));
    }
    Ok(out)
}

/// First free path for `relative` under `dir`. Taken names get a ` (n)`
/// suffix before the extension: `report.pdf`, `report (1).pdf`, ...
pub async fn unique_destination(dir: &Path, relative: &Path) -> std::io::Result<PathBuf> {
    let candidate = dir.join(relative);
    if !tokio::fs::try_exists(&candidate).await? {
        return Ok(candidate);
    }

    let parent = candidate.parent().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
    let stem = candidate
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = candidate.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let next = parent.join(name);
        if !tokio::fs::try_exists(&next).await? {
            return Ok(next);
        }
        n += 1;
    }
}
