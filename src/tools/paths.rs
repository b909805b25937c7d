use std::path::{Component, Path, PathBuf};

use super::ToolError;

/// Confine a model-supplied path to the workspace.
///
/// Relative paths are taken from the workspace root; absolute paths must lie under
/// `workspace_root`. `..` may never climb above the root. The result is relative to the
/// root (`.` for the root itself) and is purely lexical; the provider re-checks after
/// resolving symlinks.
pub fn confine(workspace_root: &str, raw: &str) -> Result<PathBuf, ToolError> {
    let raw = raw.trim();
    if raw.contains('\0') {
        return Err(ToolError::InvalidArguments("path contains a NUL byte".into()));
    }
    let raw = if raw.is_empty() { "." } else { raw };

    let path = Path::new(raw);
    let relative = if path.is_absolute() {
        path.strip_prefix(workspace_root)
            .map_err(|_| outside(raw))?
    } else {
        path
    };

    let mut confined = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => confined.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !confined.pop() {
                    return Err(outside(raw));
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(outside(raw)),
        }
    }

    if confined.as_os_str().is_empty() {
        confined.push(".");
    }
    Ok(confined)
}

fn outside(raw: &str) -> ToolError {
    ToolError::PathNotFound(format!("{raw} (outside the workspace)"))
}
