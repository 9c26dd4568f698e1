//! Path validation and manipulation.
//!
//! Paths are absolute, `/`-separated, with empty components rejected.
//! Limits: 4096 bytes per path, 256 per component.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::{VFS_MAX_NAME_LEN, VFS_MAX_PATH_LEN};

use super::FsError;

/// Splits an absolute path into its components after validating it.
///
/// `/` itself yields an empty component list.
///
/// # Errors
///
/// [`FsError::Invalid`] for relative paths, empty components ("//"), or
/// length violations.
pub fn components(path: &str) -> Result<Vec<&str>, FsError> {
    if !path.starts_with('/') || path.len() > VFS_MAX_PATH_LEN {
        return Err(FsError::Invalid);
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut parts = Vec::new();
    for part in trimmed[1..].split('/') {
        if part.is_empty() || part.len() > VFS_MAX_NAME_LEN {
            return Err(FsError::Invalid);
        }
        parts.push(part);
    }
    Ok(parts)
}

/// Joins a possibly-relative path onto a base directory, normalising `.`
/// and `..` components. Used by the openat path resolution against a
/// task's working directory.
pub fn absolutize(cwd: &str, path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    let full = if path.starts_with('/') {
        [path, ""]
    } else {
        [cwd, path]
    };
    for piece in full {
        for part in piece.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    stack.pop();
                }
                other => stack.push(other),
            }
        }
    }
    let mut out = String::from("/");
    out.push_str(&stack.join("/"));
    out
}

/// Splits a path into (parent, final component).
///
/// # Errors
///
/// [`FsError::Invalid`] when the path has no final component (it is `/`).
pub fn split_parent(path: &str) -> Result<(&str, &str), FsError> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/').ok_or(FsError::Invalid)?;
    let name = &trimmed[idx + 1..];
    if name.is_empty() {
        return Err(FsError::Invalid);
    }
    let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
    Ok((parent, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_absolute_paths() {
        assert_eq!(components("/").unwrap(), Vec::<&str>::new());
        assert_eq!(components("/bin/init").unwrap(), vec!["bin", "init"]);
        assert_eq!(components("/disk/0/A.TXT").unwrap(), vec!["disk", "0", "A.TXT"]);
        // Trailing slash is tolerated.
        assert_eq!(components("/dev/tty/").unwrap(), vec!["dev", "tty"]);
    }

    #[test]
    fn rejects_relative_and_empty_components() {
        assert_eq!(components("bin/init").unwrap_err(), FsError::Invalid);
        assert_eq!(components("/bin//init").unwrap_err(), FsError::Invalid);
        assert_eq!(components("").unwrap_err(), FsError::Invalid);
    }

    #[test]
    fn rejects_oversized_paths() {
        let long = alloc::format!("/{}", "x".repeat(VFS_MAX_PATH_LEN));
        assert_eq!(components(&long).unwrap_err(), FsError::Invalid);
        let long_name = alloc::format!("/{}", "y".repeat(VFS_MAX_NAME_LEN + 1));
        assert_eq!(components(&long_name).unwrap_err(), FsError::Invalid);
    }

    #[test]
    fn absolutize_against_cwd() {
        assert_eq!(absolutize("/home", "file"), "/home/file");
        assert_eq!(absolutize("/home", "/etc/motd"), "/etc/motd");
        assert_eq!(absolutize("/home/sub", "../other"), "/home/other");
        assert_eq!(absolutize("/", "./bin/sh"), "/bin/sh");
        assert_eq!(absolutize("/a/b", ".."), "/a");
    }

    #[test]
    fn parent_splitting() {
        assert_eq!(split_parent("/bin/init").unwrap(), ("/bin", "init"));
        assert_eq!(split_parent("/init").unwrap(), ("/", "init"));
        assert!(split_parent("/").is_err());
    }
}
