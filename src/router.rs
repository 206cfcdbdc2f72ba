//! Maps request paths to scripts and files under the document root

use crate::env::{normalize_path, ScriptTarget};
use std::path::{Path, PathBuf};

/// Return the prefix of `url_path` that names a script.
///
/// The path names a script when the extension is followed by the end of the
/// path, a `/` (extra path info) or a `?`. The returned slice ends with the
/// extension.
pub fn script_path<'a>(url_path: &'a str, extension: &str) -> Option<&'a str> {
    let mut from = 0;
    while let Some(found) = url_path[from..].find(extension) {
        let end = from + found + extension.len();
        match url_path[end..].chars().next() {
            None | Some('/') | Some('?') => return Some(&url_path[..end]),
            Some(_) => from = end,
        }
    }
    None
}

/// Resolve a URL path to a file path that stays inside `root`.
///
/// The path is percent-decoded and normalized lexically. Paths that escape
/// the root after normalization are refused.
pub fn resolve_under_root(root: &Path, url_path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(url_path).ok()?;
    if decoded.contains('\0') {
        return None;
    }

    let root = normalize_path(root);
    let candidate = normalize_path(&root.join(decoded.trim_start_matches('/')));
    if candidate.starts_with(&root) {
        Some(candidate)
    } else {
        None
    }
}

/// Find the script a request path addresses, if it exists on disk
pub async fn resolve_script(root: &Path, url_path: &str, extension: &str) -> Option<ScriptTarget> {
    let script = script_path(url_path, extension)?;
    let script_file = resolve_under_root(root, script)?;

    match tokio::fs::metadata(&script_file).await {
        Ok(meta) if meta.is_file() => Some(ScriptTarget {
            document_root: root.to_path_buf(),
            script_file,
        }),
        _ => None,
    }
}
