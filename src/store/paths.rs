//! Project-token to on-disk path resolution.

use std::path::{Component, Path, PathBuf};

use anyhow::Context;

use super::StoreError;

/// Longest token accepted; `<token>.git` must still fit in a file name.
const MAX_TOKEN_LEN: usize = 200;

/// Reject tokens that could name anything other than a single directory
/// entry directly under the repositories root.
pub fn validate_token(token: &str) -> Result<(), StoreError> {
    let invalid = token.is_empty()
        || token.len() > MAX_TOKEN_LEN
        || token == "."
        || token.contains("..")
        || token.contains('/')
        || token.contains('\\')
        || token.chars().any(char::is_control);
    if invalid {
        return Err(StoreError::InvalidToken(token.to_string()));
    }
    Ok(())
}

/// Strip one trailing `.git` from a URL path segment (`abc123.git` → `abc123`).
pub fn token_from_segment(segment: &str) -> &str {
    segment.strip_suffix(".git").unwrap_or(segment)
}

/// `abs(join(root, token + ".git"))`, refusing anything that does not land
/// directly inside `abs(root)`.
pub fn resolve_repo_path(root: &Path, token: &str) -> Result<PathBuf, StoreError> {
    validate_token(token)?;
    let root = absolute_root(root)?;
    let candidate = normalize_lexically(&root.join(format!("{token}.git")));
    if candidate.parent() != Some(root.as_path()) {
        return Err(StoreError::InvalidToken(token.to_string()));
    }
    Ok(candidate)
}

/// Absolute, lexically normalised form of `root`.
pub fn absolute_root(root: &Path) -> Result<PathBuf, StoreError> {
    let abs = std::path::absolute(root)
        .with_context(|| format!("failed to resolve absolute path of {}", root.display()))?;
    Ok(normalize_lexically(&abs))
}

/// Resolve `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Reject repository-relative file paths that could escape the tree.
pub fn validate_tree_path(path: &str) -> Result<(), StoreError> {
    if path.is_empty() || path.starts_with('/') || path.contains("..") || path.contains('\0') {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Accept only network remotes: `https://`, `http://`, `ssh://` and scp-style
/// `user@host:path`.  Local paths, `file://` and transport helpers such as
/// `ext::` would let a mirror read any repository on this host.
pub fn validate_remote_url(url: &str) -> Result<(), StoreError> {
    let invalid = || StoreError::InvalidUrl(super::catalog::redact_url(url));

    if url.starts_with('-') || url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid());
    }

    if let Some((scheme, rest)) = url.split_once("://") {
        if !matches!(scheme, "https" | "http" | "ssh") {
            return Err(invalid());
        }
        let authority = rest.split('/').next().unwrap_or_default();
        let host = authority.rsplit('@').next().unwrap_or_default();
        if host.is_empty() || host.starts_with('-') {
            return Err(invalid());
        }
        return Ok(());
    }

    // scp-like syntax: `user@host:path`, with no slash before the colon.
    let Some((login, path)) = url.split_once(':') else {
        return Err(invalid());
    };
    let Some((user, host)) = login.split_once('@') else {
        return Err(invalid());
    };
    if user.is_empty()
        || host.is_empty()
        || host.starts_with('-')
        || login.contains('/')
        || path.is_empty()
    {
        return Err(invalid());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
