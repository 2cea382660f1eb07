//! Working-tree snapshot copy.
//!
//! File-system walking is synchronous; callers run [`copy_working_tree`] in a
//! blocking task.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Directory entries never copied into a snapshot.
const SKIPPED: &[&str] = &[".git"];

/// Recursively copy `src` into the existing directory `dst`.
///
/// Regular files keep their permission bits and symlinks are recreated as
/// symlinks.  Directories get default permissions: git does not record them,
/// and a read-only source directory must not make its copy unwritable.
/// Version-control metadata (`.git` at any depth) is skipped.  Returns the
/// number of files copied.
pub fn copy_working_tree(src: &Path, dst: &Path) -> Result<u64> {
    let mut copied = 0u64;
    let mut stack: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from_dir, to_dir)) = stack.pop() {
        let entries = fs::read_dir(&from_dir)
            .with_context(|| format!("failed to read directory {}", from_dir.display()))?;

        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to list directory {}", from_dir.display()))?;
            let name = entry.file_name();
            if SKIPPED.iter().any(|s| name == *s) {
                continue;
            }

            let from = entry.path();
            let to = to_dir.join(&name);
            let meta = fs::symlink_metadata(&from)
                .with_context(|| format!("failed to stat {}", from.display()))?;
            let file_type = meta.file_type();

            if file_type.is_dir() {
                fs::create_dir_all(&to)
                    .with_context(|| format!("failed to create {}", to.display()))?;
                stack.push((from, to));
            } else if file_type.is_symlink() {
                copy_symlink(&from, &to)?;
                copied += 1;
            } else if file_type.is_file() {
                // `fs::copy` carries the permission bits over.
                fs::copy(&from, &to).with_context(|| {
                    format!("failed to copy {} to {}", from.display(), to.display())
                })?;
                copied += 1;
            }
            // Sockets, fifos and devices are not part of a snapshot.
        }
    }

    debug!(files = copied, src = %src.display(), "working tree copied");
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target =
        fs::read_link(from).with_context(|| format!("failed to read link {}", from.display()))?;
    std::os::unix::fs::symlink(&target, to)
        .with_context(|| format!("failed to create link {}", to.display()))
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to)
        .map(|_| ())
        .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
