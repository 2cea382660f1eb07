//! Bare repository lifecycle management.
//!
//! Maps project tokens to `<root>/<token>.git`, and creates repositories by
//! initialising, mirroring or snapshotting a working tree.  Creation claims the
//! target directory atomically and removes it again if any later step fails.

pub mod catalog;
pub mod copy;
pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::git::commands::{self, CommitOutcome, GitError};
use crate::git::{ProcessRunner, Signature, TreeEntry};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("repository already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid project token: {0:?}")]
    InvalidToken(String),
    #[error("invalid repository path: {0:?}")]
    InvalidPath(String),
    #[error("unsupported remote URL: {0:?}")]
    InvalidUrl(String),
    #[error("failed to initialise repository: {0}")]
    InitFailed(String),
    #[error("failed to clone repository: {0}")]
    CloneFailed(String),
    #[error("failed to commit working tree: {0}")]
    CommitFailed(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// A repository that exists on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub token: String,
    pub path: PathBuf,
}

/// Credentials used to reach a mirror source.
#[derive(Clone, Default)]
pub enum MirrorAuth {
    #[default]
    None,
    /// Embedded into an `https://` URL as `oauth2:<token>@`.
    AccessToken(String),
    /// Private key handed to ssh via `GIT_SSH_COMMAND`.
    SshKey(PathBuf),
}

impl std::fmt::Debug for MirrorAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::AccessToken(_) => f.write_str("AccessToken(<redacted>)"),
            Self::SshKey(path) => f.debug_tuple("SshKey").field(path).finish(),
        }
    }
}

impl MirrorAuth {
    fn apply_to_url(&self, url: &str) -> String {
        match self {
            Self::AccessToken(token) if url.starts_with("https://") => {
                url.replacen("https://", &format!("https://oauth2:{token}@"), 1)
            }
            _ => url.to_string(),
        }
    }

    fn env(&self) -> Vec<(String, String)> {
        match self {
            Self::SshKey(key) => vec![(
                "GIT_SSH_COMMAND".to_string(),
                format!(
                    "ssh -i {} -o StrictHostKeyChecking=no",
                    shell_quote(&key.to_string_lossy())
                ),
            )],
            _ => Vec::new(),
        }
    }

    /// Scrub the secret from subprocess diagnostics before they travel further.
    fn redact(&self, text: String) -> String {
        match self {
            Self::AccessToken(token) if !token.is_empty() => text.replace(token.as_str(), "***"),
            _ => text,
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct RepoStore {
    root: PathBuf,
    runner: Arc<dyn ProcessRunner>,
    signature: Signature,
}

impl RepoStore {
    pub fn new(root: impl Into<PathBuf>, runner: Arc<dyn ProcessRunner>, signature: Signature) -> Self {
        Self {
            root: root.into(),
            runner,
            signature,
        }
    }

    /// Absolute `<root>/<token>.git`, or `InvalidToken` if that would escape
    /// the root.
    pub fn resolve(&self, token: &str) -> Result<PathBuf, StoreError> {
        paths::resolve_repo_path(&self.root, token)
    }

    /// Path-stat check only.  Tokens that cannot be resolved never exist.
    pub async fn exists(&self, token: &str) -> bool {
        match self.resolve(token) {
            Ok(path) => tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Resolve an existing repository.
    pub async fn locate(&self, token: &str) -> Result<RepoRef, StoreError> {
        let path = self.resolve(token)?;
        let is_dir = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(StoreError::NotFound(format!("repository {token}")));
        }
        Ok(RepoRef {
            token: token.to_string(),
            path,
        })
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Initialise an empty bare repository for `token`.
    #[instrument(skip(self))]
    pub async fn create_bare(&self, token: &str) -> Result<RepoRef, StoreError> {
        let claim = self.claim(token).await?;
        match commands::init_bare(self.runner.as_ref(), &claim.path).await {
            Ok(()) => {
                info!(path = %claim.path.display(), "bare repository created");
                Ok(claim.keep())
            }
            Err(e) => {
                claim.release().await;
                Err(StoreError::InitFailed(e.stderr()))
            }
        }
    }

    /// Mirror-clone `remote_url` into the repository for `token`.
    #[instrument(skip(self, remote_url, auth), fields(remote = %catalog::redact_url(remote_url)))]
    pub async fn mirror_from(
        &self,
        token: &str,
        remote_url: &str,
        auth: &MirrorAuth,
    ) -> Result<RepoRef, StoreError> {
        paths::validate_remote_url(remote_url)?;
        let claim = self.claim(token).await?;
        let url = auth.apply_to_url(remote_url);
        match commands::clone_mirror(self.runner.as_ref(), &url, &claim.path, &auth.env()).await {
            Ok(()) => {
                info!(path = %claim.path.display(), "mirror clone complete");
                Ok(claim.keep())
            }
            Err(e) => {
                claim.release().await;
                Err(StoreError::CloneFailed(auth.redact(e.stderr())))
            }
        }
    }

    /// Build the bare repository for `token` from the working tree at
    /// `source_dir`.
    ///
    /// A plain directory is snapshotted through a scratch repository; a
    /// directory that is already a git working tree has outstanding changes
    /// committed in place and is cloned directly.  Not idempotent: an existing
    /// destination yields `AlreadyExists`.
    #[instrument(skip(self), fields(source = %source_dir.display()))]
    pub async fn materialize(&self, source_dir: &Path, token: &str) -> Result<RepoRef, StoreError> {
        let source = std::path::absolute(source_dir)
            .with_context(|| format!("failed to resolve {}", source_dir.display()))?;
        let claim = self.claim(token).await?;

        let source_is_dir = tokio::fs::metadata(&source)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let result = if !source_is_dir {
            Err(StoreError::NotFound(format!(
                "working tree {}",
                source.display()
            )))
        } else if tokio::fs::try_exists(source.join(".git")).await.unwrap_or(false) {
            self.snapshot_in_place(&source, &claim.path).await
        } else {
            self.snapshot_via_scratch(&source, &claim.path).await
        };

        match result {
            Ok(()) => {
                info!(path = %claim.path.display(), "repository materialised");
                Ok(claim.keep())
            }
            Err(e) => {
                claim.release().await;
                Err(e)
            }
        }
    }

    async fn snapshot_in_place(&self, source: &Path, dest: &Path) -> Result<(), StoreError> {
        let runner = self.runner.as_ref();
        let outcome = commands::commit_all(runner, source, "generate repository", &self.signature)
            .await
            .map_err(|e| StoreError::CommitFailed(e.stderr()))?;
        if outcome == CommitOutcome::NothingToCommit {
            debug!("working tree clean; cloning existing history");
        }
        commands::clone_bare(runner, source, dest)
            .await
            .map_err(|e| StoreError::CloneFailed(e.stderr()))
    }

    async fn snapshot_via_scratch(&self, source: &Path, dest: &Path) -> Result<(), StoreError> {
        let runner = self.runner.as_ref();
        let scratch = tempfile::Builder::new()
            .prefix("repo-init-")
            .tempdir()
            .context("failed to create scratch directory")?;

        commands::init(runner, scratch.path())
            .await
            .map_err(|e| StoreError::InitFailed(e.stderr()))?;

        let (from, to) = (source.to_path_buf(), scratch.path().to_path_buf());
        tokio::task::spawn_blocking(move || copy::copy_working_tree(&from, &to))
            .await
            .context("blocking task panicked")?
            .context("failed to copy working tree into scratch repository")?;

        commands::commit_all(runner, scratch.path(), "Initial commit", &self.signature)
            .await
            .map_err(|e| StoreError::CommitFailed(e.stderr()))?;

        commands::clone_bare(runner, scratch.path(), dest)
            .await
            .map_err(|e| StoreError::CloneFailed(e.stderr()))?;

        // `scratch` is removed on drop.
        Ok(())
    }

    /// Atomically create the (empty) directory for `token`.
    async fn claim(&self, token: &str) -> Result<Claim, StoreError> {
        let path = self.resolve(token)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create repositories root {}", self.root.display()))?;

        match tokio::fs::create_dir(&path).await {
            Ok(()) => Ok(Claim {
                token: token.to_string(),
                path,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "repository already exists");
                Err(StoreError::AlreadyExists(token.to_string()))
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("failed to create {}", path.display()))
                .into()),
        }
    }

    /// Delete the repository for `token`.  Used to undo a creation whose
    /// follow-up bookkeeping failed.
    #[instrument(skip(self))]
    pub async fn remove(&self, token: &str) -> Result<(), StoreError> {
        let path = self.resolve(token)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("failed to remove {}", path.display()))
                .into()),
        }
    }

    // -----------------------------------------------------------------------
    // Browsing
    // -----------------------------------------------------------------------

    /// Recursive listing of `rev` (files only, paths relative to the root).
    #[instrument(skip(self))]
    pub async fn tree(&self, token: &str, rev: &str) -> Result<Vec<TreeEntry>, StoreError> {
        let repo = self.locate(token).await?;
        commands::ls_tree(self.runner.as_ref(), &repo.path, rev)
            .await
            .map_err(|e| not_found_or_internal(e, format!("revision {rev}")))
    }

    /// Contents of `path` at `rev`.
    #[instrument(skip(self))]
    pub async fn read_file(&self, token: &str, rev: &str, path: &str) -> Result<Vec<u8>, StoreError> {
        paths::validate_tree_path(path)?;
        let repo = self.locate(token).await?;
        commands::cat_blob(self.runner.as_ref(), &repo.path, rev, path)
            .await
            .map_err(|e| not_found_or_internal(e, format!("{path} at {rev}")))
    }
}

fn not_found_or_internal(err: GitError, what: String) -> StoreError {
    match err {
        GitError::Failed { stderr, .. } => {
            debug!(%stderr, "git lookup failed");
            StoreError::NotFound(what)
        }
        spawn @ GitError::Spawn { .. } => StoreError::Internal(spawn.into()),
    }
}

/// A directory created for a repository that is still being populated.
struct Claim {
    token: String,
    path: PathBuf,
}

impl Claim {
    fn keep(self) -> RepoRef {
        RepoRef {
            token: self.token,
            path: self.path,
        }
    }

    /// Remove the partially populated directory so a retry is not blocked.
    async fn release(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to roll back repository directory");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
