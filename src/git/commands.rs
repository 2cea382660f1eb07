//! Git command wrappers.
//!
//! Every function in this module shells out through a [`ProcessRunner`] for
//! the actual work.  Credentials for remote operations (SSH command, tokens
//! embedded in URLs) are supplied by the caller via the URL or `env_vars` so
//! that this module stays credential-agnostic.

use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, instrument};

use super::runner::{CommandOutput, CommandSpec, ExitOutcome, ProcessRunner};
use super::service::Service;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to spawn git {command}: {source}")]
    Spawn {
        command: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("git {command} failed ({status}): {stderr}")]
    Failed {
        command: &'static str,
        status: ExitOutcome,
        stderr: String,
    },
}

impl GitError {
    /// Captured diagnostics of a failed run, or the spawn error text.
    pub fn stderr(&self) -> String {
        match self {
            Self::Spawn { source, .. } => source.to_string(),
            Self::Failed { stderr, .. } => stderr.clone(),
        }
    }
}

/// Outcome of [`commit_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    NothingToCommit,
}

/// One entry of a recursive tree listing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TreeEntry {
    pub mode: String,
    pub kind: String,
    pub oid: String,
    pub path: String,
}

/// Identity recorded as author and committer of snapshot commits.
#[derive(Debug, Clone)]
pub struct Signature {
    pub name: String,
    pub email: String,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn run(
    runner: &dyn ProcessRunner,
    command: &'static str,
    spec: CommandSpec,
) -> Result<CommandOutput, GitError> {
    debug!(args = ?spec.display_args(), "running git {command}");
    let output = runner
        .output(spec)
        .await
        .map_err(|source| GitError::Spawn { command, source })?;
    if !output.status.success() {
        return Err(GitError::Failed {
            command,
            status: output.status,
            stderr: output.diagnostics(),
        });
    }
    Ok(output)
}

/// `-c safe.directory=<dir>` so git accepts a working tree owned by another
/// user without touching global configuration.
fn safe_directory(dir: &Path) -> [std::ffi::OsString; 2] {
    let mut value = std::ffi::OsString::from("safe.directory=");
    value.push(dir.as_os_str());
    ["-c".into(), value]
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Run `git init --bare <path>`.  `path` may be an existing empty directory.
#[instrument(skip(runner), fields(path = %path.display()))]
pub async fn init_bare(runner: &dyn ProcessRunner, path: &Path) -> Result<(), GitError> {
    run(
        runner,
        "init --bare",
        CommandSpec::new(["init", "--bare", "--quiet"]).arg(path),
    )
    .await?;
    Ok(())
}

/// Run `git init <dir>` to create a working repository.
#[instrument(skip(runner), fields(dir = %dir.display()))]
pub async fn init(runner: &dyn ProcessRunner, dir: &Path) -> Result<(), GitError> {
    run(runner, "init", CommandSpec::new(["init", "--quiet"]).arg(dir)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Stage + commit
// ---------------------------------------------------------------------------

/// Stage every change in `dir` and commit it as `signature`.
///
/// A clean working tree is not an error: [`CommitOutcome::NothingToCommit`]
/// is returned instead.
#[instrument(skip(runner, signature), fields(dir = %dir.display()))]
pub async fn commit_all(
    runner: &dyn ProcessRunner,
    dir: &Path,
    message: &str,
    signature: &Signature,
) -> Result<CommitOutcome, GitError> {
    run(
        runner,
        "add",
        CommandSpec::new(safe_directory(dir))
            .arg("-C")
            .arg(dir)
            .arg("add")
            .arg("--all"),
    )
    .await?;

    let spec = CommandSpec::new(safe_directory(dir))
        .arg("-c")
        .arg(format!("user.name={}", signature.name))
        .arg("-c")
        .arg(format!("user.email={}", signature.email))
        .arg("-C")
        .arg(dir)
        .arg("commit")
        .arg("--quiet")
        .arg("-m")
        .arg(message);

    match run(runner, "commit", spec).await {
        Ok(_) => Ok(CommitOutcome::Committed),
        Err(GitError::Failed { stderr, .. }) if stderr.contains("nothing to commit") => {
            debug!("nothing to commit");
            Ok(CommitOutcome::NothingToCommit)
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Clone
// ---------------------------------------------------------------------------

/// Run `git clone --mirror -- <url> <dest>` with the supplied environment.
#[instrument(skip(runner, url, env_vars), fields(dest = %dest.display()))]
pub async fn clone_mirror(
    runner: &dyn ProcessRunner,
    url: &str,
    dest: &Path,
    env_vars: &[(String, String)],
) -> Result<(), GitError> {
    let mut spec = CommandSpec::new(["clone", "--mirror", "--quiet", "--", url]).arg(dest);
    for (k, v) in env_vars {
        spec = spec.env(k.clone(), v.clone());
    }
    run(runner, "clone --mirror", spec).await?;
    Ok(())
}

/// Run `git clone --bare <source> <dest>` from a local repository.
#[instrument(skip(runner), fields(source = %source.display(), dest = %dest.display()))]
pub async fn clone_bare(
    runner: &dyn ProcessRunner,
    source: &Path,
    dest: &Path,
) -> Result<(), GitError> {
    let spec = CommandSpec::new(safe_directory(source))
        .arg("clone")
        .arg("--bare")
        .arg("--quiet")
        .arg(source)
        .arg(dest);
    run(runner, "clone --bare", spec).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Read access
// ---------------------------------------------------------------------------

/// Recursive `git ls-tree` of `rev` inside the repository at `git_dir`.
#[instrument(skip(runner), fields(git_dir = %git_dir.display()))]
pub async fn ls_tree(
    runner: &dyn ProcessRunner,
    git_dir: &Path,
    rev: &str,
) -> Result<Vec<TreeEntry>, GitError> {
    let mut git_dir_arg = std::ffi::OsString::from("--git-dir=");
    git_dir_arg.push(git_dir.as_os_str());
    let spec = CommandSpec::new([git_dir_arg])
        .arg("ls-tree")
        .arg("-r")
        .arg("-z")
        .arg("--full-tree")
        .arg(rev)
        .arg("--");
    let output = run(runner, "ls-tree", spec).await?;
    Ok(parse_ls_tree(&output.stdout_text()))
}

/// Contents of the blob at `path` in `rev`.
#[instrument(skip(runner), fields(git_dir = %git_dir.display()))]
pub async fn cat_blob(
    runner: &dyn ProcessRunner,
    git_dir: &Path,
    rev: &str,
    path: &str,
) -> Result<Vec<u8>, GitError> {
    let mut git_dir_arg = std::ffi::OsString::from("--git-dir=");
    git_dir_arg.push(git_dir.as_os_str());
    let spec = CommandSpec::new([git_dir_arg])
        .arg("cat-file")
        .arg("blob")
        .arg(format!("{rev}:{path}"));
    Ok(run(runner, "cat-file", spec).await?.stdout)
}

/// `git --version`, trimmed.
pub async fn version(runner: &dyn ProcessRunner) -> Result<String, GitError> {
    let output = run(runner, "--version", CommandSpec::new(["--version"])).await?;
    Ok(output.stdout_text().trim().to_string())
}

/// Parse NUL-terminated `git ls-tree -z` records:
/// `<mode> SP <type> SP <object> TAB <file>`.
fn parse_ls_tree(stdout: &str) -> Vec<TreeEntry> {
    stdout
        .split('\0')
        .filter(|record| !record.is_empty())
        .filter_map(|record| {
            let (meta, path) = record.split_once('\t')?;
            let mut fields = meta.split_whitespace();
            Some(TreeEntry {
                mode: fields.next()?.to_string(),
                kind: fields.next()?.to_string(),
                oid: fields.next()?.to_string(),
                path: path.to_string(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Smart-HTTP subprocess specs
// ---------------------------------------------------------------------------

/// `git <svc> --stateless-rpc --advertise-refs <repo>`.
pub fn advertise_refs_spec(service: Service, repo: &Path) -> CommandSpec {
    CommandSpec::new([service.subcommand(), "--stateless-rpc", "--advertise-refs"])
        .arg(repo)
        .current_dir(repo)
}

/// `git <svc> --stateless-rpc <repo>`.
pub fn stateless_rpc_spec(service: Service, repo: &Path) -> CommandSpec {
    CommandSpec::new([service.subcommand(), "--stateless-rpc"])
        .arg(repo)
        .current_dir(repo)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
