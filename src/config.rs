use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub access: AccessConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:5200`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    /// Externally reachable hostname used to compose clone URLs.
    #[serde(default = "default_public_host")]
    pub public_host: String,
    /// Externally reachable port used to compose clone URLs.
    #[serde(default = "default_public_port")]
    pub public_port: u16,
    /// `http` or `https`, depending on what terminates in front of us.
    #[serde(default = "default_public_scheme")]
    pub public_scheme: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            public_host: default_public_host(),
            public_port: default_public_port(),
            public_scheme: default_public_scheme(),
        }
    }
}

impl ServerConfig {
    /// Clone URL handed back to callers for a project token.
    pub fn clone_url(&self, token: &str) -> String {
        format!(
            "{}://{}:{}/repositories/{}.git",
            self.public_scheme, self.public_host, self.public_port, token
        )
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:5200".to_string()
}

fn default_public_host() -> String {
    "localhost".to_string()
}

fn default_public_port() -> u16 {
    5200
}

fn default_public_scheme() -> String {
    "http".to_string()
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding `<token>.git` bare repositories.
    #[serde(default = "default_repositories_path")]
    pub repositories_path: PathBuf,
    /// Root directory holding one working tree per project token.
    #[serde(default = "default_projects_path")]
    pub projects_path: PathBuf,
    /// Directory for repository metadata records.
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            repositories_path: default_repositories_path(),
            projects_path: default_projects_path(),
            catalog_path: default_catalog_path(),
        }
    }
}

fn default_repositories_path() -> PathBuf {
    PathBuf::from("/var/lib/githost/repositories")
}

fn default_projects_path() -> PathBuf {
    PathBuf::from("/var/lib/githost/projects")
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("/var/lib/githost/catalog")
}

// ---------------------------------------------------------------------------
// Git toolchain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    /// Path to (or name of) the git executable.
    #[serde(default = "default_git_binary")]
    pub binary: PathBuf,
    /// Author/committer name for snapshot commits.
    #[serde(default = "default_user_name")]
    pub user_name: String,
    /// Author/committer email for snapshot commits.
    #[serde(default = "default_user_email")]
    pub user_email: String,
    /// Upper bound on the lifetime of one protocol subprocess.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    /// Largest gzip-encoded request body accepted before decompression.
    #[serde(default = "default_max_gzip_body")]
    pub max_gzip_body_bytes: usize,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            user_name: default_user_name(),
            user_email: default_user_email(),
            rpc_timeout_secs: default_rpc_timeout(),
            max_gzip_body_bytes: default_max_gzip_body(),
        }
    }
}

fn default_git_binary() -> PathBuf {
    PathBuf::from("git")
}

fn default_user_name() -> String {
    "githost".to_string()
}

fn default_user_email() -> String {
    "githost@localhost".to_string()
}

fn default_rpc_timeout() -> u64 {
    600
}

fn default_max_gzip_body() -> usize {
    32 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Access control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// YAML document describing sessions, roles and memberships.
    #[serde(default = "default_directory_path")]
    pub directory_path: PathBuf,
    /// Role that is allowed every action on its project.
    #[serde(default = "default_owner_role")]
    pub owner_role: String,
    /// Role that is denied every action other than `read`.
    #[serde(default = "default_guest_role")]
    pub guest_role: String,
    /// Require `code:read` for fetches and ref advertisements.
    #[serde(default)]
    pub authorize_reads: bool,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            directory_path: default_directory_path(),
            owner_role: default_owner_role(),
            guest_role: default_guest_role(),
            authorize_reads: false,
        }
    }
}

fn default_directory_path() -> PathBuf {
    PathBuf::from("/etc/githost/directory.yaml")
}

fn default_owner_role() -> String {
    "PROJECT_OWNER".to_string()
}

fn default_guest_role() -> String {
    "GUEST".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from an optional YAML file, apply environment overrides
/// and validate the result.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Overlay the deployment environment onto `config`.
///
/// `lookup` abstracts `std::env::var` so the mapping can be tested without
/// mutating the process environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("REPOSITORIES_FOLDER_PATH") {
        config.storage.repositories_path = PathBuf::from(v);
    }
    if let Some(v) = lookup("PROJECTS_FOLDER_PATH") {
        config.storage.projects_path = PathBuf::from(v);
    }
    if let Some(v) = lookup("GITHOST_CATALOG_PATH") {
        config.storage.catalog_path = PathBuf::from(v);
    }
    if let Some(v) = lookup("GIT_USER") {
        config.git.user_name = v;
    }
    if let Some(v) = lookup("GIT_USER_EMAIL") {
        config.git.user_email = v;
    }
    if let Some(v) = lookup("SERVER_HOST") {
        config.server.public_host = v;
    }
    if let Some(v) = lookup("SERVER_PORT") {
        config.server.public_port = v
            .parse()
            .with_context(|| format!("SERVER_PORT is not a valid port: {v:?}"))?;
    }
    if let Some(v) = lookup("GITHOST_HTTP_LISTEN") {
        config.server.http_listen = v;
    }
    if let Some(v) = lookup("GITHOST_DIRECTORY_PATH") {
        config.access.directory_path = PathBuf::from(v);
    }
    Ok(())
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.storage.repositories_path.as_os_str().is_empty(),
        "storage.repositories_path must not be empty"
    );
    anyhow::ensure!(
        !config.storage.projects_path.as_os_str().is_empty(),
        "storage.projects_path must not be empty"
    );
    anyhow::ensure!(
        config.access.owner_role != config.access.guest_role,
        "access.owner_role and access.guest_role must differ"
    );
    anyhow::ensure!(
        config.git.rpc_timeout_secs > 0,
        "git.rpc_timeout_secs must be positive"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
