//! Repository metadata records.
//!
//! The hosting platform keeps one metadata row per repository (mode, source,
//! clone URL, ...).  [`RepositoryCatalog`] is the seam to whatever persists
//! them; [`FsCatalog`] stores one JSON document per project token.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::paths::validate_token;

/// How a repository came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoMode {
    Create,
    Mirror,
    Generate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoMetadata {
    pub project_token: String,
    pub mode: RepoMode,
    pub repository_name: Option<String>,
    pub description: Option<String>,
    /// Upstream URL for mirrors, with any embedded credentials removed.
    pub source_url: Option<String>,
    pub clone_url: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait RepositoryCatalog: Send + Sync {
    async fn record(&self, meta: &RepoMetadata) -> Result<()>;
    async fn get(&self, project_token: &str) -> Result<Option<RepoMetadata>>;
}

// ---------------------------------------------------------------------------
// File-backed catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FsCatalog {
    dir: PathBuf,
}

impl FsCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, project_token: &str) -> Result<PathBuf> {
        validate_token(project_token)?;
        Ok(self.dir.join(format!("{project_token}.json")))
    }
}

#[async_trait]
impl RepositoryCatalog for FsCatalog {
    #[instrument(skip(self, meta), fields(project = %meta.project_token))]
    async fn record(&self, meta: &RepoMetadata) -> Result<()> {
        let path = self.record_path(&meta.project_token)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create catalog dir {}", self.dir.display()))?;

        let json = serde_json::to_vec_pretty(meta).context("failed to encode metadata")?;
        // Write-then-rename so readers never see a partial record.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move {} into place", path.display()))?;

        debug!(path = %path.display(), "metadata recorded");
        Ok(())
    }

    async fn get(&self, project_token: &str) -> Result<Option<RepoMetadata>> {
        let path = self.record_path(project_token)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let meta = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt metadata record {}", path.display()))?;
                Ok(Some(meta))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read metadata {}", path.display()))
            }
        }
    }
}

/// Remove userinfo (`user:token@`) from a URL before it is persisted or logged.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let (authority, path) = rest.split_at(authority_end);
    match authority.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://{host}{path}"),
        None => url.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
