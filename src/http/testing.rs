//! Router fixture shared by the HTTP handler tests.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tempfile::TempDir;

use crate::auth::directory::Directory;
use crate::config::Config;
use crate::git::testing::FakeRunner;
use crate::git::TokioRunner;
use crate::AppState;

/// An [`AppState`] rooted in a temporary directory, backed by a
/// [`FakeRunner`] and an in-memory identity directory.
pub(crate) struct TestApp {
    pub state: Arc<AppState>,
    pub runner: Arc<FakeRunner>,
    directory: Arc<Directory>,
    _tmp: TempDir,
}

impl TestApp {
    pub fn new(runner: FakeRunner, directory_yaml: &str) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.repositories_path = tmp.path().join("repositories");
        config.storage.projects_path = tmp.path().join("projects");
        config.storage.catalog_path = tmp.path().join("catalog");
        std::fs::create_dir_all(&config.storage.repositories_path).unwrap();
        std::fs::create_dir_all(&config.storage.projects_path).unwrap();

        let runner = Arc::new(runner);
        let directory = Arc::new(Directory::from_yaml(directory_yaml).unwrap());
        let state = Self::build(config, &runner, &directory);
        Self {
            state,
            runner,
            directory,
            _tmp: tmp,
        }
    }

    fn build(config: Config, runner: &Arc<FakeRunner>, directory: &Arc<Directory>) -> Arc<AppState> {
        Arc::new(AppState::new(
            Arc::new(config),
            runner.clone(),
            directory.clone(),
            directory.clone(),
        ))
    }

    /// Rebuild the state with an adjusted configuration.
    pub fn configure(&mut self, f: impl FnOnce(&mut Config)) {
        let mut config = (*self.state.config).clone();
        f(&mut config);
        self.state = Self::build(config, &self.runner, &self.directory);
    }

    pub fn router(&self) -> Router {
        crate::http::handler::create_router(Arc::clone(&self.state))
    }

    pub fn repo_dir(&self, token: &str) -> PathBuf {
        self.state
            .config
            .storage
            .repositories_path
            .join(format!("{token}.git"))
    }

    /// Stand-in for a bare repository; the fake runner never looks inside.
    pub fn create_repo_dir(&self, token: &str) {
        std::fs::create_dir_all(self.repo_dir(token)).unwrap();
    }
}

/// An [`AppState`] over a temporary directory that runs the real `git`
/// binary.  Reads are open to anonymous clients.
pub(crate) struct GitApp {
    pub state: Arc<AppState>,
    _tmp: TempDir,
}

impl GitApp {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.repositories_path = tmp.path().join("repositories");
        config.storage.projects_path = tmp.path().join("projects");
        config.storage.catalog_path = tmp.path().join("catalog");
        std::fs::create_dir_all(&config.storage.repositories_path).unwrap();
        std::fs::create_dir_all(&config.storage.projects_path).unwrap();

        let runner = Arc::new(TokioRunner::new(config.git.binary.clone()));
        let directory = Arc::new(Directory::from_yaml("{}").unwrap());
        let state = Arc::new(AppState::new(
            Arc::new(config),
            runner,
            directory.clone(),
            directory,
        ));
        Self { state, _tmp: tmp }
    }

    pub fn router(&self) -> Router {
        crate::http::handler::create_router(Arc::clone(&self.state))
    }

    /// Commit a one-file working tree into `<token>.git`.
    pub async fn seed(&self, token: &str, file: &str, contents: &str) {
        let work = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join(file), contents).unwrap();
        self.state.store.materialize(work.path(), token).await.unwrap();
    }

    /// Serve the router on an ephemeral loopback port and return its base URL.
    pub async fn serve(&self) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = self.router();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }
}
