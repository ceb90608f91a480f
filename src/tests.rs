use std::{ops::Deref, time::Duration};

use anyhow::{Context, Result};
use axum::{Router, body::Body, http::Request, response::Response};
use http_body_util::BodyExt;
use prometheus_client::registry::Registry;
use serde_json::Value;
use tempfile::{TempDir, tempdir};
use tower::ServiceExt;

use crate::config::{Configuration, LogicConfig};

use super::*;

pub(crate) const TOKEN: &str = "meow";

pub(crate) struct FixtureBuilder {
    deploy_token: Option<String>,
    timeout: Duration,
}

impl FixtureBuilder {
    pub fn new() -> Self {
        Self {
            deploy_token: Some(TOKEN.to_string()),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn deploy_token(mut self, deploy_token: Option<&str>) -> Self {
        self.deploy_token = deploy_token.map(str::to_string);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn build(self) -> Result<StateFixture> {
        let dir = tempdir()?;

        let configuration = Configuration {
            storage: dir.path().to_path_buf(),
            deploy_token: self.deploy_token,
            logic: LogicConfig {
                entry: "index.sh".to_string(),
                interpreter: vec!["sh".to_string()],
                timeout: self.timeout,
            },
            ..Default::default()
        };

        let mut registry = Registry::with_prefix("hotdeploy");
        let metrics = Metrics::new(&mut registry);

        let state = Arc::new(AppState::open(configuration, metrics).await?);

        Ok(StateFixture { dir, state })
    }
}

#[must_use = "Fixture must be used and `.teardown().await` must be called to ensure proper cleanup."]
pub(crate) struct StateFixture {
    dir: TempDir,
    pub state: Arc<AppState>,
}

impl StateFixture {
    pub(crate) async fn new() -> Result<Self> {
        FixtureBuilder::new().build().await
    }

    pub(crate) async fn with_builder(builder: FixtureBuilder) -> Result<Self> {
        builder.build().await
    }

    pub(crate) async fn teardown(self) -> Result<()> {
        drop(self.state);
        self.dir.close().context("Failed to remove fixture storage")
    }
}

impl Deref for StateFixture {
    type Target = AppState;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

pub(crate) struct AppFixture {
    state: StateFixture,
    pub router: Router<()>,
}

impl AppFixture {
    pub async fn new() -> Result<AppFixture> {
        Ok(Self::with_state(StateFixture::new().await?))
    }

    pub fn with_state(state: StateFixture) -> AppFixture {
        let router = crate::router(state.state.clone());
        AppFixture { state, router }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn request(&self, req: Request<Body>) -> Result<Response> {
        self.router
            .clone()
            .oneshot(req)
            .await
            .context("Failed to make test request")
    }

    pub async fn teardown(self) -> Result<()> {
        drop(self.router);
        self.state.teardown().await
    }
}

pub(crate) async fn body_json(res: Response) -> Result<Value> {
    let body = res.into_body().collect().await?.to_bytes();
    serde_json::from_slice(&body).context("Response body is not JSON")
}
