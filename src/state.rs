use std::sync::Arc;

use anyhow::Context;
use ring::constant_time;
use serde_json::Value;
use tracing::warn;

use crate::{
    blobs::BlobStore,
    config::Configuration,
    deployments::{DeploymentBuilder, FileEntry},
    digest::Digest,
    error::{Error, Result},
    loader::{EntryPoint, Loader},
    metrics::Metrics,
    registry::DeploymentRegistry,
};

pub struct AppState {
    pub config: Configuration,
    pub blobs: Arc<BlobStore>,
    pub registry: Arc<DeploymentRegistry>,
    pub builder: DeploymentBuilder,
    pub loader: Loader,
    pub metrics: Metrics,
}

impl AppState {
    pub async fn open(config: Configuration, metrics: Metrics) -> Result<Self> {
        for dir in [
            config.blobs_path(),
            config.deployments_path(),
            config.uploads_path(),
            config.process_state_path(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Unable to create storage directory {dir:?}"))?;
        }

        let blobs = Arc::new(BlobStore::new(config.blobs_path(), config.uploads_path()));
        let registry = Arc::new(DeploymentRegistry::open(&config.storage).await?);
        let builder =
            DeploymentBuilder::new(config.deployments_path(), blobs.clone(), registry.clone());
        let loader = Loader::new(
            config.deployments_path(),
            config.process_state_path(),
            registry.clone(),
            config.logic.clone(),
            config.context.clone(),
        );

        Ok(Self {
            config,
            blobs,
            registry,
            builder,
            loader,
            metrics,
        })
    }

    pub fn check_token(&self, supplied: Option<&str>) -> Result<()> {
        match (&self.config.deploy_token, supplied) {
            (Some(expected), Some(supplied))
                if constant_time::verify_slices_are_equal(
                    expected.as_bytes(),
                    supplied.as_bytes(),
                )
                .is_ok() =>
            {
                Ok(())
            }
            (None, _) => {
                warn!("Refusing deploy, no deploy_token is configured");
                Err(Error::Unauthorized)
            }
            _ => {
                warn!("Refusing deploy with invalid token");
                Err(Error::Unauthorized)
            }
        }
    }

    /// Builds and publishes a deployment. Callers must have checked the deploy token.
    pub async fn build(&self, files: &[FileEntry]) -> Result<Digest> {
        let result = self.builder.build(files).await;
        self.metrics.record_deployment(&result);
        result
    }

    /// Runs one inbound event against whatever deployment is active right now.
    pub async fn dispatch(&self, entry_point: EntryPoint, payload: &Value) -> Result<Value> {
        let result = match self.loader.load_active().await {
            Ok(logic) => logic.invoke(entry_point, payload).await,
            Err(err) => Err(err),
        };
        self.metrics.record_event(entry_point, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use test_log::test;

    use crate::tests::{FixtureBuilder, StateFixture, TOKEN};

    use super::*;

    #[test(tokio::test)]
    async fn check_token() -> Result<()> {
        let fixture = StateFixture::new().await?;

        assert!(fixture.check_token(Some(TOKEN)).is_ok());
        assert!(matches!(
            fixture.check_token(Some("meo")),
            Err(Error::Unauthorized)
        ));
        assert!(matches!(
            fixture.check_token(Some("meowmeow")),
            Err(Error::Unauthorized)
        ));
        assert!(matches!(fixture.check_token(None), Err(Error::Unauthorized)));

        fixture.teardown().await?;

        let fixture = StateFixture::with_builder(FixtureBuilder::new().deploy_token(None)).await?;
        assert!(matches!(
            fixture.check_token(Some(TOKEN)),
            Err(Error::Unauthorized)
        ));

        fixture.teardown().await
    }
}
