use std::{
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use anyhow::Context;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::info;

use crate::{digest::Digest, error::Result};

const LATEST_DEPLOYMENT: &str = "latest_deployment";

/// The durable "latest deployment" pointer.
///
/// Readers only ever see the in-memory copy. Writers go through [`DeploymentRegistry::publish`],
/// which replaces the record on disk atomically before the in-memory copy changes.
pub struct DeploymentRegistry {
    path: PathBuf,
    current: RwLock<Option<Digest>>,
    writer: Mutex<()>,
}

impl DeploymentRegistry {
    /// Opens the registry under `storage`, rehydrating the last published deployment.
    pub async fn open(storage: &Path) -> Result<Self> {
        let path = storage.join(LATEST_DEPLOYMENT);

        let current = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let digest: Digest = contents.trim().parse()?;
                info!(deployment = %digest, "Latest deployment found");
                Some(digest)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("No deployment found");
                None
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            current: RwLock::new(current),
            writer: Mutex::new(()),
        })
    }

    pub fn current(&self) -> Option<Digest> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn publish(&self, deployment: &Digest) -> Result<()> {
        let _guard = self.writer.lock().await;

        let path = self.path.clone();
        let contents = deployment.to_string();
        tokio::task::spawn_blocking(move || persist(&path, &contents))
            .await
            .context("Persist task failed")??;

        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(deployment.clone());

        info!(%deployment, "Published deployment");

        Ok(())
    }
}

fn persist(path: &Path, contents: &str) -> anyhow::Result<()> {
    let parent = path.parent().context("Could not construct parent path")?;

    let mut file = NamedTempFile::new_in(parent)
        .with_context(|| format!("Unable to create temporary file in {parent:?}"))?;
    file.write_all(contents.as_bytes())
        .context("Unable to write deployment record")?;
    file.as_file().sync_all().context("Failed to fsync")?;
    file.persist(path)
        .with_context(|| format!("Unable to replace {path:?}"))?;

    Ok(())
}
