use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::{
    blobs::BlobStore,
    digest::Digest,
    error::{Error, Result},
    registry::DeploymentRegistry,
};

/// One file of a deployment: where it goes, what it must hash to and, optionally, its bytes.
#[derive(Clone, Debug)]
pub struct FileEntry {
    pub filename: String,
    pub digest: Digest,
    pub content: Option<String>,
}

#[cfg(test)]
impl FileEntry {
    pub(crate) fn new(filename: &str, content: &str) -> Self {
        Self {
            filename: filename.to_string(),
            digest: Digest::of(content.as_bytes()),
            content: Some(content.to_string()),
        }
    }

    pub(crate) fn without_content(mut self) -> Self {
        self.content = None;
        self
    }
}

/// Identity of a deployment: sha256 over its sorted, comma-joined file digests.
///
/// Filenames are deliberately left out, so file sets that only differ in naming share an id.
pub fn deployment_digest(entries: &[FileEntry]) -> Digest {
    let mut digests: Vec<&str> = entries.iter().map(|entry| entry.digest.as_str()).collect();
    digests.sort_unstable();
    Digest::of(digests.join(",").as_bytes())
}

fn validate_filename(filename: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();

    for component in Path::new(filename).components() {
        match component {
            Component::Normal(name) => relative.push(name),
            Component::CurDir => {}
            _ => return Err(Error::InvalidFilename(filename.to_string())),
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(Error::InvalidFilename(filename.to_string()));
    }

    Ok(relative)
}

/// Checks every filename of a request before anything touches the disk.
///
/// Two entries may not resolve to the same path, and no entry may sit where another one
/// needs a directory.
fn validate_filenames(entries: &[FileEntry]) -> Result<Vec<PathBuf>> {
    let mut seen = HashSet::with_capacity(entries.len());
    let mut relative_paths = Vec::with_capacity(entries.len());

    for entry in entries {
        let relative = validate_filename(&entry.filename)?;
        if !seen.insert(relative.clone()) {
            return Err(Error::InvalidFilename(entry.filename.clone()));
        }
        relative_paths.push(relative);
    }

    for (entry, relative) in entries.iter().zip(&relative_paths) {
        if relative.ancestors().skip(1).any(|parent| seen.contains(parent)) {
            return Err(Error::InvalidFilename(entry.filename.clone()));
        }
    }

    Ok(relative_paths)
}

pub struct DeploymentBuilder {
    root: PathBuf,
    blobs: Arc<BlobStore>,
    registry: Arc<DeploymentRegistry>,
}

impl DeploymentBuilder {
    pub fn new(root: PathBuf, blobs: Arc<BlobStore>, registry: Arc<DeploymentRegistry>) -> Self {
        Self {
            root,
            blobs,
            registry,
        }
    }

    pub fn deployment_path(&self, deployment: &Digest) -> PathBuf {
        self.root.join(deployment.as_str())
    }

    /// Stores any new blobs, materializes the deployment directory and publishes it as latest.
    ///
    /// Nothing is published unless every file was linked. Blobs stored before a failure stay
    /// in the blob store.
    pub async fn build(&self, entries: &[FileEntry]) -> Result<Digest> {
        if entries.is_empty() {
            return Err(Error::EmptyDeployment);
        }

        let relative_paths = validate_filenames(entries)?;

        for entry in entries {
            match &entry.content {
                Some(content) => self.blobs.put(&entry.digest, content.as_bytes()).await?,
                None => {
                    if !self.blobs.exists(&entry.digest).await? {
                        return Err(Error::MissingBlobData {
                            digest: entry.digest.clone(),
                        });
                    }
                }
            }
        }

        let deployment = deployment_digest(entries);
        let deployment_path = self.deployment_path(&deployment);

        tokio::fs::create_dir_all(&deployment_path)
            .await
            .with_context(|| format!("Unable to create deployment directory {deployment_path:?}"))?;

        for (entry, relative) in entries.iter().zip(relative_paths) {
            self.link(&deployment, &deployment_path.join(relative), entry)
                .await?;
        }

        self.registry.publish(&deployment).await?;

        info!(%deployment, files = entries.len(), "Built deployment");

        Ok(deployment)
    }

    async fn link(&self, deployment: &Digest, target: &Path, entry: &FileEntry) -> Result<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to ensure deployment subdirectory exists")?;
        }

        let source = self.blobs.blob_path(&entry.digest);

        match tokio::fs::hard_link(&source, target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let existing = tokio::fs::read(target).await?;
                if Digest::of(&existing) == entry.digest {
                    debug!(%deployment, filename = %entry.filename, "File already linked");
                    return Ok(());
                }

                Err(Error::LinkConflict {
                    deployment: deployment.clone(),
                    filename: entry.filename.clone(),
                })
            }
            Err(err) => {
                debug!("Hard link of {:?} failed ({err}), copying instead", entry.filename);
                self.copy(&source, target).await
            }
        }
    }

    async fn copy(&self, source: &Path, target: &Path) -> Result<()> {
        let temp = self.blobs.temp_path();

        tokio::fs::copy(source, &temp)
            .await
            .with_context(|| format!("Unable to copy blob {source:?}"))?;

        if let Err(err) = tokio::fs::rename(&temp, target).await {
            if let Err(cleanup) = tokio::fs::remove_file(&temp).await {
                warn!("Unable to remove temporary copy {temp:?}: {cleanup:?}");
            }
            return Err(err.into());
        }

        Ok(())
    }
}
