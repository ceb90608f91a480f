use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use crate::{
    digest::Digest,
    error::{Error, Result},
};

/// Write-once storage of raw file contents, addressed by their SHA-256.
pub struct BlobStore {
    root: PathBuf,
    uploads: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf, uploads: PathBuf) -> Self {
        Self { root, uploads }
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.to_path())
    }

    pub(crate) fn temp_path(&self) -> PathBuf {
        self.uploads.join(Uuid::new_v4().as_hyphenated().to_string())
    }

    pub async fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(digest)).await?)
    }

    /// Stores `content` under `digest` unless it is already there.
    ///
    /// The content is hashed and rejected when it doesn't match the digest. New blobs are
    /// written to a temporary file and linked into place, so the blob path never holds a
    /// partial write and an existing blob is never replaced.
    pub async fn put(&self, digest: &Digest, content: &[u8]) -> Result<()> {
        if Digest::of(content) != *digest {
            return Err(Error::CorruptBlob {
                digest: digest.clone(),
            });
        }

        let dest = self.blob_path(digest);
        if tokio::fs::try_exists(&dest).await? {
            debug!(%digest, "Blob already stored");
            return Ok(());
        }

        let parent = dest.parent().context("Could not construct parent path")?;
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to ensure blob path exists")?;

        let temp = self.temp_path();
        let result = self.write_and_link(&temp, &dest, content).await;

        if let Err(err) = tokio::fs::remove_file(&temp).await {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!("Error whilst removing temporary file {temp:?}: {err:?}");
            }
        }

        result?;
        debug!(%digest, size = content.len(), "Stored blob");

        Ok(())
    }

    async fn write_and_link(&self, temp: &Path, dest: &Path, content: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.uploads)
            .await
            .context("Failed to ensure uploads path exists")?;

        let mut file = File::create(temp)
            .await
            .with_context(|| format!("Unable to create temporary file: {temp:?}"))?;
        file.write_all(content)
            .await
            .context("Unable to write to temporary file")?;
        file.sync_all().await.context("Failed to fsync")?;
        drop(file);

        match tokio::fs::hard_link(temp, dest).await {
            Ok(()) => Ok(()),
            // Another request stored the same content first
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => {
                debug!("Hard link into blob store failed ({err}), renaming instead");
                tokio::fs::rename(temp, dest)
                    .await
                    .with_context(|| format!("Unable to move blob into place: {dest:?}"))?;
                Ok(())
            }
        }
    }

    pub async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        match tokio::fs::read(self.blob_path(digest)).await {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(Error::BlobNotFound {
                digest: digest.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::tempdir;
    use test_log::test;

    use super::*;

    fn store(dir: &Path) -> BlobStore {
        BlobStore::new(dir.join("blobs"), dir.join("uploads"))
    }

    #[test(tokio::test)]
    async fn put_then_get() -> Result<()> {
        let dir = tempdir()?;
        let blobs = store(dir.path());
        let digest = Digest::of(b"module.exports = {}");

        assert!(!blobs.exists(&digest).await?);

        blobs.put(&digest, b"module.exports = {}").await?;

        assert!(blobs.exists(&digest).await?);
        assert_eq!(blobs.get(&digest).await?, b"module.exports = {}");
        assert!(blobs.blob_path(&digest).starts_with(dir.path().join("blobs")));

        Ok(())
    }

    #[test(tokio::test)]
    async fn put_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let blobs = store(dir.path());
        let digest = Digest::of(b"same bytes");

        blobs.put(&digest, b"same bytes").await?;
        let first = std::fs::metadata(blobs.blob_path(&digest))?.modified()?;

        blobs.put(&digest, b"same bytes").await?;
        let second = std::fs::metadata(blobs.blob_path(&digest))?.modified()?;

        assert_eq!(first, second);
        assert_eq!(blobs.get(&digest).await?, b"same bytes");

        // No temporary files are left behind
        assert_eq!(std::fs::read_dir(dir.path().join("uploads"))?.count(), 0);

        Ok(())
    }

    #[test(tokio::test)]
    async fn put_rejects_mismatched_content() -> Result<()> {
        let dir = tempdir()?;
        let blobs = store(dir.path());
        let digest = Digest::of(b"expected");

        let err = blobs.put(&digest, b"something else").await.unwrap_err();

        assert!(matches!(err, Error::CorruptBlob { .. }));
        assert!(!blobs.exists(&digest).await?);

        Ok(())
    }

    #[test(tokio::test)]
    async fn get_missing() -> Result<()> {
        let dir = tempdir()?;
        let blobs = store(dir.path());

        let err = blobs.get(&Digest::of(b"never stored")).await.unwrap_err();
        assert!(matches!(err, Error::BlobNotFound { .. }));

        Ok(())
    }
}
