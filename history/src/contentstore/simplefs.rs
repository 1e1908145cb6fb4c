use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{instrument, trace};

use super::ContentStore;
use crate::{B3Digest, Error};

/// Stores payloads on a POSIX-compliant filesystem.
///
/// It takes a path, builds a `tmp` directory and a `blobs` directory inside of it. All
/// payloads received are staged in that `tmp` directory, fsynced, and then moved **atomically**
/// into `blobs/HEX[:4]/HEX` in a sharding style, e.g. `abcdef…` gets turned into
/// `abcd/abcdef…`.
///
/// Every put uses its own temporary file, so concurrent puts of unrelated payloads never
/// wait on each other.
#[derive(Clone)]
pub struct SimpleFilesystemContentStore {
    /// Where the blobs are located on a filesystem already mounted.
    path: PathBuf,
}

impl SimpleFilesystemContentStore {
    pub async fn new(path: PathBuf) -> Result<Self, Error> {
        tokio::fs::create_dir_all(&path).await?;
        tokio::fs::create_dir_all(path.join("tmp")).await?;
        tokio::fs::create_dir_all(path.join("blobs")).await?;

        Ok(Self { path })
    }
}

fn derive_path(root: &Path, digest: &B3Digest) -> PathBuf {
    let pathname = digest.to_hex();

    root.join("blobs").join(&pathname[..4]).join(pathname)
}

#[async_trait]
impl ContentStore for SimpleFilesystemContentStore {
    #[instrument(skip_all, ret, err, fields(content.digest=%digest))]
    async fn has(&self, digest: &B3Digest) -> Result<bool, Error> {
        Ok(tokio::fs::try_exists(derive_path(&self.path, digest)).await?)
    }

    #[instrument(skip_all, err, fields(content.digest=%digest))]
    async fn get(&self, digest: &B3Digest) -> Result<Option<Bytes>, Error> {
        let data = match tokio::fs::read(derive_path(&self.path, digest)).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        super::verify(digest, &data)?;
        Ok(Some(data))
    }

    #[instrument(skip_all, err, fields(content.size = data.len()))]
    async fn put(&self, data: Bytes) -> Result<B3Digest, Error> {
        let digest = B3Digest::of(&data);
        let dst_path = derive_path(&self.path, &digest);

        if tokio::fs::try_exists(&dst_path).await? {
            trace!(content.digest=%digest, "already present");
            return Ok(digest);
        }

        let mut file = async_tempfile::TempFile::new_in(self.path.join("tmp"))
            .await
            .map_err(|e| match e {
                async_tempfile::Error::Io(io_error) => Error::from(io_error),
                async_tempfile::Error::InvalidFile => {
                    Error::StorageError("invalid or missing file specified".to_string())
                }
                async_tempfile::Error::InvalidDirectory => {
                    Error::StorageError("invalid or missing directory specified".to_string())
                }
            })?;

        file.write_all(&data).await?;
        file.flush().await?;
        file.sync_all().await?;

        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(file.file_path(), &dst_path).await?;

        Ok(digest)
    }
}
