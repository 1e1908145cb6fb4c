use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::instrument;

use super::ContentStore;
use crate::{B3Digest, Error};

#[derive(Clone, Default)]
pub struct MemoryContentStore {
    db: Arc<RwLock<HashMap<B3Digest, Bytes>>>,
}

impl MemoryContentStore {
    /// Number of payloads held.
    pub fn len(&self) -> usize {
        self.db.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.read().is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    #[instrument(skip(self, digest), fields(content.digest=%digest))]
    async fn has(&self, digest: &B3Digest) -> Result<bool, Error> {
        Ok(self.db.read().contains_key(digest))
    }

    #[instrument(skip(self, digest), fields(content.digest=%digest))]
    async fn get(&self, digest: &B3Digest) -> Result<Option<Bytes>, Error> {
        let data = match self.db.read().get(digest) {
            None => return Ok(None),
            Some(data) => data.clone(),
        };

        super::verify(digest, &data)?;
        Ok(Some(data))
    }

    #[instrument(skip_all, fields(content.size = data.len()))]
    async fn put(&self, data: Bytes) -> Result<B3Digest, Error> {
        let digest = B3Digest::of(&data);

        // Only insert if the payload doesn't already exist.
        if !self.db.read().contains_key(&digest) {
            self.db.write().insert(digest.clone(), data);
        }

        Ok(digest)
    }
}
