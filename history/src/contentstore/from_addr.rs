use std::sync::Arc;
use url::Url;

use super::{ContentStore, MemoryContentStore, SimpleFilesystemContentStore};
use crate::Error;

/// Constructs a new instance of a [ContentStore] from an URI.
///
/// The following schemes are supported by the following stores:
/// - `memory://` ([MemoryContentStore])
/// - `simplefs:///absolute/path` ([SimpleFilesystemContentStore])
pub async fn from_addr(uri: &str) -> Result<Arc<dyn ContentStore>, Error> {
    let url =
        Url::parse(uri).map_err(|e| Error::InvalidRequest(format!("unable to parse url: {}", e)))?;

    let content_store: Arc<dyn ContentStore> = match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::InvalidRequest("invalid url".to_string()));
            }
            Arc::new(MemoryContentStore::default())
        }
        "simplefs" => {
            if url.has_host() {
                return Err(Error::InvalidRequest("no host allowed".to_string()));
            }

            if url.path().is_empty() || url.path() == "/" {
                return Err(Error::InvalidRequest(
                    "cowardly refusing to use / (or nothing) as content store".to_string(),
                ));
            }

            Arc::new(SimpleFilesystemContentStore::new(url.path().into()).await?)
        }
        scheme => {
            return Err(Error::InvalidRequest(format!(
                "unknown scheme: {}",
                scheme
            )))
        }
    };

    Ok(content_store)
}
