pub mod args;
mod errors;
pub mod scan;

pub use errors::Error;

use std::path::Path;
use std::sync::Arc;

use args::Args;
use lochist_history::contentstore::{self, ContentStore};
use lochist_history::{HistoryConfig, LocalHistory};

/// Loads the engine settings, falling back to the defaults without a file.
pub async fn load_config(path: Option<&Path>) -> Result<HistoryConfig, Error> {
    let Some(path) = path else {
        return Ok(HistoryConfig::default());
    };

    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::UnableToRead(path.to_path_buf(), e))?;
    toml::from_str(&raw).map_err(|e| Error::InvalidConfig(path.to_path_buf(), e))
}

/// Opens the history the arguments point at.
pub async fn open_history(args: &Args) -> Result<LocalHistory, Error> {
    let config = args.override_config(load_config(args.config.as_deref()).await?);
    config.validate()?;

    let history = match &args.content_store {
        Some(addr) => {
            let store: Arc<dyn ContentStore> = contentstore::from_addr(addr).await?;
            LocalHistory::open_with_store(&args.history_dir, config, store).await?
        }
        None => LocalHistory::open(&args.history_dir, config).await?,
    };
    Ok(history)
}
