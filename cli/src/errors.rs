use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    History(#[from] lochist_history::Error),

    #[error("unable to read {0}: {1}")]
    UnableToRead(PathBuf, std::io::Error),

    #[error("unable to walk {0}: {1}")]
    UnableToWalk(PathBuf, walkdir::Error),

    #[error("{0} is outside the root")]
    OutsideRoot(PathBuf),

    #[error("invalid config {0}: {1}")]
    InvalidConfig(PathBuf, toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
