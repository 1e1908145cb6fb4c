use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use lochist_history::HistoryConfig;
use tracing::Level;

/// Keeps a local history of a directory tree.
#[derive(Parser, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Where the history is stored.
    #[clap(long, env = "LOCHIST_HISTORY_DIR", default_value = ".lochist")]
    pub history_dir: PathBuf,

    /// A TOML file with engine settings.
    #[clap(long, env = "LOCHIST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Where file payloads are kept, as an URL (memory://, simplefs:///path).
    /// Defaults to the history directory.
    #[clap(long, env = "LOCHIST_CONTENT_STORE")]
    pub content_store: Option<String>,

    /// Overrides `inline_threshold` of the config.
    #[clap(long, env = "LOCHIST_INLINE_THRESHOLD")]
    pub inline_threshold: Option<usize>,

    /// Overrides `gateway_timeout` of the config, in milliseconds.
    #[clap(long, env = "LOCHIST_GATEWAY_TIMEOUT")]
    pub gateway_timeout: Option<u64>,

    #[arg(long, default_value_t=Level::INFO)]
    pub log_level: Level,

    #[command(subcommand)]
    pub command: Commands,
}

impl Args {
    /// Applies the settings given on the command line on top of `config`.
    pub fn override_config(&self, mut config: HistoryConfig) -> HistoryConfig {
        if let Some(inline_threshold) = self.inline_threshold {
            config.inline_threshold = inline_threshold;
        }
        if let Some(millis) = self.gateway_timeout {
            config.gateway_timeout = Duration::from_millis(millis);
        }
        config
    }
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Records the current state of a directory as a new change set.
    Record {
        #[clap(value_name = "DIR")]
        dir: PathBuf,

        /// Name of the change set.
        #[arg(long)]
        name: Option<String>,
    },
    /// Lists change sets and labels, newest first.
    Log {
        /// Only show those affecting this path.
        path: Option<String>,
    },
    /// Puts a label on an existing version.
    Label { version: u64, name: Option<String> },
    /// Commits an empty, named change set, which shows up in the log of
    /// every path.
    Checkpoint { name: String },
    /// Prints a file, or lists a directory, as of a version.
    Show {
        path: String,

        /// Defaults to the current version.
        #[arg(long)]
        version: Option<u64>,
    },
    /// Brings a directory back to an older version.
    Revert {
        #[clap(value_name = "DIR")]
        dir: PathBuf,

        version: u64,

        /// Only revert this path.
        #[arg(long)]
        path: Option<String>,
    },
}
