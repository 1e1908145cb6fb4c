use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};
use std::num::NonZeroUsize;
use std::time::Duration;

use crate::content::DEFAULT_INLINE_THRESHOLD;
use crate::feed::{GlobTrackingPolicy, GroupingPolicy};
use crate::Error;

/// Tunables of a [crate::LocalHistory].
/// Every field has a default, so an empty document is a valid config.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryConfig {
    /// File payloads up to this size are kept inline in the log.
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold: usize,

    /// A checkpoint of the tree is persisted every that many versions.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    #[serde(default = "default_revision_cache_size")]
    pub revision_cache_size: NonZeroUsize,

    /// Upper bound for every single call to the file system gateway.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout: Duration,

    #[serde(default)]
    pub grouping: GroupingPolicy,

    /// Glob patterns of paths that aren't tracked.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

fn default_inline_threshold() -> usize {
    DEFAULT_INLINE_THRESHOLD
}

fn default_checkpoint_interval() -> u64 {
    64
}

fn default_revision_cache_size() -> NonZeroUsize {
    NonZeroUsize::new(32).unwrap_or(NonZeroUsize::MIN)
}

fn default_gateway_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_exclude() -> Vec<String> {
    vec![".git/".into(), ".lochist/".into()]
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            inline_threshold: default_inline_threshold(),
            checkpoint_interval: default_checkpoint_interval(),
            revision_cache_size: default_revision_cache_size(),
            gateway_timeout: default_gateway_timeout(),
            grouping: GroupingPolicy::default(),
            exclude: default_exclude(),
        }
    }
}

impl HistoryConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.checkpoint_interval == 0 {
            return Err(Error::InvalidRequest(
                "checkpoint_interval must be at least 1".into(),
            ));
        }
        if self.gateway_timeout.is_zero() {
            return Err(Error::InvalidRequest(
                "gateway_timeout must not be zero".into(),
            ));
        }
        Ok(())
    }

    /// The tracking policy described by `exclude`.
    pub fn tracking_policy(&self) -> Result<GlobTrackingPolicy, Error> {
        GlobTrackingPolicy::new(&self.exclude)
    }
}
