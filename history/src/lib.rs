mod digests;
mod errors;

pub mod changelog;
pub mod changes;
pub mod config;
pub mod content;
pub mod contentstore;
mod engine;
pub mod feed;
pub mod fixtures;
pub mod gateway;
pub mod index;
pub mod labels;
pub mod path;
pub mod proto;
pub mod revert;
pub mod revision;
pub mod tree;

pub use config::HistoryConfig;
pub use digests::{B3Digest, B3_LEN};
pub use engine::LocalHistory;
pub use errors::Error;

#[cfg(test)]
mod tests;

// Required so rstest_reuse templates can resolve `$crate::rstest_reuse`.
#[cfg(test)]
use rstest_reuse;
