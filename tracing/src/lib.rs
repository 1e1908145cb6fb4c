//! Logging setup shared by the lochist binaries.
use indicatif::ProgressStyle;
use lazy_static::lazy_static;
use std::io::Write;
use tracing::Level;
use tracing_indicatif::{filter::IndicatifFilter, writer, IndicatifLayer, IndicatifWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

lazy_static! {
    pub static ref PB_PROGRESS_STYLE: ProgressStyle = ProgressStyle::with_template(
        "{span_child_prefix} {wide_msg} {bar:10} ({elapsed}) {pos:>7}/{len:7}"
    )
    .expect("invalid progress template");
    pub static ref PB_SPINNER_STYLE: ProgressStyle = ProgressStyle::with_template(
        "{span_child_prefix}{spinner} {wide_msg} ({elapsed}) {pos:>7}"
    )
    .expect("invalid progress template");
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid RUST_LOG: {0}")]
    Filter(#[from] tracing_subscriber::filter::FromEnvError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Returned by [TracingBuilder::build], keeps access to the output streams.
#[derive(Clone)]
pub struct TracingHandle {
    stdout_writer: IndicatifWriter<writer::Stdout>,
    stderr_writer: IndicatifWriter<writer::Stderr>,
}

impl TracingHandle {
    /// A writer for [std::io::Stdout] that suspends active progress bars
    /// while writing.
    ///
    /// Instead of `println!(...)` prefer `writeln!(handle.get_stdout_writer(), ...)`
    pub fn get_stdout_writer(&self) -> IndicatifWriter<writer::Stdout> {
        // only a wrapper over an `Arc`
        self.stdout_writer.clone()
    }

    /// Like [TracingHandle::get_stdout_writer], for [std::io::Stderr].
    pub fn get_stderr_writer(&self) -> IndicatifWriter<writer::Stderr> {
        self.stderr_writer.clone()
    }

    /// Flushes both output streams. Call this before exiting.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.get_stdout_writer().flush()?;
        self.get_stderr_writer().flush()?;
        Ok(())
    }
}

pub struct TracingBuilder {
    level: Level,
    progress_bar: bool,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        TracingBuilder {
            level: Level::INFO,
            progress_bar: false,
        }
    }
}

impl TracingBuilder {
    /// The default level. RUST_LOG still takes precedence over it.
    pub fn level(mut self, level: Level) -> TracingBuilder {
        self.level = level;
        self
    }

    /// Shows progress bars for spans that ask for one, off by default.
    pub fn enable_progressbar(mut self) -> TracingBuilder {
        self.progress_bar = true;
        self
    }

    /// Installs the global subscriber: an [EnvFilter] built from RUST_LOG
    /// (falling back to the configured level), a compact fmt layer on stderr,
    /// and the progress bar layer if enabled.
    pub fn build(self) -> Result<TracingHandle, Error> {
        let indicatif_layer = IndicatifLayer::new().with_progress_style(PB_SPINNER_STYLE.clone());
        let stdout_writer = indicatif_layer.get_stdout_writer();
        let stderr_writer = indicatif_layer.get_stderr_writer();

        tracing_subscriber::registry()
            .with(
                EnvFilter::builder()
                    .with_default_directive(self.level.into())
                    .from_env()?,
            )
            .with(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(indicatif_layer.get_stderr_writer())
                    .compact(),
            )
            .with(self.progress_bar.then(|| {
                // only spans with the indicatif.pb_show field get a bar
                indicatif_layer.with_filter(IndicatifFilter::new(false))
            }))
            .try_init()?;

        Ok(TracingHandle {
            stdout_writer,
            stderr_writer,
        })
    }
}
