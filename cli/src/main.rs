use std::io::Write;

use clap::Parser;
use lochist_cli::args::{Args, Commands};
use lochist_cli::scan::scan;
use lochist_history::feed::Command;
use lochist_history::gateway::HostFsGateway;
use lochist_history::labels::LabelKind;
use lochist_history::path::PathBuf;
use lochist_history::revert::{RevertScope, RevertState};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let tracing_handle = lochist_tracing::TracingBuilder::default()
        .level(args.log_level)
        .enable_progressbar()
        .build()?;
    let mut stdout = tracing_handle.get_stdout_writer();

    let history = lochist_cli::open_history(&args).await?;

    match args.command {
        Commands::Record { dir, name } => {
            let policy = history.config().tracking_policy()?;
            let events = scan(&dir, &history.current(), &policy).await?;

            match history.apply(Command { events, name }).await? {
                Some(version) => writeln!(stdout, "recorded version {}", version)?,
                None => info!("nothing changed"),
            }
        }
        Commands::Log { path } => {
            let labels = match path {
                Some(path) => history.labels_for(&path.parse::<PathBuf>()?).await?,
                None => history.log().await?,
            };
            for label in labels {
                let marker = match label.kind {
                    LabelKind::Implicit => ' ',
                    LabelKind::Explicit => '*',
                };
                writeln!(
                    stdout,
                    "{:>6} {} {:>14} {}",
                    label.version,
                    marker,
                    label.timestamp,
                    label.name.as_deref().unwrap_or("")
                )?;
            }
        }
        Commands::Label { version, name } => {
            let label = history.label_change_set(version, name).await?;
            writeln!(stdout, "labelled version {}", label.version)?;
        }
        Commands::Checkpoint { name } => {
            let version = history.put_label(name).await?;
            writeln!(stdout, "recorded version {}", version)?;
        }
        Commands::Show { path, version } => {
            let path: PathBuf = path.parse()?;
            let revision = match version {
                Some(version) => history
                    .revision_at(version)
                    .await?
                    .ok_or_else(|| format!("no version {}", version))?,
                None => history.current(),
            };
            let entry = revision
                .find_entry(&path)
                .ok_or_else(|| format!("{} not found in version {}", path, revision.version))?;

            match history.content(&entry).await? {
                Some(data) => stdout.write_all(&data)?,
                None => {
                    for child in revision.list_directory(&path).unwrap_or_default() {
                        let Some(ref name) = child.name else { continue };
                        let suffix = if child.is_directory() { "/" } else { "" };
                        writeln!(stdout, "{}{}", name, suffix)?;
                    }
                }
            }
        }
        Commands::Revert { dir, version, path } => {
            let scope = match path {
                Some(path) => RevertScope::Path(path.parse()?),
                None => RevertScope::Everything,
            };
            let gateway = HostFsGateway::new(dir);
            let report = history.revert(version, scope, &gateway).await?;

            for warning in &report.warnings {
                warn!("{}", warning);
            }
            writeln!(
                stdout,
                "applied {} of {} steps towards version {}",
                report.applied, report.total, report.target_version
            )?;

            if report.state == RevertState::Failed {
                history.close().await?;
                tracing_handle.shutdown()?;
                return Err(report
                    .failure
                    .map_or_else(|| "revert failed".into(), Into::into));
            }
        }
    }

    history.close().await?;
    tracing_handle.shutdown()?;

    Ok(())
}
