use clap::{Parser, Subcommand};
use reconciler::document::{ConfigDocument, DocumentError, PGBOUNCER, Section};
use reconciler::publisher::{Layout, Reloader};
use reconciler::reconcile::Reconciler;
use reconciler::userlist::Userlist;
use reconciler::{Engine, Event};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

mod admin;
mod config;
mod reload;
mod status;
mod telemetry;

use config::Config;
use status::StatusLine;

#[derive(Parser)]
#[command(about = "Reconciles connection pooler configuration across a fleet")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short, default_value = "bouncerd.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Read JSON events from stdin and print one status line per event.
    ///
    /// Backend users and databases are only logged, not created. Provision
    /// the auth user and client users on the backend separately.
    Run,
    /// Validate the rendered files in the config directory.
    Check,
    /// Print the default configuration for the configured settings.
    Render,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("could not encode status: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{} is malformed: {source}", path.display())]
    Malformed { path: PathBuf, source: DocumentError },
    #[error("cannot render configuration: {0}")]
    Render(#[from] DocumentError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}: {err}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    let _telemetry = telemetry::init(&config);

    let result = match cli.command {
        CliCommand::Run => run(config),
        CliCommand::Check => check(&config),
        CliCommand::Render => render(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "bouncerd failed");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<(), CliError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(run_async(config))
}

async fn run_async(config: Config) -> Result<(), CliError> {
    let reloader: Arc<dyn Reloader> = match &config.engine.reload_command {
        Some(command) => Arc::new(reload::CommandReloader::new(command.clone())),
        None => Arc::new(reload::LogReloader),
    };
    let engine = Engine::from_config(&config.engine, Arc::new(admin::LoggingAdmin), reloader);
    warn!("backend statements are logged only, users and databases must be provisioned separately");
    info!(
        instances = engine.instances(),
        leader = config.engine.leader,
        "starting reconciliation engine"
    );
    let handle = engine.spawn();

    let mut stdout = tokio::io::stdout();
    let result = handle.dispatch(Event::Bootstrap).await;
    write_status(&mut stdout, &StatusLine::new(Event::Bootstrap.kind(), &result)).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let status = match serde_json::from_str::<Event>(&line) {
            Ok(event) => {
                let kind = event.kind();
                StatusLine::new(kind, &handle.dispatch(event).await)
            }
            Err(err) => StatusLine::invalid(&err),
        };
        write_status(&mut stdout, &status).await?;
    }

    handle.shutdown().await;
    Ok(())
}

async fn write_status(stdout: &mut tokio::io::Stdout, status: &StatusLine) -> Result<(), CliError> {
    let mut line = serde_json::to_string(status)?;
    line.push('\n');
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

fn check(config: &Config) -> Result<(), CliError> {
    let layout = Layout::new(&config.engine.config_dir);

    let path = layout.config_path();
    let doc = fs::read_to_string(&path)?
        .parse::<ConfigDocument>()
        .map_err(|source| CliError::Malformed {
            path: path.clone(),
            source,
        })?;
    let settings = match doc.section(PGBOUNCER) {
        Some(Section::Settings(settings)) => settings.len(),
        _ => 0,
    };
    println!(
        "{}: {} databases, {settings} settings",
        path.display(),
        doc.databases().count()
    );

    let path = layout.userlist_path();
    let userlist = Userlist::parse(&fs::read_to_string(&path)?);
    println!("{}: {} users", path.display(), userlist.len());

    Ok(())
}

fn render(config: &Config) -> Result<(), CliError> {
    let engine = &config.engine;
    let reconciler = Reconciler::new(&engine.app_name, &engine.config_dir, engine.settings.clone());
    print!("{}", reconciler.skeleton()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_help_mentions_backend_provisioning() {
        let mut cmd = Cli::command();
        let run = cmd.find_subcommand_mut("run").unwrap();
        let help = run.render_long_help().to_string();
        assert!(help.contains("only logged, not created"), "{help}");
    }
}
