use anyhow::{Context, Result};
use cmdrelay::commands::{self, Cli};
use cmdrelay::policy::{AllowAll, AllowList, CommandPolicy};
use cmdrelay::utils::config_paths::ConfigPaths;
use cmdrelay::utils::logger::init_logger;
use cmdrelay::{InMemoryStore, RelayError, Settings, SqliteStore, Supervisor};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_command();
    match main_impl(cli).await {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<RelayError>() {
                Some(relay) => eprintln!(
                    "{} error: {}",
                    relay.category().display_name(),
                    relay.user_message()
                ),
                None => eprintln!("{err:#}"),
            }
            ExitCode::from(1)
        }
    }
}

async fn main_impl(cli: Cli) -> Result<ExitCode> {
    let paths = ConfigPaths::new().ok();
    let settings = match (&cli.config, &paths) {
        (Some(file), _) => Settings::load(Some(file))?,
        (None, Some(paths)) => Settings::load_default(&paths.config_file)?,
        (None, None) => Settings::load(None)?,
    };

    let log_level = cli.log_level.as_deref().or(settings.log_level.as_deref());
    init_logger(log_level, cli.log_file.clone())?;

    let policy: Box<dyn CommandPolicy> = if cli.allow_any {
        Box::new(AllowAll)
    } else {
        Box::new(AllowList::from_settings(&settings))
    };

    match database_path(&cli, &settings, paths.as_ref()) {
        Some(path) => {
            debug!(path = %path.display(), "using sqlite ledger");
            let store = SqliteStore::open(&path)
                .with_context(|| format!("failed to open ledger at {}", path.display()))?;
            let supervisor = Supervisor::new(store, policy, settings);
            commands::execute(&supervisor, cli.command).await
        }
        None => {
            debug!("using in-memory ledger");
            let supervisor = Supervisor::new(InMemoryStore::new(), policy, settings);
            commands::execute(&supervisor, cli.command).await
        }
    }
}

fn database_path(cli: &Cli, settings: &Settings, paths: Option<&ConfigPaths>) -> Option<PathBuf> {
    if cli.ephemeral {
        return None;
    }
    cli.database
        .clone()
        .or_else(|| settings.database_path.clone())
        .or_else(|| paths.map(|paths| paths.database_file.clone()))
}
