use std::sync::Arc;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::info;

use crate::api::AppState;
use crate::config::Config;
use crate::db::Database;
use crate::error::FormShiftError;
use crate::identifiers::PrefixTableMapper;

#[derive(Parser)]
#[command(
    name = "formshift",
    version,
    about = "FormShift: keeps form tables in step with their field definitions"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the server (default if no command specified)
    Serve,

    /// Delete backups past retention and exit
    Sweep {
        /// Also delete backups older than this many days
        #[arg(long = "days", short = 'd')]
        days: Option<i64>,
    },
}

impl Cli {
    pub fn handle_command_line(project_dirs: &ProjectDirs, config: &Config) -> Result<(), FormShiftError> {
        let args = Cli::parse();

        // Default to Serve if no command specified
        match args.command.unwrap_or(Command::Serve) {
            Command::Serve => Self::start_server(project_dirs, config),
            Command::Sweep { days } => Self::sweep(project_dirs, config, days),
        }
    }

    fn open_database(project_dirs: &ProjectDirs, config: &Config) -> Result<Database, FormShiftError> {
        let db_path = config.database.db_path(project_dirs.data_local_dir());
        Database::open(&db_path, &config.database.settings())
    }

    fn app_state(db: Database, config: &Config) -> AppState {
        AppState::new(
            db,
            Arc::new(PrefixTableMapper::new(config.tables.prefix.clone())),
            config.migrations.engine_settings(),
            config.migrations.queue_settings(),
        )
    }

    fn start_server(project_dirs: &ProjectDirs, config: &Config) -> Result<(), FormShiftError> {
        let host = config.server.host.clone();
        let port = config.server.port;

        info!("Starting server on {}:{}", host, port);

        let db = Self::open_database(project_dirs, config)?;
        let state = Self::app_state(db, config);

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| FormShiftError::Error(format!("Failed to create runtime: {}", e)))?;

        rt.block_on(async {
            let web_server = crate::server::WebServer::new(host, port, state);
            web_server.start().await
        })
    }

    fn sweep(project_dirs: &ProjectDirs, config: &Config, days: Option<i64>) -> Result<(), FormShiftError> {
        let db = Self::open_database(project_dirs, config)?;
        let state = Self::app_state(db, config);

        let conn = state.db.get_connection()?;
        let now = chrono::Utc::now().timestamp();
        let deleted = state.engine.backups().sweep_expired(&conn, now, days)?;

        println!("Deleted {} backup(s)", deleted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_parsing_no_command_defaults_to_serve() {
        let cli = Cli::try_parse_from(["formshift"]).unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(cli.command.unwrap_or(Command::Serve), Command::Serve));
    }

    #[test]
    fn test_cli_parsing_sweep() {
        let cli = Cli::try_parse_from(["formshift", "sweep"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Sweep { days: None })));

        let cli = Cli::try_parse_from(["formshift", "sweep", "--days", "30"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Sweep { days: Some(30) })));
    }

    #[test]
    fn test_cli_parsing_invalid_arguments() {
        assert!(Cli::try_parse_from(["formshift", "nonexistent-command"]).is_err());
        assert!(Cli::try_parse_from(["formshift", "serve", "--invalid-flag"]).is_err());
        assert!(Cli::try_parse_from(["formshift", "sweep", "--days", "soon"]).is_err());
    }
}
