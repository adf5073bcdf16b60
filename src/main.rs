mod api;
mod backups;
mod changes;
mod cli;
mod column_type;
mod config;
mod conversion;
mod db;
mod detector;
mod engine;
mod error;
mod history;
mod identifiers;
mod inspector;
mod queue;
mod rollback;
mod server;

use cli::Cli;
use config::Config;
use directories::ProjectDirs;
use flexi_logger::{
    Cleanup, Criterion, Duplicate, FileSpec, FlexiLoggerError, Logger, LoggerHandle, Naming,
};
use log::{error, info};

fn main() {
    let Some(project_dirs) = ProjectDirs::from("", "", "formshift") else {
        eprintln!("Could not determine the application data directory");
        std::process::exit(1);
    };

    let config = Config::init(&project_dirs);

    // Keep the handle alive so buffered log lines are flushed on exit
    let _logger = match setup_logging(&project_dirs, config) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        }
    };

    info!("FormShift {} starting", env!("CARGO_PKG_VERSION"));

    if let Err(err) = Cli::handle_command_line(&project_dirs, config) {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

fn setup_logging(project_dirs: &ProjectDirs, config: &Config) -> Result<LoggerHandle, FlexiLoggerError> {
    let log_dir = project_dirs.data_local_dir().join("logs");

    Logger::try_with_str(format!("formshift={}", config.logging.formshift))?
        .log_to_file(FileSpec::default().directory(log_dir).basename("formshift"))
        .duplicate_to_stderr(Duplicate::Warn)
        .rotate(
            Criterion::Size(10 * 1024 * 1024),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(7),
        )
        .format_for_files(flexi_logger::detailed_format)
        .start()
}
