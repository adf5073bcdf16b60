pub mod backups;
pub mod common;
pub mod history;
pub mod migrations;
pub mod state;
