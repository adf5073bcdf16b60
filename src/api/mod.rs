pub mod routes;

// Re-export route handlers for convenience
pub use routes::backups;
pub use routes::history;
pub use routes::migrations;
pub use routes::state::AppState;
