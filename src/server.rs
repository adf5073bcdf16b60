use axum::{
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::api::{self, AppState};
use crate::error::FormShiftError;

pub struct WebServer {
    host: String,
    port: u16,
    state: AppState,
}

impl WebServer {
    pub fn new(host: String, port: u16, state: AppState) -> Self {
        Self { host, port, state }
    }

    pub async fn start(&self) -> Result<(), FormShiftError> {
        let app = create_router(self.state.clone());

        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| FormShiftError::Error(format!("Invalid address: {}", e)))?;

        let queue = self.state.queue.clone();
        let dispatcher = queue.start()?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FormShiftError::Error(format!("Failed to bind to {}: {}", addr, e)))?;

        println!("FormShift server listening on http://{}", addr);
        log::info!("Server ready to handle requests on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                log::info!("Shutdown signal received, stopping migration workers...");
                println!("\nShutdown signal received - waiting for running migrations...");

                queue.shutdown().await;
                if let Err(e) = dispatcher.await {
                    log::error!("Migration dispatcher ended abnormally: {}", e);
                }

                log::info!("Server shutdown complete");
                println!("   Server stopped");
            })
            .await
            .map_err(|e| FormShiftError::Error(format!("Server error: {}", e)))?;

        Ok(())
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))

        // Planning
        .route("/migrations/detect", post(api::migrations::detect_changes))
        .route("/migrations/preview", post(api::migrations::preview_migrations))

        // Queue
        .route("/migrations/execute", post(api::migrations::execute_migrations))
        .route("/migrations/queue/status", get(api::migrations::get_queue_status))
        .route("/migrations/jobs/{job_id}/cancel", post(api::migrations::cancel_job))
        .route("/migrations/dead-letters/{form_id}", get(api::migrations::get_dead_letters))

        // History and recovery
        .route("/migrations/history/{form_id}", get(api::history::get_history))
        .route("/migrations/rollback/{history_id}", post(api::migrations::rollback_migration))
        .route("/migrations/restore/{backup_id}", post(api::migrations::restore_backup))

        // Backups
        .route("/migrations/backups/{form_id}", get(api::backups::list_backups))
        .route("/migrations/cleanup", delete(api::backups::cleanup_backups))

        .with_state(state)
}

async fn health_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// Waits for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            log::info!("Received SIGTERM");
        },
    }
}
