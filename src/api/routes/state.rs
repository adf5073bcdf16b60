use std::sync::Arc;

use crate::db::Database;
use crate::engine::{EngineSettings, MigrationEngine};
use crate::identifiers::TableMapper;
use crate::queue::{MigrationQueue, QueueSettings};
use crate::rollback::RollbackCoordinator;

/// Shared application state passed to all Axum handlers via `.with_state()`.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub engine: Arc<MigrationEngine>,
    pub queue: MigrationQueue,
    pub coordinator: Arc<RollbackCoordinator>,
}

impl AppState {
    pub fn new(
        db: Database,
        tables: Arc<dyn TableMapper>,
        engine_settings: EngineSettings,
        queue_settings: QueueSettings,
    ) -> Self {
        let engine = Arc::new(MigrationEngine::new(engine_settings));
        let queue = MigrationQueue::new(db.clone(), Arc::clone(&engine), tables, queue_settings);
        let coordinator = Arc::new(RollbackCoordinator::new(
            db.clone(),
            Arc::clone(&engine),
            queue.clone(),
        ));

        Self {
            db,
            engine,
            queue,
            coordinator,
        }
    }
}
