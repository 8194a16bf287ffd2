use crate::config::AppConfig;
use crate::db::connection::DbPool;
use std::sync::Arc;
use std::time::Instant;
use transfer_core::TransferService;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub transfer: Arc<TransferService>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig, transfer: TransferService) -> Self {
        Self {
            db,
            config,
            transfer: Arc::new(transfer),
            started_at: Instant::now(),
        }
    }
}
