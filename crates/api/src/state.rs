//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use tutorhub_booking::BookingEngine;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub engine: Arc<BookingEngine>,
}

impl AppState {
    pub fn new(pool: PgPool, engine: BookingEngine) -> Self {
        Self {
            pool,
            engine: Arc::new(engine),
        }
    }
}
