use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};
use uuid::Uuid;

use crate::{
    cache::CacheError,
    clock::Clock,
    config::AppConfig,
    db::PgPool,
    error::{AppError, AppResult},
    extract::DocumentExtractor,
    limiter::SessionLimiter,
    llm::GenerationClient,
};

type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub generator: Arc<dyn GenerationClient>,
    pub extractor: Arc<dyn DocumentExtractor>,
    pub clock: Arc<dyn Clock>,
    limiters: Arc<Mutex<HashMap<Uuid, Arc<SessionLimiter>>>>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        generator: Arc<dyn GenerationClient>,
        extractor: Arc<dyn DocumentExtractor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            generator,
            extractor,
            clock,
            limiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }

    pub fn blocking_db(&self) -> Result<PgPooledConnection, CacheError> {
        self.pool
            .get()
            .map_err(|err| CacheError::Pool(err.to_string()))
    }

    /// The in-process limiter for a session; created on first use. Limiters
    /// are per-session structures, never shared across sessions.
    pub fn limiter_for(&self, session_id: Uuid) -> Arc<SessionLimiter> {
        let mut limiters = self.limiters.lock().expect("limiter registry lock");
        limiters
            .entry(session_id)
            .or_insert_with(|| {
                Arc::new(SessionLimiter::new(
                    self.config.session_concurrency_limit,
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub fn drop_limiter(&self, session_id: Uuid) {
        let mut limiters = self.limiters.lock().expect("limiter registry lock");
        limiters.remove(&session_id);
    }
}
