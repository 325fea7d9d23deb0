use std::collections::{HashSet, VecDeque};
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use diesel::connection::SimpleConnection;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::Mutex;
use tower::util::ServiceExt;

use studydesk::clock::SystemClock;
use studydesk::config::AppConfig;
use studydesk::db::{self, PgPool};
use studydesk::extract::{DocumentExtractor, ExtractError};
use studydesk::llm::{GenerateError, GenerationClient};
use studydesk::routes;
use studydesk::selection::Rect;
use studydesk::state::AppState;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Scripted responses for the fake model client; an empty script answers
/// with deterministic text derived from the prompt.
#[derive(Debug, Clone)]
pub enum FakeOutcome {
    Text(String),
    ApiError(u16),
    NetworkError,
}

#[derive(Default)]
pub struct FakeGenerationClient {
    script: StdMutex<VecDeque<FakeOutcome>>,
    calls: AtomicUsize,
}

impl FakeGenerationClient {
    #[allow(dead_code)]
    pub fn push(&self, outcome: FakeOutcome) {
        self.script.lock().expect("script lock").push_back(outcome);
    }

    #[allow(dead_code)]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationClient for FakeGenerationClient {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().expect("script lock").pop_front();
        match scripted {
            None => Ok(format!("explanation[{}]", prompt.len())),
            Some(FakeOutcome::Text(text)) => Ok(text),
            Some(FakeOutcome::ApiError(status)) => Err(GenerateError::Api {
                status,
                message: "scripted failure".to_string(),
            }),
            Some(FakeOutcome::NetworkError) => {
                Err(GenerateError::Network("scripted network failure".to_string()))
            }
        }
    }
}

#[derive(Default)]
pub struct FakeExtractor {
    missing_units: StdMutex<HashSet<i32>>,
}

impl FakeExtractor {
    #[allow(dead_code)]
    pub fn mark_missing(&self, unit: i32) {
        self.missing_units.lock().expect("missing lock").insert(unit);
    }
}

#[async_trait]
impl DocumentExtractor for FakeExtractor {
    async fn extract_text(
        &self,
        content_hash: &str,
        unit_index: i32,
    ) -> Result<String, ExtractError> {
        if self
            .missing_units
            .lock()
            .expect("missing lock")
            .contains(&unit_index)
        {
            return Err(ExtractError::UnitNotFound(unit_index));
        }
        Ok(format!("text for unit {unit_index} of {content_hash}"))
    }

    async fn extract_regions(
        &self,
        _content_hash: &str,
        _unit_index: i32,
    ) -> Result<Vec<Rect>, ExtractError> {
        Ok(vec![Rect {
            x: 0.1,
            y: 0.1,
            width: 0.5,
            height: 0.25,
        }])
    }
}

pub struct TestApp {
    pub state: AppState,
    pub generator: Arc<FakeGenerationClient>,
    pub extractor: Arc<FakeExtractor>,
    router: Router,
}

impl TestApp {
    /// Returns `None` (with a notice) when no test database is configured,
    /// so the suite passes on machines without Postgres.
    pub async fn new() -> Result<Option<Self>> {
        let Ok(database_url) = env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set; skipping database-backed test");
            return Ok(None);
        };

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            cors_allowed_origin: None,
            model_api_url: "http://fake-model".to_string(),
            model_api_key: "test-key".to_string(),
            model_name: "fake-model".to_string(),
            extractor_api_url: "http://fake-extractor".to_string(),
            prompt_version: "v3".to_string(),
            generation_max_attempts: 3,
            generation_lock_timeout_seconds: 600,
            worker_batch_size: 5,
            worker_runtime_budget_seconds: 5,
            worker_poll_interval_seconds: 1,
            session_concurrency_limit: 3,
            session_poll_interval_ms: 25,
            cache_poll_interval_ms: 25,
            cache_wait_timeout_seconds: 5,
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let generator = Arc::new(FakeGenerationClient::default());
        let extractor = Arc::new(FakeExtractor::default());
        let state = AppState::new(
            pool,
            config,
            generator.clone(),
            extractor.clone(),
            Arc::new(SystemClock),
        );
        let router = routes::create_router(state.clone());

        Ok(Some(Self {
            state,
            generator,
            extractor,
            router,
        }))
    }

    #[allow(dead_code)]
    pub async fn cleanup(&self) -> Result<()> {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get cleanup connection: {err}"))?;
            truncate_all(&mut conn)?;
            Ok(())
        })
        .await
        .context("cleanup task panicked")?
    }

    #[allow(dead_code)]
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let request = Request::builder()
            .method(Method::PATCH)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn get(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn put(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::PUT)
            .uri(path)
            .body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::DELETE)
            .uri(path)
            .body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

#[allow(dead_code)]
pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE sticker_versions, stickers, quota_charges, generation_sessions, generation_jobs, content_references, content_documents RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
