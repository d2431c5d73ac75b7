//! Answer-progress persistence
//!
//! In-progress clarification answers survive page reloads through a narrow
//! save/load interface keyed by session id. In-memory by default; Postgres
//! when DATABASE_URL is configured.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, ValuationError};
use crate::models::AnswerSet;

/// Trait for answer-progress persistence
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn save_progress(&self, session_id: Uuid, answers: &AnswerSet) -> Result<()>;
    async fn load_progress(&self, session_id: Uuid) -> Result<Option<AnswerSet>>;
    async fn clear_progress(&self, session_id: Uuid) -> Result<()>;
}

//
// ================= In-Memory =================
//

/// In-memory progress store for development and tests
pub struct InMemoryProgressStore {
    answers: Arc<RwLock<HashMap<Uuid, AnswerSet>>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self {
            answers: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn save_progress(&self, session_id: Uuid, answers: &AnswerSet) -> Result<()> {
        let mut locked = self.answers.write().await;
        locked.insert(session_id, answers.clone());
        Ok(())
    }

    async fn load_progress(&self, session_id: Uuid) -> Result<Option<AnswerSet>> {
        let locked = self.answers.read().await;
        Ok(locked.get(&session_id).cloned())
    }

    async fn clear_progress(&self, session_id: Uuid) -> Result<()> {
        let mut locked = self.answers.write().await;
        locked.remove(&session_id);
        Ok(())
    }
}

//
// ================= Postgres =================

/// Postgres-backed progress store with lazy connection and one-shot schema
/// initialization.
pub struct PostgresProgressStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS valuation_answers (
                      session_id UUID NOT NULL,
                      answer_key TEXT NOT NULL,
                      answer TEXT NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      PRIMARY KEY (session_id, answer_key)
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                ValuationError::DatabaseError(format!(
                    "Failed to initialize valuation answers schema: {}",
                    e
                ))
            })?;

        Ok(())
    }
}

#[async_trait]
impl ProgressStore for PostgresProgressStore {
    async fn save_progress(&self, session_id: Uuid, answers: &AnswerSet) -> Result<()> {
        self.ensure_schema().await?;

        let mut tx = self.pool.begin().await.map_err(|e| {
            ValuationError::DatabaseError(format!(
                "Failed to begin transaction for saving answers: {}",
                e
            ))
        })?;

        sqlx::query("DELETE FROM valuation_answers WHERE session_id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                ValuationError::DatabaseError(format!("Failed to clear old answers: {}", e))
            })?;

        for (key, answer) in answers.iter() {
            sqlx::query(
                r#"
                INSERT INTO valuation_answers (session_id, answer_key, answer)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(session_id)
            .bind(key)
            .bind(answer)
            .execute(&mut *tx)
            .await
            .map_err(|e| ValuationError::DatabaseError(format!("Failed to insert answer: {}", e)))?;
        }

        tx.commit().await.map_err(|e| {
            ValuationError::DatabaseError(format!("Failed to commit answer progress: {}", e))
        })?;

        Ok(())
    }

    async fn load_progress(&self, session_id: Uuid) -> Result<Option<AnswerSet>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            "SELECT answer_key, answer FROM valuation_answers WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ValuationError::DatabaseError(format!("Failed to load answers: {}", e)))?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut answers = AnswerSet::new();
        for row in rows {
            let key: String = row
                .try_get("answer_key")
                .map_err(|e| ValuationError::DatabaseError(e.to_string()))?;
            let answer: String = row
                .try_get("answer")
                .map_err(|e| ValuationError::DatabaseError(e.to_string()))?;
            answers.insert(key, answer);
        }

        Ok(Some(answers))
    }

    async fn clear_progress(&self, session_id: Uuid) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query("DELETE FROM valuation_answers WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| ValuationError::DatabaseError(format!("Failed to clear answers: {}", e)))?;

        Ok(())
    }
}

/// Build a progress store from the environment: Postgres when DATABASE_URL
/// is set and the pool can be created, otherwise in-memory.
pub fn progress_store_from_env() -> Arc<dyn ProgressStore> {
    let database_url = env::var("DATABASE_URL").ok();

    if let Some(url) = database_url {
        match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&url)
        {
            Ok(pool) => {
                info!("Progress store backend: postgres");
                return Arc::new(PostgresProgressStore::new(pool));
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres progress store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Progress store backend: in-memory");
    Arc::new(InMemoryProgressStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemoryProgressStore::new();
        let session_id = Uuid::new_v4();

        let mut answers = AnswerSet::new();
        answers.insert("owner_salary_q1".to_string(), "as reported".to_string());

        store.save_progress(session_id, &answers).await.unwrap();
        let loaded = store.load_progress(session_id).await.unwrap();
        assert_eq!(loaded, Some(answers));
    }

    #[tokio::test]
    async fn test_in_memory_missing_session() {
        let store = InMemoryProgressStore::new();
        let loaded = store.load_progress(Uuid::new_v4()).await.unwrap();
        assert_eq!(loaded, None);
    }

    #[tokio::test]
    async fn test_in_memory_clear() {
        let store = InMemoryProgressStore::new();
        let session_id = Uuid::new_v4();

        let mut answers = AnswerSet::new();
        answers.insert("rent_q1".to_string(), "market rate".to_string());

        store.save_progress(session_id, &answers).await.unwrap();
        store.clear_progress(session_id).await.unwrap();
        assert_eq!(store.load_progress(session_id).await.unwrap(), None);
    }
}
