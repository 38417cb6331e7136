//! Chat history persistence
//!
//! Append-only store of completed conversation turns, one row per
//! user-message/assistant-response pair. A turn is persisted only after the
//! whole exchange (including tool rounds) has resolved.

use crate::error::AssistantError;
use crate::models::{ConversationTurn, Page};
use crate::Result;
use chrono::Utc;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: usize = 20;

#[async_trait::async_trait]
pub trait ChatHistoryStore: Send + Sync {
    async fn append(
        &self,
        user_id: Uuid,
        user_message: &str,
        assistant_response: &str,
    ) -> Result<ConversationTurn>;

    /// Paginated listing, newest first. Pages are 1-based.
    async fn list(&self, user_id: Uuid, page: usize, page_size: usize)
        -> Result<Page<ConversationTurn>>;

    async fn clear(&self, user_id: Uuid) -> Result<()>;
}

fn paginate(mut turns: Vec<ConversationTurn>, page: usize, page_size: usize) -> Page<ConversationTurn> {
    let page = page.max(1);
    let page_size = page_size.max(1);

    turns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let total = turns.len();
    let total_pages = total.div_ceil(page_size);
    let items = turns
        .into_iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .collect();

    Page {
        items,
        total,
        page,
        total_pages,
    }
}

/// In-memory history store for tests and the offline demo
pub struct InMemoryChatHistoryStore {
    turns: Arc<RwLock<HashMap<Uuid, Vec<ConversationTurn>>>>,
}

impl InMemoryChatHistoryStore {
    pub fn new() -> Self {
        Self {
            turns: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryChatHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ChatHistoryStore for InMemoryChatHistoryStore {
    async fn append(
        &self,
        user_id: Uuid,
        user_message: &str,
        assistant_response: &str,
    ) -> Result<ConversationTurn> {
        let turn = ConversationTurn {
            turn_id: Uuid::new_v4(),
            user_id,
            user_message: user_message.to_string(),
            assistant_response: assistant_response.to_string(),
            created_at: Utc::now(),
        };

        let mut turns = self.turns.write().await;
        turns.entry(user_id).or_default().push(turn.clone());
        Ok(turn)
    }

    async fn list(
        &self,
        user_id: Uuid,
        page: usize,
        page_size: usize,
    ) -> Result<Page<ConversationTurn>> {
        let turns = self.turns.read().await;
        let owned = turns.get(&user_id).cloned().unwrap_or_default();
        Ok(paginate(owned, page, page_size))
    }

    async fn clear(&self, user_id: Uuid) -> Result<()> {
        let mut turns = self.turns.write().await;
        turns.remove(&user_id);
        Ok(())
    }
}

/// Postgres-backed history store
pub struct PgChatHistoryStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgChatHistoryStore {
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
                    CREATE TABLE IF NOT EXISTS conversation_turns (
                      turn_id UUID PRIMARY KEY,
                      user_id UUID NOT NULL,
                      user_message TEXT NOT NULL,
                      assistant_response TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_conversation_turns_user_time
                    ON conversation_turns (user_id, created_at DESC);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                AssistantError::Database(format!("Failed to initialize history schema: {}", e))
            })?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl ChatHistoryStore for PgChatHistoryStore {
    async fn append(
        &self,
        user_id: Uuid,
        user_message: &str,
        assistant_response: &str,
    ) -> Result<ConversationTurn> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO conversation_turns (turn_id, user_id, user_message, assistant_response)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(user_message)
        .bind(assistant_response)
        .fetch_one(&self.pool)
        .await?;

        Ok(ConversationTurn {
            turn_id: row.try_get("turn_id")?,
            user_id: row.try_get("user_id")?,
            user_message: row.try_get("user_message")?,
            assistant_response: row.try_get("assistant_response")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn list(
        &self,
        user_id: Uuid,
        page: usize,
        page_size: usize,
    ) -> Result<Page<ConversationTurn>> {
        self.ensure_schema().await?;

        let page = page.max(1);
        let page_size = page_size.max(1);

        let total_row = sqlx::query(
            "SELECT COUNT(*) AS total FROM conversation_turns WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = total_row.try_get("total")?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM conversation_turns
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .iter()
            .map(|row| {
                Ok(ConversationTurn {
                    turn_id: row.try_get("turn_id")?,
                    user_id: row.try_get("user_id")?,
                    user_message: row.try_get("user_message")?,
                    assistant_response: row.try_get("assistant_response")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let total = total as usize;
        Ok(Page {
            items,
            total,
            page,
            total_pages: total.div_ceil(page_size),
        })
    }

    async fn clear(&self, user_id: Uuid) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query("DELETE FROM conversation_turns WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_list_returns_newest_first() {
        let store = InMemoryChatHistoryStore::new();
        let user_id = Uuid::new_v4();

        store.append(user_id, "first", "answer one").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.append(user_id, "second", "answer two").await.unwrap();

        let page = store.list(user_id, 1, DEFAULT_PAGE_SIZE).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].user_message, "second");
        assert_eq!(page.items[1].user_message, "first");
    }

    #[tokio::test]
    async fn pagination_math() {
        let store = InMemoryChatHistoryStore::new();
        let user_id = Uuid::new_v4();

        for i in 0..5 {
            store
                .append(user_id, &format!("q{}", i), "a")
                .await
                .unwrap();
        }

        let page = store.list(user_id, 2, 2).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items.len(), 2);
    }

    #[tokio::test]
    async fn history_is_per_user() {
        let store = InMemoryChatHistoryStore::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        store.append(alice, "hi", "hello").await.unwrap();

        let bobs = store.list(bob, 1, DEFAULT_PAGE_SIZE).await.unwrap();
        assert_eq!(bobs.total, 0);

        store.clear(bob).await.unwrap();
        let alices = store.list(alice, 1, DEFAULT_PAGE_SIZE).await.unwrap();
        assert_eq!(alices.total, 1);
    }
}
