//! Postgres-backed ledger store
//!
//! All queries are scoped by an explicit `user_id` bound parameter.
//! Schema is created lazily on first use so the server can start before
//! the database is reachable.

use super::LedgerStore;
use crate::error::AssistantError;
use crate::models::{
    Budget, BudgetPatch, BudgetWithStatus, Category, NewTransaction, Transaction,
    TransactionFilter, TransactionPatch, TransactionType, TransactionWithCategory,
};
use crate::Result;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

pub struct PgLedgerStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

fn kind_to_db(kind: TransactionType) -> &'static str {
    match kind {
        TransactionType::Income => "income",
        TransactionType::Expense => "expense",
    }
}

fn kind_from_db(kind: &str) -> TransactionType {
    match kind {
        "income" => TransactionType::Income,
        _ => TransactionType::Expense,
    }
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let kind: String = row.try_get("kind")?;
    Ok(Transaction {
        transaction_id: row.try_get("transaction_id")?,
        user_id: row.try_get("user_id")?,
        category_id: row.try_get("category_id")?,
        amount: row.try_get("amount")?,
        kind: kind_from_db(&kind),
        description: row.try_get("description")?,
        occurred_at: row.try_get("occurred_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn budget_from_row(row: &PgRow) -> Result<Budget> {
    Ok(Budget {
        budget_id: row.try_get("budget_id")?,
        user_id: row.try_get("user_id")?,
        category_id: row.try_get("category_id")?,
        name: row.try_get("name")?,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn category_from_row(row: &PgRow) -> Result<Category> {
    Ok(Category {
        category_id: row.try_get("category_id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

impl PgLedgerStore {
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
                    CREATE TABLE IF NOT EXISTS categories (
                      category_id UUID PRIMARY KEY,
                      user_id UUID NOT NULL,
                      name TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS transactions (
                      transaction_id UUID PRIMARY KEY,
                      user_id UUID NOT NULL,
                      category_id UUID REFERENCES categories(category_id),
                      amount DOUBLE PRECISION NOT NULL CHECK (amount >= 0),
                      kind TEXT NOT NULL,
                      description TEXT NOT NULL,
                      occurred_at TIMESTAMPTZ NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS budgets (
                      budget_id UUID PRIMARY KEY,
                      user_id UUID NOT NULL,
                      category_id UUID NOT NULL REFERENCES categories(category_id),
                      name TEXT NOT NULL,
                      amount DOUBLE PRECISION NOT NULL CHECK (amount >= 0),
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_transactions_user_time
                    ON transactions (user_id, occurred_at DESC);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                AssistantError::Database(format!("Failed to initialize ledger schema: {}", e))
            })?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_transaction(&self, user_id: Uuid, new: NewTransaction) -> Result<Transaction> {
        self.ensure_schema().await?;

        let occurred_at = new.occurred_at.unwrap_or_else(Utc::now);
        let row = sqlx::query(
            r#"
            INSERT INTO transactions
              (transaction_id, user_id, category_id, amount, kind, description, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(new.category_id)
        .bind(new.amount)
        .bind(kind_to_db(new.kind))
        .bind(&new.description)
        .bind(occurred_at)
        .fetch_one(&self.pool)
        .await?;

        transaction_from_row(&row)
    }

    async fn update_transaction(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
        patch: TransactionPatch,
    ) -> Result<Transaction> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            UPDATE transactions SET
              category_id = COALESCE($3, category_id),
              amount = COALESCE($4, amount),
              kind = COALESCE($5, kind),
              description = COALESCE($6, description),
              occurred_at = COALESCE($7, occurred_at),
              updated_at = NOW()
            WHERE transaction_id = $1 AND user_id = $2
            RETURNING *
            "#,
        )
        .bind(transaction_id)
        .bind(user_id)
        .bind(patch.category_id)
        .bind(patch.amount)
        .bind(patch.kind.map(kind_to_db))
        .bind(patch.description)
        .bind(patch.occurred_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            AssistantError::not_found(format!("Transaction {} not found", transaction_id))
        })?;

        transaction_from_row(&row)
    }

    async fn delete_transaction(&self, user_id: Uuid, transaction_id: Uuid) -> Result<()> {
        self.ensure_schema().await?;

        let result = sqlx::query(
            "DELETE FROM transactions WHERE transaction_id = $1 AND user_id = $2",
        )
        .bind(transaction_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AssistantError::not_found(format!(
                "Transaction {} not found",
                transaction_id
            )));
        }
        Ok(())
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        filter: &TransactionFilter,
    ) -> Result<Vec<TransactionWithCategory>> {
        self.ensure_schema().await?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT t.*, c.name AS category_name \
             FROM transactions t LEFT JOIN categories c ON c.category_id = t.category_id \
             WHERE t.user_id = ",
        );
        builder.push_bind(user_id);

        if let Some(kind) = filter.kind {
            builder.push(" AND t.kind = ").push_bind(kind_to_db(kind));
        }
        if let Some(start) = filter.start_date {
            builder.push(" AND t.occurred_at >= ").push_bind(start);
        }
        if let Some(end) = filter.end_date {
            builder.push(" AND t.occurred_at <= ").push_bind(end);
        }
        if let Some(ref category) = filter.category {
            builder
                .push(" AND c.name ILIKE ")
                .push_bind(format!("%{}%", category));
        }
        builder
            .push(" ORDER BY t.occurred_at DESC LIMIT ")
            .push_bind(filter.effective_limit() as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                Ok(TransactionWithCategory {
                    transaction: transaction_from_row(row)?,
                    category_name: row.try_get("category_name")?,
                })
            })
            .collect()
    }

    async fn month_to_date_spending(&self, user_id: Uuid) -> Result<f64> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0) AS total
            FROM transactions
            WHERE user_id = $1
              AND kind = 'expense'
              AND occurred_at >= date_trunc('month', NOW())
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("total")?)
    }

    async fn create_budget(
        &self,
        user_id: Uuid,
        category_id: Uuid,
        name: &str,
        amount: f64,
    ) -> Result<Budget> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO budgets (budget_id, user_id, category_id, name, amount)
            SELECT $1, $2, $3, $4, $5
            WHERE EXISTS (
              SELECT 1 FROM categories WHERE category_id = $3 AND user_id = $2
            )
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(category_id)
        .bind(name)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AssistantError::not_found(format!("Category {} not found", category_id)))?;

        budget_from_row(&row)
    }

    async fn update_budget(
        &self,
        user_id: Uuid,
        budget_id: Uuid,
        patch: BudgetPatch,
    ) -> Result<Budget> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            UPDATE budgets SET
              name = COALESCE($3, name),
              amount = COALESCE($4, amount),
              updated_at = NOW()
            WHERE budget_id = $1 AND user_id = $2
            RETURNING *
            "#,
        )
        .bind(budget_id)
        .bind(user_id)
        .bind(patch.name)
        .bind(patch.amount)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AssistantError::not_found(format!("Budget {} not found", budget_id)))?;

        budget_from_row(&row)
    }

    async fn delete_budget(&self, user_id: Uuid, budget_id: Uuid) -> Result<()> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM budgets WHERE budget_id = $1 AND user_id = $2")
            .bind(budget_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AssistantError::not_found(format!(
                "Budget {} not found",
                budget_id
            )));
        }
        Ok(())
    }

    async fn list_budgets(&self, user_id: Uuid) -> Result<Vec<BudgetWithStatus>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT b.*, c.name AS category_name,
              COALESCE((
                SELECT SUM(t.amount) FROM transactions t
                WHERE t.user_id = b.user_id
                  AND t.category_id = b.category_id
                  AND t.kind = 'expense'
                  AND t.occurred_at >= date_trunc('month', NOW())
              ), 0) AS spent
            FROM budgets b
            JOIN categories c ON c.category_id = b.category_id
            WHERE b.user_id = $1
            ORDER BY b.created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let budget = budget_from_row(row)?;
                let category_name: String = row.try_get("category_name")?;
                let spent: f64 = row.try_get("spent")?;
                Ok(BudgetWithStatus::from_spend(budget, category_name, spent))
            })
            .collect()
    }

    async fn create_category(&self, user_id: Uuid, name: &str) -> Result<Category> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO categories (category_id, user_id, name)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        category_from_row(&row)
    }

    async fn list_categories(&self, user_id: Uuid) -> Result<Vec<Category>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            "SELECT * FROM categories WHERE user_id = $1 ORDER BY name ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(category_from_row).collect()
    }

    async fn find_category_by_name(&self, user_id: Uuid, name: &str) -> Result<Option<Category>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            "SELECT * FROM categories WHERE user_id = $1 AND LOWER(name) = LOWER($2)",
        )
        .bind(user_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(category_from_row).transpose()
    }

    async fn create_budget_for_category(
        &self,
        user_id: Uuid,
        category_name: &str,
        budget_name: &str,
        amount: f64,
    ) -> Result<(Category, Budget, bool)> {
        self.ensure_schema().await?;

        // Short-lived transactional scope: category lookup/create and budget
        // insert commit together, independent of the surrounding turn.
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT * FROM categories WHERE user_id = $1 AND LOWER(name) = LOWER($2) FOR UPDATE",
        )
        .bind(user_id)
        .bind(category_name)
        .fetch_optional(&mut *tx)
        .await?;

        let (category, created) = match existing {
            Some(ref row) => (category_from_row(row)?, false),
            None => {
                let row = sqlx::query(
                    "INSERT INTO categories (category_id, user_id, name) VALUES ($1, $2, $3) RETURNING *",
                )
                .bind(Uuid::new_v4())
                .bind(user_id)
                .bind(category_name)
                .fetch_one(&mut *tx)
                .await?;
                (category_from_row(&row)?, true)
            }
        };

        let row = sqlx::query(
            "INSERT INTO budgets (budget_id, user_id, category_id, name, amount) VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(category.category_id)
        .bind(budget_name)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;
        let budget = budget_from_row(&row)?;

        tx.commit().await?;

        Ok((category, budget, created))
    }
}
