//! Ledger persistence layer
//!
//! Authoritative store of transactions, budgets, and categories.
//! Every call is scoped by an explicit `user_id`; cross-user access is a
//! security defect, not merely a logic bug.

mod postgres;

pub use postgres::PgLedgerStore;

use crate::models::{
    Budget, BudgetPatch, BudgetWithStatus, Category, NewTransaction, Transaction,
    TransactionFilter, TransactionPatch, TransactionType, TransactionWithCategory,
};
use crate::Result;
use chrono::{Datelike, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Trait for ledger persistence
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    // Transactions
    async fn create_transaction(&self, user_id: Uuid, new: NewTransaction) -> Result<Transaction>;
    async fn update_transaction(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
        patch: TransactionPatch,
    ) -> Result<Transaction>;
    async fn delete_transaction(&self, user_id: Uuid, transaction_id: Uuid) -> Result<()>;
    async fn list_transactions(
        &self,
        user_id: Uuid,
        filter: &TransactionFilter,
    ) -> Result<Vec<TransactionWithCategory>>;
    async fn month_to_date_spending(&self, user_id: Uuid) -> Result<f64>;

    // Budgets
    async fn create_budget(
        &self,
        user_id: Uuid,
        category_id: Uuid,
        name: &str,
        amount: f64,
    ) -> Result<Budget>;
    async fn update_budget(
        &self,
        user_id: Uuid,
        budget_id: Uuid,
        patch: BudgetPatch,
    ) -> Result<Budget>;
    async fn delete_budget(&self, user_id: Uuid, budget_id: Uuid) -> Result<()>;
    async fn list_budgets(&self, user_id: Uuid) -> Result<Vec<BudgetWithStatus>>;

    // Categories
    async fn create_category(&self, user_id: Uuid, name: &str) -> Result<Category>;
    async fn list_categories(&self, user_id: Uuid) -> Result<Vec<Category>>;
    /// Exact, case-insensitive lookup by name.
    async fn find_category_by_name(&self, user_id: Uuid, name: &str) -> Result<Option<Category>>;

    /// Find-or-create the category, then create the budget referencing it,
    /// inside one short-lived transactional scope. Returns whether the
    /// category was newly created.
    async fn create_budget_for_category(
        &self,
        user_id: Uuid,
        category_name: &str,
        budget_name: &str,
        amount: f64,
    ) -> Result<(Category, Budget, bool)>;
}

/// Start of the current calendar month, UTC.
pub(crate) fn month_start() -> chrono::DateTime<Utc> {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// In-memory ledger store for tests and the offline demo
pub struct InMemoryLedgerStore {
    transactions: Arc<RwLock<HashMap<Uuid, Transaction>>>,
    budgets: Arc<RwLock<HashMap<Uuid, Budget>>>,
    categories: Arc<RwLock<HashMap<Uuid, Category>>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            transactions: Arc::new(RwLock::new(HashMap::new())),
            budgets: Arc::new(RwLock::new(HashMap::new())),
            categories: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn category_name(&self, category_id: Option<Uuid>) -> Option<String> {
        let id = category_id?;
        let categories = self.categories.read().await;
        categories.get(&id).map(|c| c.name.clone())
    }

    async fn spent_for_category(&self, user_id: Uuid, category_id: Uuid) -> f64 {
        let since = month_start();
        let transactions = self.transactions.read().await;
        transactions
            .values()
            .filter(|t| {
                t.user_id == user_id
                    && t.category_id == Some(category_id)
                    && t.kind == TransactionType::Expense
                    && t.occurred_at >= since
            })
            .map(|t| t.amount)
            .sum()
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_transaction(&self, user_id: Uuid, new: NewTransaction) -> Result<Transaction> {
        let now = Utc::now();
        let transaction = Transaction {
            transaction_id: Uuid::new_v4(),
            user_id,
            category_id: new.category_id,
            amount: new.amount,
            kind: new.kind,
            description: new.description,
            occurred_at: new.occurred_at.unwrap_or(now),
            created_at: now,
            updated_at: now,
        };

        let mut transactions = self.transactions.write().await;
        transactions.insert(transaction.transaction_id, transaction.clone());
        Ok(transaction)
    }

    async fn update_transaction(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
        patch: TransactionPatch,
    ) -> Result<Transaction> {
        let mut transactions = self.transactions.write().await;
        let transaction = transactions
            .get_mut(&transaction_id)
            .filter(|t| t.user_id == user_id)
            .ok_or_else(|| {
                crate::error::AssistantError::not_found(format!(
                    "Transaction {} not found",
                    transaction_id
                ))
            })?;

        if let Some(category_id) = patch.category_id {
            transaction.category_id = Some(category_id);
        }
        if let Some(amount) = patch.amount {
            transaction.amount = amount;
        }
        if let Some(kind) = patch.kind {
            transaction.kind = kind;
        }
        if let Some(description) = patch.description {
            transaction.description = description;
        }
        if let Some(occurred_at) = patch.occurred_at {
            transaction.occurred_at = occurred_at;
        }
        transaction.updated_at = Utc::now();

        Ok(transaction.clone())
    }

    async fn delete_transaction(&self, user_id: Uuid, transaction_id: Uuid) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        let owned = transactions
            .get(&transaction_id)
            .map_or(false, |t| t.user_id == user_id);
        if !owned {
            return Err(crate::error::AssistantError::not_found(format!(
                "Transaction {} not found",
                transaction_id
            )));
        }
        transactions.remove(&transaction_id);
        Ok(())
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        filter: &TransactionFilter,
    ) -> Result<Vec<TransactionWithCategory>> {
        let category_filter = filter.category.as_deref().map(str::to_lowercase);

        let mut rows: Vec<Transaction> = {
            let transactions = self.transactions.read().await;
            transactions
                .values()
                .filter(|t| t.user_id == user_id)
                .filter(|t| filter.kind.map_or(true, |k| t.kind == k))
                .filter(|t| filter.start_date.map_or(true, |d| t.occurred_at >= d))
                .filter(|t| filter.end_date.map_or(true, |d| t.occurred_at <= d))
                .cloned()
                .collect()
        };

        // Newest first
        rows.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));

        let mut out = Vec::new();
        for transaction in rows {
            let category_name = self.category_name(transaction.category_id).await;
            if let Some(ref needle) = category_filter {
                let matches = category_name
                    .as_deref()
                    .map(|n| n.to_lowercase().contains(needle))
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }
            out.push(TransactionWithCategory {
                transaction,
                category_name,
            });
            if out.len() >= filter.effective_limit() {
                break;
            }
        }

        Ok(out)
    }

    async fn month_to_date_spending(&self, user_id: Uuid) -> Result<f64> {
        let since = month_start();
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .filter(|t| {
                t.user_id == user_id
                    && t.kind == TransactionType::Expense
                    && t.occurred_at >= since
            })
            .map(|t| t.amount)
            .sum())
    }

    async fn create_budget(
        &self,
        user_id: Uuid,
        category_id: Uuid,
        name: &str,
        amount: f64,
    ) -> Result<Budget> {
        {
            let categories = self.categories.read().await;
            if !categories
                .get(&category_id)
                .map_or(false, |c| c.user_id == user_id)
            {
                return Err(crate::error::AssistantError::not_found(format!(
                    "Category {} not found",
                    category_id
                )));
            }
        }

        let now = Utc::now();
        let budget = Budget {
            budget_id: Uuid::new_v4(),
            user_id,
            category_id,
            name: name.to_string(),
            amount,
            created_at: now,
            updated_at: now,
        };

        let mut budgets = self.budgets.write().await;
        budgets.insert(budget.budget_id, budget.clone());
        Ok(budget)
    }

    async fn update_budget(
        &self,
        user_id: Uuid,
        budget_id: Uuid,
        patch: BudgetPatch,
    ) -> Result<Budget> {
        let mut budgets = self.budgets.write().await;
        let budget = budgets
            .get_mut(&budget_id)
            .filter(|b| b.user_id == user_id)
            .ok_or_else(|| {
                crate::error::AssistantError::not_found(format!("Budget {} not found", budget_id))
            })?;

        if let Some(name) = patch.name {
            budget.name = name;
        }
        if let Some(amount) = patch.amount {
            budget.amount = amount;
        }
        budget.updated_at = Utc::now();

        Ok(budget.clone())
    }

    async fn delete_budget(&self, user_id: Uuid, budget_id: Uuid) -> Result<()> {
        let mut budgets = self.budgets.write().await;
        let owned = budgets
            .get(&budget_id)
            .map_or(false, |b| b.user_id == user_id);
        if !owned {
            return Err(crate::error::AssistantError::not_found(format!(
                "Budget {} not found",
                budget_id
            )));
        }
        budgets.remove(&budget_id);
        Ok(())
    }

    async fn list_budgets(&self, user_id: Uuid) -> Result<Vec<BudgetWithStatus>> {
        let mut budgets: Vec<Budget> = {
            let locked = self.budgets.read().await;
            locked
                .values()
                .filter(|b| b.user_id == user_id)
                .cloned()
                .collect()
        };
        budgets.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut out = Vec::with_capacity(budgets.len());
        for budget in budgets {
            let category_name = self
                .category_name(Some(budget.category_id))
                .await
                .unwrap_or_default();
            let spent = self.spent_for_category(user_id, budget.category_id).await;
            out.push(BudgetWithStatus::from_spend(budget, category_name, spent));
        }

        Ok(out)
    }

    async fn create_category(&self, user_id: Uuid, name: &str) -> Result<Category> {
        let category = Category {
            category_id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            created_at: Utc::now(),
        };

        let mut categories = self.categories.write().await;
        categories.insert(category.category_id, category.clone());
        Ok(category)
    }

    async fn list_categories(&self, user_id: Uuid) -> Result<Vec<Category>> {
        let categories = self.categories.read().await;
        let mut out: Vec<Category> = categories
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn find_category_by_name(&self, user_id: Uuid, name: &str) -> Result<Option<Category>> {
        let needle = name.to_lowercase();
        let categories = self.categories.read().await;
        Ok(categories
            .values()
            .find(|c| c.user_id == user_id && c.name.to_lowercase() == needle)
            .cloned())
    }

    async fn create_budget_for_category(
        &self,
        user_id: Uuid,
        category_name: &str,
        budget_name: &str,
        amount: f64,
    ) -> Result<(Category, Budget, bool)> {
        let (category, created) = match self.find_category_by_name(user_id, category_name).await? {
            Some(existing) => (existing, false),
            None => (self.create_category(user_id, category_name).await?, true),
        };

        let budget = self
            .create_budget(user_id, category.category_id, budget_name, amount)
            .await?;

        Ok((category, budget, created))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn month_to_date_excludes_income() {
        let store = InMemoryLedgerStore::new();
        let user_id = Uuid::new_v4();

        store
            .create_transaction(
                user_id,
                NewTransaction {
                    category_id: None,
                    amount: 45.0,
                    kind: TransactionType::Expense,
                    description: "Groceries".into(),
                    occurred_at: None,
                },
            )
            .await
            .unwrap();
        store
            .create_transaction(
                user_id,
                NewTransaction {
                    category_id: None,
                    amount: 2000.0,
                    kind: TransactionType::Income,
                    description: "Salary".into(),
                    occurred_at: None,
                },
            )
            .await
            .unwrap();

        let total = store.month_to_date_spending(user_id).await.unwrap();
        assert_eq!(total, 45.0);
    }

    #[tokio::test]
    async fn ledger_is_tenant_scoped() {
        let store = InMemoryLedgerStore::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let category = store.create_category(alice, "Dining").await.unwrap();
        store
            .create_budget(alice, category.category_id, "Dining", 300.0)
            .await
            .unwrap();

        assert!(store.list_budgets(bob).await.unwrap().is_empty());
        assert!(store
            .find_category_by_name(bob, "Dining")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn budget_for_category_is_idempotent_on_category() {
        let store = InMemoryLedgerStore::new();
        let user_id = Uuid::new_v4();

        let (_, _, created_first) = store
            .create_budget_for_category(user_id, "Groceries", "Monthly groceries", 400.0)
            .await
            .unwrap();
        let (_, _, created_second) = store
            .create_budget_for_category(user_id, "groceries", "Extra groceries", 100.0)
            .await
            .unwrap();

        assert!(created_first);
        assert!(!created_second);
        assert_eq!(store.list_categories(user_id).await.unwrap().len(), 1);
        assert_eq!(store.list_budgets(user_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_missing_transaction_fails_without_side_effects() {
        let store = InMemoryLedgerStore::new();
        let user_id = Uuid::new_v4();

        let result = store
            .update_transaction(user_id, Uuid::new_v4(), TransactionPatch::default())
            .await;
        assert!(result.is_err());

        let listed = store
            .list_transactions(user_id, &TransactionFilter::default())
            .await
            .unwrap();
        assert!(listed.is_empty());
    }
}
