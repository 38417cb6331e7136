//! Financial context assembly
//!
//! Builds the per-turn snapshot that grounds the reasoning engine. The four
//! reads are independent and run concurrently; any failure aborts assembly,
//! since a turn must not proceed on silently-incomplete financial state.

use crate::models::{FinancialContext, TransactionFilter, DEFAULT_QUERY_LIMIT};
use crate::store::LedgerStore;
use crate::Result;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub struct ContextAssembler {
    ledger: Arc<dyn LedgerStore>,
}

impl ContextAssembler {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    pub async fn build(&self, user_id: Uuid) -> Result<FinancialContext> {
        let recent_filter = TransactionFilter {
            limit: Some(DEFAULT_QUERY_LIMIT),
            ..Default::default()
        };

        let (total_spending_this_month, recent_transactions, active_budgets, categories) = tokio::try_join!(
            self.ledger.month_to_date_spending(user_id),
            self.ledger.list_transactions(user_id, &recent_filter),
            self.ledger.list_budgets(user_id),
            self.ledger.list_categories(user_id),
        )?;

        debug!(
            user_id = %user_id,
            transactions = recent_transactions.len(),
            budgets = active_budgets.len(),
            "Financial context assembled"
        );

        Ok(FinancialContext {
            total_spending_this_month,
            recent_transactions,
            active_budgets,
            categories,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTransaction, TransactionType};
    use crate::store::InMemoryLedgerStore;

    #[tokio::test]
    async fn snapshot_caps_recent_transactions_at_ten() {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let user_id = Uuid::new_v4();

        for i in 0..12 {
            ledger
                .create_transaction(
                    user_id,
                    NewTransaction {
                        category_id: None,
                        amount: 10.0,
                        kind: TransactionType::Expense,
                        description: format!("t{}", i),
                        occurred_at: None,
                    },
                )
                .await
                .unwrap();
        }

        let assembler = ContextAssembler::new(ledger);
        let context = assembler.build(user_id).await.unwrap();

        assert_eq!(context.recent_transactions.len(), 10);
        assert_eq!(context.total_spending_this_month, 120.0);
    }

    #[tokio::test]
    async fn snapshots_are_tenant_scoped() {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        ledger
            .create_transaction(
                alice,
                NewTransaction {
                    category_id: None,
                    amount: 45.0,
                    kind: TransactionType::Expense,
                    description: "Whole Foods".into(),
                    occurred_at: None,
                },
            )
            .await
            .unwrap();

        let assembler = ContextAssembler::new(ledger);
        let bobs = assembler.build(bob).await.unwrap();

        assert!(bobs.recent_transactions.is_empty());
        assert_eq!(bobs.total_spending_this_month, 0.0);
    }
}
