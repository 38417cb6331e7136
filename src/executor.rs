//! Tool executor
//!
//! Validates and runs tool invocations requested by the reasoning engine
//! against the ledger. Never fails outward: every error becomes a
//! `ToolResult { success: false }` so the conversation can react to it
//! ("budget not found, did you mean X?") instead of aborting the turn.

use crate::catalog;
use crate::error::AssistantError;
use crate::models::{
    BudgetPatch, BudgetWithStatus, NewTransaction, ToolInvocation, ToolResult, TransactionFilter,
    TransactionPatch, TransactionType,
};
use crate::store::LedgerStore;
use crate::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct ToolExecutor {
    ledger: Arc<dyn LedgerStore>,
}

//
// ================= Argument extraction =================
//

fn require_str<'a>(args: &'a Value, name: &str) -> Result<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AssistantError::Validation(format!("Missing required parameter '{}'", name)))
}

fn opt_str<'a>(args: &'a Value, name: &str) -> Option<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn require_amount(args: &Value, name: &str) -> Result<f64> {
    let amount = args.get(name).and_then(Value::as_f64).ok_or_else(|| {
        AssistantError::Validation(format!("Missing required parameter '{}'", name))
    })?;
    if amount < 0.0 {
        return Err(AssistantError::Validation(format!(
            "'{}' must be non-negative; direction is carried by the type field",
            name
        )));
    }
    Ok(amount)
}

fn opt_amount(args: &Value, name: &str) -> Result<Option<f64>> {
    match args.get(name).and_then(Value::as_f64) {
        Some(v) if v < 0.0 => Err(AssistantError::Validation(format!(
            "'{}' must be non-negative",
            name
        ))),
        other => Ok(other),
    }
}

fn opt_date(args: &Value, name: &str) -> Result<Option<DateTime<Utc>>> {
    match opt_str(args, name) {
        Some(raw) => {
            let parsed = DateTime::parse_from_rfc3339(raw)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| {
                    AssistantError::Validation(format!(
                        "'{}' must be an RFC 3339 date-time, got '{}'",
                        name, raw
                    ))
                })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| AssistantError::Validation(format!("'{}' is not a valid {} id", raw, what)))
}

fn parse_kind(raw: &str) -> Result<TransactionType> {
    TransactionType::parse(raw).ok_or_else(|| {
        AssistantError::Validation(format!(
            "'{}' is not a valid transaction type (income or expense)",
            raw
        ))
    })
}

/// Convert an internal error into the conversational failure message.
/// Suggestion lists are folded in; internal fields never leak.
fn failure_from(err: AssistantError) -> ToolResult {
    let message = match err {
        AssistantError::NotFound {
            message,
            suggestions,
        } if !suggestions.is_empty() => {
            format!("{}. Did you mean: {}?", message, suggestions.join(", "))
        }
        AssistantError::Ambiguous {
            message,
            candidates,
        } => format!("{}. Candidates: {}", message, candidates.join(", ")),
        AssistantError::Validation(m) | AssistantError::NotFound { message: m, .. } => m,
        AssistantError::Upstream(_)
        | AssistantError::Database(_)
        | AssistantError::Http(_)
        | AssistantError::Io(_)
        | AssistantError::Serialization(_)
        | AssistantError::Uuid(_) => "The operation could not be completed right now".to_string(),
    };
    ToolResult::failure(message)
}

impl ToolExecutor {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Execute a single tool invocation. Infallible by contract.
    pub async fn execute(&self, name: &str, args: &Value, user_id: Uuid) -> ToolResult {
        if catalog::find_tool(name).is_none() {
            warn!(tool = %name, "Rejecting unknown tool");
            return ToolResult::failure(format!("Unknown tool '{}'", name));
        }
        if !args.is_object() {
            return ToolResult::failure("Tool arguments must be a JSON object");
        }

        debug!(tool = %name, user_id = %user_id, "Executing tool");

        let result = match name {
            "add_transaction" => self.add_transaction(args, user_id).await,
            "update_transaction" => self.update_transaction(args, user_id).await,
            "delete_transaction" => self.delete_transaction(args, user_id).await,
            "get_transactions" => self.get_transactions(args, user_id).await,
            "get_spending_analysis" => self.get_spending_analysis(user_id).await,
            "create_budget_with_category" => self.create_budget_with_category(args, user_id).await,
            "update_budget" => self.update_budget(args, user_id).await,
            "delete_budget" => self.delete_budget(args, user_id).await,
            "get_budgets" => self.get_budgets(user_id).await,
            "create_category" => self.create_category(args, user_id).await,
            // catalog() and this match must stay in step
            _ => Err(AssistantError::Validation(format!(
                "Unknown tool '{}'",
                name
            ))),
        };

        match result {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(tool = %name, error = %err, "Tool failed");
                failure_from(err)
            }
        }
    }

    /// Execute every invocation of one round. Calls are independent within
    /// a round, so they run concurrently; result order matches call order.
    pub async fn execute_all(
        &self,
        calls: &[ToolInvocation],
        user_id: Uuid,
    ) -> Vec<ToolResult> {
        join_all(
            calls
                .iter()
                .map(|call| self.execute(&call.name, &call.arguments, user_id)),
        )
        .await
    }

    //
    // ================= Resolution =================
    //

    /// Resolve an optional category name to its id. Failure enumerates the
    /// user's existing categories so the engine can ask a follow-up.
    async fn resolve_category(&self, user_id: Uuid, name: &str) -> Result<Uuid> {
        if let Some(category) = self.ledger.find_category_by_name(user_id, name).await? {
            return Ok(category.category_id);
        }

        let existing = self
            .ledger
            .list_categories(user_id)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        Err(AssistantError::not_found_with(
            format!("No category named '{}'", name),
            existing,
        ))
    }

    /// Resolve a budget by direct id or by case-insensitive substring match
    /// against budget and category names. Zero or multiple matches fail
    /// with guidance rather than guessing.
    async fn resolve_budget(&self, user_id: Uuid, args: &Value) -> Result<BudgetWithStatus> {
        let budgets = self.ledger.list_budgets(user_id).await?;

        if let Some(raw) = opt_str(args, "budget_id") {
            let budget_id = parse_uuid(raw, "budget")?;
            return budgets
                .into_iter()
                .find(|b| b.budget.budget_id == budget_id)
                .ok_or_else(|| {
                    AssistantError::not_found(format!("Budget {} not found", budget_id))
                });
        }

        let Some(name) = opt_str(args, "budget_name") else {
            return Err(AssistantError::Validation(
                "Provide either 'budget_id' or 'budget_name'".to_string(),
            ));
        };
        let needle = name.to_lowercase();

        let mut matches: Vec<BudgetWithStatus> = budgets
            .iter()
            .filter(|b| {
                b.budget.name.to_lowercase().contains(&needle)
                    || b.category_name.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();

        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(AssistantError::not_found_with(
                format!("No budget matching '{}'", name),
                budgets.iter().map(|b| b.budget.name.clone()).collect(),
            )),
            _ => Err(AssistantError::ambiguous(
                format!("'{}' matches more than one budget", name),
                matches.iter().map(|b| b.budget.name.clone()).collect(),
            )),
        }
    }

    //
    // ================= Transaction tools =================
    //

    async fn add_transaction(&self, args: &Value, user_id: Uuid) -> Result<ToolResult> {
        let amount = require_amount(args, "amount")?;
        let kind = parse_kind(require_str(args, "type")?)?;
        let description = require_str(args, "description")?;
        let occurred_at = opt_date(args, "date")?;

        let category_id = match opt_str(args, "category") {
            Some(name) => Some(self.resolve_category(user_id, name).await?),
            None => None,
        };

        let transaction = self
            .ledger
            .create_transaction(
                user_id,
                NewTransaction {
                    category_id,
                    amount,
                    kind,
                    description: description.to_string(),
                    occurred_at,
                },
            )
            .await?;

        Ok(ToolResult::ok(
            format!("Recorded {} of ${:.2}: {}", kind, amount, description),
            serde_json::to_value(&transaction)?,
        ))
    }

    async fn update_transaction(&self, args: &Value, user_id: Uuid) -> Result<ToolResult> {
        let transaction_id = parse_uuid(require_str(args, "transaction_id")?, "transaction")?;

        let category_id = match opt_str(args, "category") {
            Some(name) => Some(self.resolve_category(user_id, name).await?),
            None => None,
        };
        let kind = match opt_str(args, "type") {
            Some(raw) => Some(parse_kind(raw)?),
            None => None,
        };

        let patch = TransactionPatch {
            category_id,
            amount: opt_amount(args, "amount")?,
            kind,
            description: opt_str(args, "description").map(str::to_string),
            occurred_at: opt_date(args, "date")?,
        };

        let transaction = self
            .ledger
            .update_transaction(user_id, transaction_id, patch)
            .await?;

        Ok(ToolResult::ok(
            format!("Updated transaction '{}'", transaction.description),
            serde_json::to_value(&transaction)?,
        ))
    }

    async fn delete_transaction(&self, args: &Value, user_id: Uuid) -> Result<ToolResult> {
        let transaction_id = parse_uuid(require_str(args, "transaction_id")?, "transaction")?;
        self.ledger
            .delete_transaction(user_id, transaction_id)
            .await?;

        Ok(ToolResult::ok(
            "Transaction deleted",
            json!({ "transaction_id": transaction_id }),
        ))
    }

    async fn get_transactions(&self, args: &Value, user_id: Uuid) -> Result<ToolResult> {
        let kind = match opt_str(args, "type") {
            Some(raw) => Some(parse_kind(raw)?),
            None => None,
        };
        let filter = TransactionFilter {
            category: opt_str(args, "category").map(str::to_string),
            start_date: opt_date(args, "start_date")?,
            end_date: opt_date(args, "end_date")?,
            kind,
            limit: args
                .get("limit")
                .and_then(Value::as_u64)
                .map(|v| v as usize),
        };

        let transactions = self.ledger.list_transactions(user_id, &filter).await?;
        let count = transactions.len();

        Ok(ToolResult::ok(
            format!("Found {} transaction(s)", count),
            serde_json::to_value(&transactions)?,
        ))
    }

    async fn get_spending_analysis(&self, user_id: Uuid) -> Result<ToolResult> {
        let total = self.ledger.month_to_date_spending(user_id).await?;
        let budgets = self.ledger.list_budgets(user_id).await?;

        Ok(ToolResult::ok(
            format!("Spent ${:.2} so far this month", total),
            json!({
                "total_spending_this_month": total,
                "budgets": budgets,
            }),
        ))
    }

    //
    // ================= Budget tools =================
    //

    async fn create_budget_with_category(&self, args: &Value, user_id: Uuid) -> Result<ToolResult> {
        let category_name = require_str(args, "category_name")?;
        let budget_name = opt_str(args, "budget_name").unwrap_or(category_name);
        let amount = require_amount(args, "amount")?;

        let (category, budget, created) = self
            .ledger
            .create_budget_for_category(user_id, category_name, budget_name, amount)
            .await?;

        let message = if created {
            format!(
                "Created category '{}' and budget '{}' (${:.2}/month)",
                category.name, budget.name, budget.amount
            )
        } else {
            format!(
                "Created budget '{}' (${:.2}/month) under existing category '{}'",
                budget.name, budget.amount, category.name
            )
        };

        Ok(ToolResult::ok(
            message,
            json!({ "category": category, "budget": budget, "category_created": created }),
        ))
    }

    async fn update_budget(&self, args: &Value, user_id: Uuid) -> Result<ToolResult> {
        let resolved = self.resolve_budget(user_id, args).await?;

        let patch = BudgetPatch {
            name: opt_str(args, "new_name").map(str::to_string),
            amount: opt_amount(args, "amount")?,
        };
        if patch.name.is_none() && patch.amount.is_none() {
            return Err(AssistantError::Validation(
                "Nothing to update: provide 'amount' or 'new_name'".to_string(),
            ));
        }

        let budget = self
            .ledger
            .update_budget(user_id, resolved.budget.budget_id, patch)
            .await?;

        Ok(ToolResult::ok(
            format!(
                "Updated budget '{}' to ${:.2}/month",
                budget.name, budget.amount
            ),
            serde_json::to_value(&budget)?,
        ))
    }

    async fn delete_budget(&self, args: &Value, user_id: Uuid) -> Result<ToolResult> {
        let resolved = self.resolve_budget(user_id, args).await?;
        self.ledger
            .delete_budget(user_id, resolved.budget.budget_id)
            .await?;

        Ok(ToolResult::ok(
            format!("Deleted budget '{}'", resolved.budget.name),
            json!({ "budget_id": resolved.budget.budget_id }),
        ))
    }

    async fn get_budgets(&self, user_id: Uuid) -> Result<ToolResult> {
        let budgets = self.ledger.list_budgets(user_id).await?;
        Ok(ToolResult::ok(
            format!("Found {} budget(s)", budgets.len()),
            serde_json::to_value(&budgets)?,
        ))
    }

    async fn create_category(&self, args: &Value, user_id: Uuid) -> Result<ToolResult> {
        let name = require_str(args, "name")?;

        if let Some(existing) = self.ledger.find_category_by_name(user_id, name).await? {
            return Ok(ToolResult::failure(format!(
                "Category '{}' already exists",
                existing.name
            )));
        }

        let category = self.ledger.create_category(user_id, name).await?;
        Ok(ToolResult::ok(
            format!("Created category '{}'", category.name),
            serde_json::to_value(&category)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLedgerStore;

    fn fixture() -> (ToolExecutor, Arc<InMemoryLedgerStore>, Uuid) {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let executor = ToolExecutor::new(ledger.clone());
        (executor, ledger, Uuid::new_v4())
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected_without_side_effects() {
        let (executor, ledger, user_id) = fixture();

        let result = executor
            .execute("transfer_funds", &json!({"amount": 10}), user_id)
            .await;
        assert!(!result.success);

        let transactions = ledger
            .list_transactions(user_id, &TransactionFilter::default())
            .await
            .unwrap();
        assert!(transactions.is_empty());
    }

    #[tokio::test]
    async fn unresolvable_category_lists_alternatives_and_creates_nothing() {
        let (executor, ledger, user_id) = fixture();
        ledger.create_category(user_id, "Rent").await.unwrap();
        ledger.create_category(user_id, "Utilities").await.unwrap();

        // "I spent $45 at Whole Foods on groceries" with no Groceries category
        let result = executor
            .execute(
                "add_transaction",
                &json!({
                    "amount": 45.0,
                    "type": "expense",
                    "description": "Whole Foods",
                    "category": "Groceries",
                }),
                user_id,
            )
            .await;

        assert!(!result.success);
        assert!(result.message.contains("Groceries"));
        assert!(result.message.contains("Rent"));
        assert!(result.message.contains("Utilities"));

        let transactions = ledger
            .list_transactions(user_id, &TransactionFilter::default())
            .await
            .unwrap();
        assert!(transactions.is_empty());
    }

    #[tokio::test]
    async fn negative_amount_is_rejected() {
        let (executor, _, user_id) = fixture();

        let result = executor
            .execute(
                "add_transaction",
                &json!({"amount": -5.0, "type": "expense", "description": "oops"}),
                user_id,
            )
            .await;
        assert!(!result.success);
        assert!(result.message.contains("non-negative"));
    }

    #[tokio::test]
    async fn nonexistent_id_fails_without_mutation() {
        let (executor, ledger, user_id) = fixture();

        let result = executor
            .execute(
                "delete_transaction",
                &json!({"transaction_id": Uuid::new_v4().to_string()}),
                user_id,
            )
            .await;
        assert!(!result.success);

        let result = executor
            .execute(
                "update_budget",
                &json!({"budget_id": Uuid::new_v4().to_string(), "amount": 100.0}),
                user_id,
            )
            .await;
        assert!(!result.success);

        assert!(ledger.list_budgets(user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn budget_creation_is_idempotent_on_category() {
        let (executor, ledger, user_id) = fixture();

        let first = executor
            .execute(
                "create_budget_with_category",
                &json!({"category_name": "Groceries", "amount": 400.0}),
                user_id,
            )
            .await;
        let second = executor
            .execute(
                "create_budget_with_category",
                &json!({"category_name": "groceries", "budget_name": "Extra groceries", "amount": 100.0}),
                user_id,
            )
            .await;

        assert!(first.success);
        assert!(second.success);
        assert_eq!(ledger.list_categories(user_id).await.unwrap().len(), 1);
        assert_eq!(ledger.list_budgets(user_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fuzzy_budget_update_by_name() {
        let (executor, ledger, user_id) = fixture();
        let category = ledger.create_category(user_id, "Dining").await.unwrap();
        let budget = ledger
            .create_budget(user_id, category.category_id, "Dining", 200.0)
            .await
            .unwrap();
        let before = budget.updated_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let result = executor
            .execute(
                "update_budget",
                &json!({"budget_name": "Dining", "amount": 300.0}),
                user_id,
            )
            .await;

        assert!(result.success);
        assert!(result.message.contains("Dining"));

        let budgets = ledger.list_budgets(user_id).await.unwrap();
        assert_eq!(budgets[0].budget.amount, 300.0);
        assert!(budgets[0].budget.updated_at > before);
    }

    #[tokio::test]
    async fn ambiguous_budget_match_fails_with_candidates() {
        let (executor, ledger, user_id) = fixture();
        let dining = ledger.create_category(user_id, "Dining").await.unwrap();
        let delivery = ledger.create_category(user_id, "Din delivery").await.unwrap();
        ledger
            .create_budget(user_id, dining.category_id, "Dining out", 200.0)
            .await
            .unwrap();
        ledger
            .create_budget(user_id, delivery.category_id, "Dinner delivery", 150.0)
            .await
            .unwrap();

        let result = executor
            .execute("delete_budget", &json!({"budget_name": "din"}), user_id)
            .await;

        assert!(!result.success);
        assert!(result.message.contains("Dining out"));
        assert!(result.message.contains("Dinner delivery"));
        assert_eq!(ledger.list_budgets(user_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn read_tools_honor_limit_default() {
        let (executor, ledger, user_id) = fixture();
        for i in 0..15 {
            ledger
                .create_transaction(
                    user_id,
                    NewTransaction {
                        category_id: None,
                        amount: i as f64,
                        kind: TransactionType::Expense,
                        description: format!("t{}", i),
                        occurred_at: None,
                    },
                )
                .await
                .unwrap();
        }

        let result = executor.execute("get_transactions", &json!({}), user_id).await;
        assert!(result.success);
        let rows = result.data.unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn concurrent_round_preserves_result_order() {
        let (executor, _, user_id) = fixture();

        let calls = vec![
            ToolInvocation {
                name: "create_category".into(),
                arguments: json!({"name": "Travel"}),
            },
            ToolInvocation {
                name: "get_budgets".into(),
                arguments: json!({}),
            },
        ];

        let results = executor.execute_all(&calls, user_id).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].message.contains("Travel"));
        assert!(results[1].message.contains("budget"));
    }
}
