//! Core data models for the finance assistant

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

/// Direction of a transaction. Amounts are always non-negative;
/// sign is carried here, never by the amount itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Income,
    Expense,
}

impl TransactionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "income" => Some(Self::Income),
            "expense" => Some(Self::Expense),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BudgetHealth {
    Ok,
    Warning,
    Exceeded,
}

//
// ================= Ledger =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub category_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub category_id: Option<Uuid>,
    pub amount: f64,
    pub kind: TransactionType,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Transaction joined with its category name, as read tools and the
/// context snapshot present it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionWithCategory {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub category_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub budget_id: Uuid,
    pub user_id: Uuid,
    pub category_id: Uuid,
    pub name: String,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Budget joined with category name and month-to-date spend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetWithStatus {
    #[serde(flatten)]
    pub budget: Budget,
    pub category_name: String,
    pub spent: f64,
    pub remaining: f64,
    pub percent_used: f64,
    pub health: BudgetHealth,
}

impl BudgetWithStatus {
    pub fn from_spend(budget: Budget, category_name: String, spent: f64) -> Self {
        let remaining = budget.amount - spent;
        let percent_used = if budget.amount > 0.0 {
            (spent / budget.amount) * 100.0
        } else {
            0.0
        };
        let health = if spent > budget.amount {
            BudgetHealth::Exceeded
        } else if percent_used >= 80.0 {
            BudgetHealth::Warning
        } else {
            BudgetHealth::Ok
        };

        Self {
            budget,
            category_name,
            spent,
            remaining,
            percent_used,
            health,
        }
    }
}

//
// ================= Mutations =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    pub category_id: Option<Uuid>,
    pub amount: f64,
    pub kind: TransactionType,
    pub description: String,
    pub occurred_at: Option<DateTime<Utc>>,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionPatch {
    pub category_id: Option<Uuid>,
    pub amount: Option<f64>,
    pub kind: Option<TransactionType>,
    pub description: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetPatch {
    pub name: Option<String>,
    pub amount: Option<f64>,
}

//
// ================= Queries =================
//

pub const DEFAULT_QUERY_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionFilter {
    /// Case-insensitive substring match on category name.
    pub category: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub kind: Option<TransactionType>,
    pub limit: Option<usize>,
}

impl TransactionFilter {
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub total_pages: usize,
}

//
// ================= Conversation =================
//

/// One persisted exchange: a user message and the fully resolved
/// assistant response, including any tool rounds in between.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn_id: Uuid,
    pub user_id: Uuid,
    pub user_message: String,
    pub assistant_response: String,
    pub created_at: DateTime<Utc>,
}

//
// ================= Financial Context =================
//

/// Ephemeral snapshot of a user's financial state, built fresh per turn
/// and discarded at its end. Grounds the reasoning engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialContext {
    pub total_spending_this_month: f64,
    pub recent_transactions: Vec<TransactionWithCategory>,
    pub active_budgets: Vec<BudgetWithStatus>,
    pub categories: Vec<Category>,
}

impl FinancialContext {
    /// Render the snapshot as the grounding text block sent to the engine.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "## Current financial state\n\nSpending this month: ${:.2}\n\n",
            self.total_spending_this_month
        ));

        if self.categories.is_empty() {
            out.push_str("Categories: none yet\n\n");
        } else {
            let names: Vec<&str> = self.categories.iter().map(|c| c.name.as_str()).collect();
            out.push_str(&format!("Categories: {}\n\n", names.join(", ")));
        }

        if !self.active_budgets.is_empty() {
            out.push_str("Budgets:\n");
            for b in &self.active_budgets {
                out.push_str(&format!(
                    "- {} ({}): ${:.2} of ${:.2} used ({:.0}%)\n",
                    b.budget.name, b.category_name, b.spent, b.budget.amount, b.percent_used
                ));
            }
            out.push('\n');
        }

        if !self.recent_transactions.is_empty() {
            out.push_str("Recent transactions:\n");
            for t in &self.recent_transactions {
                out.push_str(&format!(
                    "- {} ${:.2} {} ({})\n",
                    t.transaction.occurred_at.format("%Y-%m-%d"),
                    t.transaction.amount,
                    t.transaction.description,
                    t.category_name.as_deref().unwrap_or("uncategorized"),
                ));
            }
        }

        out
    }
}

//
// ================= Tool I/O =================
//

/// A tool invocation requested by the reasoning engine. Untrusted input:
/// must be validated against the catalog before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Uniform result envelope returned to the reasoning engine.
/// `success: false` is conversational data, not a fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub message: String,
}

impl ToolResult {
    pub fn ok(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionType::Income => "income",
            TransactionType::Expense => "expense",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_health_thresholds() {
        let budget = Budget {
            budget_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            category_id: Uuid::new_v4(),
            name: "Dining".to_string(),
            amount: 100.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let ok = BudgetWithStatus::from_spend(budget.clone(), "Dining".into(), 50.0);
        assert_eq!(ok.health, BudgetHealth::Ok);
        assert_eq!(ok.remaining, 50.0);

        let warning = BudgetWithStatus::from_spend(budget.clone(), "Dining".into(), 85.0);
        assert_eq!(warning.health, BudgetHealth::Warning);

        let exceeded = BudgetWithStatus::from_spend(budget, "Dining".into(), 120.0);
        assert_eq!(exceeded.health, BudgetHealth::Exceeded);
        assert!(exceeded.remaining < 0.0);
    }

    #[test]
    fn transaction_type_parse() {
        assert_eq!(TransactionType::parse("Expense"), Some(TransactionType::Expense));
        assert_eq!(TransactionType::parse("income"), Some(TransactionType::Income));
        assert_eq!(TransactionType::parse("transfer"), None);
    }
}
