//! Offline demo: runs one scripted conversation turn against in-memory
//! stores, no network or database required.

use finance_assistant::{
    context::ContextAssembler,
    engine::{EngineReply, MockEngine},
    executor::ToolExecutor,
    history::{ChatHistoryStore, InMemoryChatHistoryStore},
    models::{NewTransaction, ToolInvocation, TransactionType},
    orchestrator::Orchestrator,
    store::{InMemoryLedgerStore, LedgerStore},
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("Finance Assistant demo starting");

    let ledger = Arc::new(InMemoryLedgerStore::new());
    let history = Arc::new(InMemoryChatHistoryStore::new());
    let user_id = Uuid::new_v4();

    // Seed some data
    let groceries = ledger.create_category(user_id, "Groceries").await?;
    ledger
        .create_budget(user_id, groceries.category_id, "Groceries", 400.0)
        .await?;
    ledger
        .create_transaction(
            user_id,
            NewTransaction {
                category_id: Some(groceries.category_id),
                amount: 62.35,
                kind: TransactionType::Expense,
                description: "Weekly shop".to_string(),
                occurred_at: None,
            },
        )
        .await?;

    // Scripted engine: one tool round, then the final answer.
    let engine = MockEngine::new(vec![
        EngineReply::ToolCalls(vec![ToolInvocation {
            name: "get_spending_analysis".to_string(),
            arguments: json!({}),
        }]),
        EngineReply::Answer(
            "You've spent $62.35 this month, all on groceries — about 16% of your $400 budget."
                .to_string(),
        ),
    ]);

    let orchestrator = Orchestrator::new(
        ContextAssembler::new(ledger.clone()),
        ToolExecutor::new(ledger),
        Box::new(engine),
        history.clone(),
    );

    let question = "How is my spending looking this month?";
    let answer = orchestrator.respond(question, user_id).await?;

    println!("\n=== CONVERSATION TURN ===");
    println!("User: {}", question);
    println!("Assistant: {}", answer);

    let page = history.list(user_id, 1, 10).await?;
    println!("\nPersisted turns: {}", page.total);

    Ok(())
}
