//! Conversation orchestrator
//!
//! Drives one turn: assemble context, exchange bounded tool rounds with the
//! reasoning engine, and persist the completed exchange. Tool failures are
//! conversational data; context and engine failures abort the turn, and no
//! partial assistant message is ever persisted.

use crate::context::ContextAssembler;
use crate::engine::{EngineReply, EngineRequest, ReasoningEngine, ToolRound};
use crate::error::AssistantError;
use crate::executor::ToolExecutor;
use crate::history::ChatHistoryStore;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Explicit cap on engine rounds per turn.
pub const DEFAULT_MAX_ROUNDS: usize = 5;

/// How many prior turns the engine sees.
pub const HISTORY_WINDOW: usize = 5;

/// One record on the streaming transport. Newline-delimited on the wire;
/// the stream terminates after `complete` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Connected,
    Chunk {
        content: String,
    },
    Complete {
        #[serde(rename = "fullResponse")]
        full_response: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

pub struct Orchestrator {
    context: ContextAssembler,
    executor: ToolExecutor,
    engine: Box<dyn ReasoningEngine>,
    history: Arc<dyn ChatHistoryStore>,
    max_rounds: usize,
}

fn render_tool_results(round: &ToolRound) -> String {
    round
        .results
        .iter()
        .map(|r| r.message.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

impl Orchestrator {
    pub fn new(
        context: ContextAssembler,
        executor: ToolExecutor,
        engine: Box<dyn ReasoningEngine>,
        history: Arc<dyn ChatHistoryStore>,
    ) -> Self {
        Self {
            context,
            executor,
            engine,
            history,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    async fn build_request(&self, user_message: &str, user_id: Uuid) -> Result<EngineRequest> {
        if user_message.trim().is_empty() {
            return Err(AssistantError::Validation(
                "Message must not be empty".to_string(),
            ));
        }

        let context = self.context.build(user_id).await?;
        let mut recent = self
            .history
            .list(user_id, 1, HISTORY_WINDOW)
            .await?
            .items;
        // Stored newest-first; the engine wants chronological order.
        recent.reverse();

        Ok(EngineRequest {
            system_context: context.render(),
            history: recent,
            user_message: user_message.to_string(),
            rounds: Vec::new(),
        })
    }

    /// Single-shot mode: returns the final answer after all tool rounds.
    pub async fn respond(&self, user_message: &str, user_id: Uuid) -> Result<String> {
        let mut request = self.build_request(user_message, user_id).await?;

        info!(user_id = %user_id, "Starting conversation turn");

        for round in 0..self.max_rounds {
            let reply = self.engine.generate(&request).await?;

            match reply {
                EngineReply::Answer(answer) => {
                    debug!(rounds = round, "Turn resolved with direct answer");
                    self.history
                        .append(user_id, user_message, &answer)
                        .await?;
                    return Ok(answer);
                }
                EngineReply::ToolCalls(calls) => {
                    debug!(round, count = calls.len(), "Engine requested tools");
                    let results = self.executor.execute_all(&calls, user_id).await;
                    request.rounds.push(ToolRound { calls, results });
                }
            }
        }

        // Round limit reached: degrade to the last tool results as text so
        // the ledger and the reply stay consistent with what actually ran.
        warn!(user_id = %user_id, max_rounds = self.max_rounds, "Round limit reached");
        let answer = request
            .rounds
            .last()
            .map(render_tool_results)
            .unwrap_or_else(|| "I could not complete that request.".to_string());

        self.history.append(user_id, user_message, &answer).await?;
        Ok(answer)
    }

    /// Streaming mode: the same protocol, delivered incrementally as
    /// `StreamEvent`s over `tx`. If the client disconnects mid-stream,
    /// in-flight tool work completes but nothing is persisted.
    pub async fn respond_stream(
        &self,
        user_message: &str,
        user_id: Uuid,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        if tx.send(StreamEvent::Connected).await.is_err() {
            return;
        }

        let mut request = match self.build_request(user_message, user_id).await {
            Ok(request) => request,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Turn aborted before engine call");
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let mut full_response = String::new();

        for _round in 0..self.max_rounds {
            // Bridge engine fragments into chunk events. The forwarder also
            // accumulates what was streamed, so `complete.fullResponse` is
            // exactly the concatenation of the emitted chunks.
            let (frag_tx, mut frag_rx) = mpsc::channel::<String>(32);
            let events = tx.clone();
            let forwarder = tokio::spawn(async move {
                let mut collected = String::new();
                let mut connected = true;
                while let Some(content) = frag_rx.recv().await {
                    collected.push_str(&content);
                    if connected
                        && events.send(StreamEvent::Chunk { content }).await.is_err()
                    {
                        connected = false;
                    }
                }
                (collected, connected)
            });

            let reply = self.engine.generate_stream(&request, frag_tx).await;
            let (streamed, connected) = forwarder.await.unwrap_or_default();
            full_response.push_str(&streamed);

            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Engine failed mid-turn");
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    return;
                }
            };

            if !connected {
                // Abandoned before completion: no tool round is started and
                // nothing is persisted for this turn.
                info!(user_id = %user_id, "Client disconnected; abandoning turn");
                return;
            }

            match reply {
                EngineReply::Answer(_) => {
                    self.finish_stream(user_message, user_id, full_response, &tx)
                        .await;
                    return;
                }
                EngineReply::ToolCalls(calls) => {
                    let results = self.executor.execute_all(&calls, user_id).await;
                    request.rounds.push(ToolRound { calls, results });
                }
            }
        }

        warn!(user_id = %user_id, max_rounds = self.max_rounds, "Round limit reached");
        let degraded = request
            .rounds
            .last()
            .map(render_tool_results)
            .unwrap_or_else(|| "I could not complete that request.".to_string());

        if tx
            .send(StreamEvent::Chunk {
                content: degraded.clone(),
            })
            .await
            .is_err()
        {
            return;
        }
        full_response.push_str(&degraded);

        self.finish_stream(user_message, user_id, full_response, &tx)
            .await;
    }

    /// Emit `complete` and persist exactly once. A failed send means the
    /// client never saw the completed turn, so nothing is persisted.
    async fn finish_stream(
        &self,
        user_message: &str,
        user_id: Uuid,
        full_response: String,
        tx: &mpsc::Sender<StreamEvent>,
    ) {
        let completed = tx
            .send(StreamEvent::Complete {
                full_response: full_response.clone(),
                timestamp: Utc::now(),
            })
            .await
            .is_ok();

        if !completed {
            info!(user_id = %user_id, "Client disconnected before completion");
            return;
        }

        if let Err(e) = self
            .history
            .append(user_id, user_message, &full_response)
            .await
        {
            warn!(user_id = %user_id, error = %e, "Failed to persist completed turn");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use crate::history::InMemoryChatHistoryStore;
    use crate::models::ToolInvocation;
    use crate::store::{InMemoryLedgerStore, LedgerStore};
    use serde_json::json;

    fn fixture(
        replies: Vec<EngineReply>,
    ) -> (Orchestrator, Arc<InMemoryLedgerStore>, Arc<InMemoryChatHistoryStore>, Uuid) {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let history = Arc::new(InMemoryChatHistoryStore::new());
        let orchestrator = Orchestrator::new(
            ContextAssembler::new(ledger.clone()),
            ToolExecutor::new(ledger.clone()),
            Box::new(MockEngine::new(replies)),
            history.clone(),
        );
        (orchestrator, ledger, history, Uuid::new_v4())
    }

    async fn collect_events(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn direct_answer_is_persisted() {
        let (orchestrator, _, history, user_id) =
            fixture(vec![EngineReply::Answer("You spent $45 this month.".into())]);

        let answer = orchestrator
            .respond("how much did I spend?", user_id)
            .await
            .unwrap();
        assert_eq!(answer, "You spent $45 this month.");

        let page = history.list(user_id, 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].assistant_response, answer);
    }

    #[tokio::test]
    async fn tool_round_feeds_back_into_final_answer() {
        let (orchestrator, ledger, history, user_id) = fixture(vec![
            EngineReply::ToolCalls(vec![ToolInvocation {
                name: "create_budget_with_category".into(),
                arguments: json!({"category_name": "Dining", "amount": 300.0}),
            }]),
            EngineReply::Answer("Done: Dining budget of $300/month.".into()),
        ]);

        let answer = orchestrator
            .respond("set up a $300 dining budget", user_id)
            .await
            .unwrap();
        assert!(answer.contains("Dining"));

        // The mutation actually happened before the answer was persisted.
        assert_eq!(ledger.list_budgets(user_id).await.unwrap().len(), 1);
        assert_eq!(history.list(user_id, 1, 10).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn empty_message_is_rejected_without_persistence() {
        let (orchestrator, _, history, user_id) = fixture(vec![]);

        let result = orchestrator.respond("   ", user_id).await;
        assert!(matches!(result, Err(AssistantError::Validation(_))));
        assert_eq!(history.list(user_id, 1, 10).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn round_limit_degrades_to_tool_results() {
        let tool_call = || {
            EngineReply::ToolCalls(vec![ToolInvocation {
                name: "get_budgets".into(),
                arguments: json!({}),
            }])
        };
        let (orchestrator, _, history, user_id) =
            fixture(vec![tool_call(), tool_call(), tool_call()]);
        let orchestrator = orchestrator.with_max_rounds(2);

        let answer = orchestrator.respond("loop forever", user_id).await.unwrap();
        assert!(answer.contains("budget"));
        assert_eq!(history.list(user_id, 1, 10).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn engine_failure_is_not_persisted() {
        let (orchestrator, _, history, user_id) = fixture(vec![]);

        let result = orchestrator.respond("hello", user_id).await;
        assert!(matches!(result, Err(AssistantError::Upstream(_))));
        assert_eq!(history.list(user_id, 1, 10).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn stream_chunks_concatenate_to_full_response() {
        let (orchestrator, _, history, user_id) = fixture(vec![
            EngineReply::ToolCalls(vec![ToolInvocation {
                name: "get_spending_analysis".into(),
                arguments: json!({}),
            }]),
            EngineReply::Answer("You have spent $0.00 so far.".into()),
        ]);

        let (tx, rx) = mpsc::channel(64);
        orchestrator.respond_stream("spending?", user_id, tx).await;
        let events = collect_events(rx).await;

        assert!(matches!(events.first(), Some(StreamEvent::Connected)));

        let mut concatenated = String::new();
        let mut full = None;
        for event in &events {
            match event {
                StreamEvent::Chunk { content } => concatenated.push_str(content),
                StreamEvent::Complete { full_response, .. } => {
                    full = Some(full_response.clone())
                }
                _ => {}
            }
        }
        assert!(matches!(events.last(), Some(StreamEvent::Complete { .. })));
        assert_eq!(Some(concatenated.clone()), full);

        let page = history.list(user_id, 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].assistant_response, concatenated);
    }

    #[tokio::test]
    async fn abandoned_stream_is_not_persisted() {
        let (orchestrator, _, history, user_id) =
            fixture(vec![EngineReply::Answer("a fairly long answer here".into())]);

        // Client consumes only the connection sentinel, then goes away.
        let (tx, mut rx) = mpsc::channel(1);
        let consumer = tokio::spawn(async move {
            let first = rx.recv().await;
            drop(rx);
            first
        });

        orchestrator.respond_stream("hello", user_id, tx).await;
        let first = consumer.await.unwrap();
        assert!(matches!(first, Some(StreamEvent::Connected)));

        assert_eq!(history.list(user_id, 1, 10).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn stream_error_event_on_engine_failure() {
        let (orchestrator, _, history, user_id) = fixture(vec![]);

        let (tx, rx) = mpsc::channel(16);
        orchestrator.respond_stream("hello", user_id, tx).await;
        let events = collect_events(rx).await;

        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
        assert_eq!(history.list(user_id, 1, 10).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn concurrent_users_do_not_share_turns() {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let history = Arc::new(InMemoryChatHistoryStore::new());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let make = |answer: &str| {
            Orchestrator::new(
                ContextAssembler::new(ledger.clone()),
                ToolExecutor::new(ledger.clone()),
                Box::new(MockEngine::new(vec![EngineReply::Answer(answer.into())])),
                history.clone(),
            )
        };
        let for_alice = make("hi alice");
        let for_bob = make("hi bob");

        let (a, b) = tokio::join!(
            for_alice.respond("hello", alice),
            for_bob.respond("hello", bob)
        );
        a.unwrap();
        b.unwrap();

        let alices = history.list(alice, 1, 10).await.unwrap();
        let bobs = history.list(bob, 1, 10).await.unwrap();
        assert_eq!(alices.total, 1);
        assert_eq!(bobs.total, 1);
        assert_eq!(alices.items[0].assistant_response, "hi alice");
        assert_eq!(bobs.items[0].assistant_response, "hi bob");
    }

    #[test]
    fn stream_events_serialize_with_wire_tags() {
        let chunk = serde_json::to_value(StreamEvent::Chunk {
            content: "hi".into(),
        })
        .unwrap();
        assert_eq!(chunk["type"], "chunk");
        assert_eq!(chunk["content"], "hi");

        let complete = serde_json::to_value(StreamEvent::Complete {
            full_response: "hi there".into(),
            timestamp: Utc::now(),
        })
        .unwrap();
        assert_eq!(complete["type"], "complete");
        assert_eq!(complete["fullResponse"], "hi there");
    }
}
