//! Reasoning engine client
//!
//! Drives Gemini function calling for the assistant. The engine's output is
//! untrusted and nondeterministic; responses are decoded defensively and
//! malformed shapes become `Upstream` errors, never panics.
//!
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::catalog;
use crate::error::AssistantError;
use crate::models::{ConversationTurn, ToolInvocation, ToolResult};
use crate::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Bounded timeout for one engine call, distinct from any HTTP server
/// timeout. On expiry the turn fails with a retryable error.
pub const ENGINE_TIMEOUT: Duration = Duration::from_secs(30);

const GEMINI_BASE_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash";

const SYSTEM_PROMPT: &str = "\
You are a personal-finance assistant. You can read and change the user's \
transactions, budgets, and categories through the provided tools.

Guidelines:
- Use tools for anything that touches the user's data; never invent figures
- Amounts are always non-negative; use the type field for direction
- When a tool fails, relay its message and ask a clarifying follow-up
- Keep answers short and concrete";

//
// ================= Request / reply model =================
//

/// One completed tool round within the current turn.
#[derive(Debug, Clone)]
pub struct ToolRound {
    pub calls: Vec<ToolInvocation>,
    pub results: Vec<ToolResult>,
}

/// Everything the engine sees for one call: grounding context, bounded
/// history, the user message, and the tool rounds so far this turn.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub system_context: String,
    pub history: Vec<ConversationTurn>,
    pub user_message: String,
    pub rounds: Vec<ToolRound>,
}

/// The engine either answers directly or requests tool invocations.
#[derive(Debug, Clone)]
pub enum EngineReply {
    Answer(String),
    ToolCalls(Vec<ToolInvocation>),
}

#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn generate(&self, request: &EngineRequest) -> Result<EngineReply>;

    /// Streaming variant: text fragments are forwarded over `tx` as they are
    /// produced; tool calls only resolve once the stream ends. A failed send
    /// means the consumer is gone; generation still runs to completion.
    async fn generate_stream(
        &self,
        request: &EngineRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<EngineReply>;
}

//
// ================= Gemini wire types =================
//

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    tools: Vec<Value>,
    system_instruction: SystemInstruction,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

//
// ================= Gemini engine =================
//

pub struct GeminiEngine {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiEngine {
    pub fn new(api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(ENGINE_TIMEOUT)
            .build()
            .map_err(|e| AssistantError::Upstream(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn build_body(&self, request: &EngineRequest) -> GeminiRequest {
        let mut contents = Vec::new();

        for turn in &request.history {
            contents.push(Content {
                role: "user".to_string(),
                parts: vec![Part {
                    text: Some(turn.user_message.clone()),
                    ..Default::default()
                }],
            });
            contents.push(Content {
                role: "model".to_string(),
                parts: vec![Part {
                    text: Some(turn.assistant_response.clone()),
                    ..Default::default()
                }],
            });
        }

        contents.push(Content {
            role: "user".to_string(),
            parts: vec![Part {
                text: Some(request.user_message.clone()),
                ..Default::default()
            }],
        });

        // Replay this turn's tool rounds so the engine sees its own calls
        // and their results.
        for round in &request.rounds {
            contents.push(Content {
                role: "model".to_string(),
                parts: round
                    .calls
                    .iter()
                    .map(|call| Part {
                        function_call: Some(FunctionCall {
                            name: call.name.clone(),
                            args: call.arguments.clone(),
                        }),
                        ..Default::default()
                    })
                    .collect(),
            });
            contents.push(Content {
                role: "user".to_string(),
                parts: round
                    .calls
                    .iter()
                    .zip(&round.results)
                    .map(|(call, result)| Part {
                        function_response: Some(FunctionResponse {
                            name: call.name.clone(),
                            response: serde_json::to_value(result).unwrap_or_else(|_| json!({})),
                        }),
                        ..Default::default()
                    })
                    .collect(),
            });
        }

        let system = format!("{}\n\n{}", SYSTEM_PROMPT, request.system_context);

        GeminiRequest {
            contents,
            tools: vec![json!({ "functionDeclarations": catalog::to_function_declarations() })],
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: Some(system),
                    ..Default::default()
                }],
            },
            generation_config: GenerationConfig {
                temperature: 0.3,
                max_output_tokens: 1024,
            },
        }
    }

    fn reply_from_parts(text: String, calls: Vec<ToolInvocation>) -> Result<EngineReply> {
        if !calls.is_empty() {
            return Ok(EngineReply::ToolCalls(calls));
        }
        if text.is_empty() {
            return Err(AssistantError::Upstream(
                "Empty response from reasoning engine".to_string(),
            ));
        }
        Ok(EngineReply::Answer(text))
    }

    fn collect_parts(response: &GeminiResponse) -> (String, Vec<ToolInvocation>) {
        let mut text = String::new();
        let mut calls = Vec::new();

        if let Some(content) = response.candidates.first().and_then(|c| c.content.as_ref()) {
            for part in &content.parts {
                if let Some(ref fragment) = part.text {
                    text.push_str(fragment);
                }
                if let Some(ref call) = part.function_call {
                    calls.push(ToolInvocation {
                        name: call.name.clone(),
                        arguments: call.args.clone(),
                    });
                }
            }
        }

        (text, calls)
    }
}

#[async_trait]
impl ReasoningEngine for GeminiEngine {
    async fn generate(&self, request: &EngineRequest) -> Result<EngineReply> {
        if self.api_key.is_empty() {
            return Err(AssistantError::Upstream(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}:generateContent?key={}", self.base_url, self.api_key);
        let body = self.build_body(request);

        debug!(rounds = request.rounds.len(), "Calling reasoning engine");

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            error!("Engine request failed: {}", e);
            AssistantError::Upstream(format!("Reasoning engine unreachable: {}", e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            error!(%status, "Engine error response: {}", detail);
            return Err(AssistantError::Upstream(format!(
                "Reasoning engine returned {}",
                status
            )));
        }

        let decoded: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse engine response: {}", e);
            AssistantError::Upstream(format!("Malformed engine response: {}", e))
        })?;

        let (text, calls) = Self::collect_parts(&decoded);
        Self::reply_from_parts(text, calls)
    }

    async fn generate_stream(
        &self,
        request: &EngineRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<EngineReply> {
        if self.api_key.is_empty() {
            return Err(AssistantError::Upstream(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!(
            "{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.api_key
        );
        let body = self.build_body(request);

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            AssistantError::Upstream(format!("Reasoning engine unreachable: {}", e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(AssistantError::Upstream(format!(
                "Reasoning engine returned {}",
                status
            )));
        }

        let mut text = String::new();
        let mut calls: Vec<ToolInvocation> = Vec::new();
        let mut consumer_gone = false;
        let mut buffer = String::new();

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                AssistantError::Upstream(format!("Engine stream interrupted: {}", e))
            })?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE frames are newline-delimited `data: {json}` lines.
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                let Some(payload) = line.strip_prefix("data: ") else {
                    continue;
                };
                if payload == "[DONE]" {
                    continue;
                }

                let decoded: GeminiResponse = match serde_json::from_str(payload) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("Skipping malformed stream frame: {}", e);
                        continue;
                    }
                };

                let (fragment, mut frame_calls) = Self::collect_parts(&decoded);
                if !fragment.is_empty() {
                    text.push_str(&fragment);
                    if !consumer_gone && tx.send(fragment).await.is_err() {
                        consumer_gone = true;
                    }
                }
                calls.append(&mut frame_calls);
            }
        }

        Self::reply_from_parts(text, calls)
    }
}

//
// ================= Mock engine =================
//

/// Scripted engine for tests and the offline demo.
pub struct MockEngine {
    replies: tokio::sync::Mutex<std::collections::VecDeque<EngineReply>>,
}

impl MockEngine {
    pub fn new(replies: Vec<EngineReply>) -> Self {
        Self {
            replies: tokio::sync::Mutex::new(replies.into()),
        }
    }

    async fn next_reply(&self) -> Result<EngineReply> {
        let mut replies = self.replies.lock().await;
        replies.pop_front().ok_or_else(|| {
            AssistantError::Upstream("Mock engine has no reply scripted".to_string())
        })
    }
}

#[async_trait]
impl ReasoningEngine for MockEngine {
    async fn generate(&self, _request: &EngineRequest) -> Result<EngineReply> {
        self.next_reply().await
    }

    async fn generate_stream(
        &self,
        _request: &EngineRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<EngineReply> {
        let reply = self.next_reply().await?;

        if let EngineReply::Answer(ref answer) = reply {
            // Deliver the answer in word-sized fragments, like a real stream.
            for word in answer.split_inclusive(' ') {
                if tx.send(word.to_string()).await.is_err() {
                    break;
                }
            }
        }

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_replays_tool_rounds() {
        let engine = GeminiEngine::new("test-key".to_string())
            .unwrap()
            .with_base_url("http://localhost:0".to_string());

        let request = EngineRequest {
            system_context: "## Current financial state".to_string(),
            history: vec![],
            user_message: "How much did I spend?".to_string(),
            rounds: vec![ToolRound {
                calls: vec![ToolInvocation {
                    name: "get_spending_analysis".to_string(),
                    arguments: json!({}),
                }],
                results: vec![ToolResult::ok("Spent $45.00", json!({"total": 45.0}))],
            }],
        };

        let body = engine.build_body(&request);
        // user message + model functionCall + user functionResponse
        assert_eq!(body.contents.len(), 3);
        assert_eq!(body.contents[1].role, "model");
        assert!(body.contents[1].parts[0].function_call.is_some());
        assert!(body.contents[2].parts[0].function_response.is_some());

        let serialized = serde_json::to_value(&body).unwrap();
        assert_eq!(
            serialized["contents"][1]["parts"][0]["functionCall"]["name"],
            "get_spending_analysis"
        );
    }

    #[test]
    fn function_call_parts_win_over_text() {
        let decoded: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "Let me check."},
                        {"functionCall": {"name": "get_budgets", "args": {}}}
                    ]
                }
            }]
        }))
        .unwrap();

        let (text, calls) = GeminiEngine::collect_parts(&decoded);
        let reply = GeminiEngine::reply_from_parts(text, calls).unwrap();
        match reply {
            EngineReply::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].name, "get_budgets");
            }
            EngineReply::Answer(_) => panic!("expected tool calls"),
        }
    }

    #[test]
    fn malformed_response_is_upstream_error() {
        let decoded: GeminiResponse = serde_json::from_value(json!({
            "candidates": []
        }))
        .unwrap();

        let (text, calls) = GeminiEngine::collect_parts(&decoded);
        let result = GeminiEngine::reply_from_parts(text, calls);
        assert!(matches!(result, Err(AssistantError::Upstream(_))));
    }

    #[tokio::test]
    async fn mock_streams_answer_fragments() {
        let engine = MockEngine::new(vec![EngineReply::Answer("hello streaming world".into())]);
        let (tx, mut rx) = mpsc::channel(16);

        let request = EngineRequest {
            system_context: String::new(),
            history: vec![],
            user_message: "hi".into(),
            rounds: vec![],
        };

        let reply = engine.generate_stream(&request, tx).await.unwrap();
        drop(engine);

        let mut collected = String::new();
        while let Some(fragment) = rx.recv().await {
            collected.push_str(&fragment);
        }

        assert_eq!(collected, "hello streaming world");
        assert!(matches!(reply, EngineReply::Answer(_)));
    }
}
