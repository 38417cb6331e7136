//! Finance Assistant
//!
//! Personal-finance backend centered on a conversational assistant that can
//! read and mutate the user's financial data through a fixed set of
//! schema-described tools:
//! - A static tool catalog the reasoning engine sees every turn
//! - A tool executor that validates, resolves names to ids, and never
//!   lets a failed call abort the conversation
//! - A per-turn financial context snapshot grounding the engine
//! - An orchestrator driving bounded tool rounds, single-shot or streamed
//!
//! TURN: MESSAGE → CONTEXT → ENGINE ⇄ TOOLS → ANSWER → PERSIST

pub mod api;
pub mod catalog;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod history;
pub mod models;
pub mod orchestrator;
pub mod store;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use orchestrator::{Orchestrator, StreamEvent};
