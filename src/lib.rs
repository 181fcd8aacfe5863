//! mouthpiece: streaming client core for an LLM "social advisor".
//!
//! Three features share one incremental-parsing core:
//!
//! - online reply plans ([`plans`], [`PlanMode::Online`]),
//! - offline action scripts ([`plans`], [`PlanMode::Offline`]),
//! - a negotiation game against an AI opponent ([`session`], [`orchestrator`]).
//!
//! Text arrives as OpenAI-style SSE ([`relay`]) through a [`ChatTransport`]
//! ([`client`]). Every parser re-derives its view from the whole accumulated
//! buffer, so results never depend on where the network split the stream.

pub mod bubbles;
pub mod cli;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod levels;
pub mod orchestrator;
pub mod plans;
pub mod prompts;
pub mod providers;
pub mod relay;
pub mod render;
pub mod session;

pub use client::{ChatTransport, LlmClient, StreamHandle};
pub use config::{ArenaMode, Config};
pub use error::{MouthpieceError, Result};
pub use orchestrator::{ArenaCommand, ArenaController, ArenaHandle, ArenaView};
pub use plans::{parse_plans, Plan, PlanMode, PlanStream};
pub use session::{ChatEntry, GameSession, JudgeVerdict, TurnPhase};
