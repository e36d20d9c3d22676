//! # devcrew
//!
//! Orchestrator that turns a natural-language requirement into a reviewed
//! pull request using a crew of role agents.
//!
//! ## Run Flow
//!
//! ```text
//!  requirement ─► PM (decompose) ─► TaskPlan
//!                                      │
//!             ┌────────────────────────┼────────────────────────┐
//!             ▼                        ▼                        ▼
//!         Database ─────────────►  Backend  ─────────────►  Frontend
//!             └────────────────────────┼────────────────────────┘
//!                                      ▼
//!                          aggregate ChangeSet ─► Reviewer
//!                                      │
//!                                      ▼
//!                      branch + commit + pull request ─► tracker status
//! ```
//!
//! ## Modules
//! - `agents`: roles, capabilities and the agent conversations
//! - `orchestrator`: run lifecycle, dispatch and publication
//! - `task`, `run`: the data model and its state machines
//! - `llm`, `repo`, `tracker`: external collaborators behind traits
//! - `api`: HTTP trigger surface and work queue
//! - `retry`: backoff policy shared by every external call

pub mod agents;
pub mod api;
pub mod config;
pub mod llm;
pub mod orchestrator;
pub mod repo;
pub mod retry;
pub mod run;
pub mod task;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use orchestrator::Orchestrator;
pub use run::{Run, RunRequest, RunState};
