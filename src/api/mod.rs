//! HTTP trigger surface.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Liveness and queue depth
//! - `POST /api/runs` - Queue a run for a requirement (202 + run id)
//! - `GET /api/runs` - List runs, newest first
//! - `GET /api/runs/{id}` - Full run report
//! - `POST /webhook/linear` - Tracker issue events
//! - `POST /webhook/github` - Comment triggers

mod queue;
mod routes;
pub mod types;
mod webhooks;

pub use queue::{spawn_consumer, QueueError, RunQueue};
pub use routes::{router, serve, AppState};
pub use types::*;
