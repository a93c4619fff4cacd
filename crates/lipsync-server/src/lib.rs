//! # lipsync-server
//!
//! Axum front end for the lipsync pipeline:
//!
//! - `/ws/lipsync` (alias `/ws`): one [`session`] per connection, one request
//!   at a time, progress frames then exactly one terminal frame
//! - `/health` and `/metrics`
//! - Connection cap, heartbeats and graceful [`shutdown`]

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::ServerConfig;
pub use registry::{Lifecycle, SessionHandle, SessionRegistry, SessionState};
pub use server::{AppState, ServerHandle, build_router, start};
pub use session::{SessionError, SessionOrchestrator};
pub use shutdown::ShutdownCoordinator;
