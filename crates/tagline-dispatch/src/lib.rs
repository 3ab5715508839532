#![forbid(unsafe_code)]
//! tagline-dispatch library.
//!
//! Consumes decoded ticket states from `tagline-core` and keeps forwarded
//! copies, control buttons, and discussion notes in sync across destination
//! channels, behind narrow gateway/store/directory interfaces.
//!
//! # Conventions
//!
//! - **Errors**: engine operations return [`DispatchError`]; the store trait
//!   uses `anyhow::Result`.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod controls;
pub mod engine;
pub mod gateway;
pub mod retry;
pub mod store;

pub use controls::{CallbackAction, ControlButton, render_controls};
pub use engine::{DispatchEngine, DispatchError};
pub use gateway::{GatewayError, GatewayResult, MessagingGateway};
pub use retry::RetryPolicy;
pub use store::{CopiedMessageRef, JsonFileStore, MemoryStore, MessageRef, RoutingTable, TicketStore};
