#![forbid(unsafe_code)]
//! tagline-core library.
//!
//! Decodes ticket state out of tag tokens embedded in chat-channel messages
//! and re-encodes the canonical tag region, preserving UTF-16 annotation
//! offsets throughout.
//!
//! # Conventions
//!
//! - **Errors**: codec operations return [`CodecError`]; config and other
//!   fallible I/O use `anyhow::Result`.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod codec;
pub mod config;
pub mod directory;
pub mod entity;
pub mod error;
pub mod grammar;
pub mod ticket;

pub use codec::{DecodeContext, DecodeOptions, decode, decorate, dedup_matching_tags, encode, insert_tags};
pub use entity::{Annotation, AnnotationKind, RichText};
pub use error::{CodecError, ErrorCode};
pub use ticket::{Priority, Scheduled, Status, TicketState};
