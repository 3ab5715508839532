//! Messaging gateway interface.
//!
//! The engine never talks to the chat platform directly; everything goes
//! through this trait so tests can substitute a recording mock and the
//! binary can plug in the real client.

use std::time::Duration;

use tagline_core::entity::RichText;

use crate::controls::ControlButton;

/// Failures a gateway call can surface.
///
/// `RateLimited` is transient and handled by the retry combinator;
/// `ContentUnchanged` and `NotFound` are success conditions at specific
/// call sites (see `retry::ok_if_unchanged` / `retry::ok_if_missing`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("edit produced identical content")]
    ContentUnchanged,
    #[error("message not found")]
    NotFound,
    #[error("gateway transport failure: {0}")]
    Transport(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Outbound operations against the chat platform. Message ids are the
/// platform's numeric per-channel ids.
pub trait MessagingGateway: Send + Sync {
    /// Post a new message; returns its id in `channel`.
    fn send_message(&self, channel: &str, content: &RichText) -> GatewayResult<i64>;

    fn edit_message_content(
        &self,
        channel: &str,
        message_id: i64,
        content: &RichText,
    ) -> GatewayResult<()>;

    fn edit_message_controls(
        &self,
        channel: &str,
        message_id: i64,
        controls: &[Vec<ControlButton>],
    ) -> GatewayResult<()>;

    /// Copy an existing message into another channel; returns the copy's id.
    fn copy_message(&self, channel: &str, message_id: i64, to_channel: &str) -> GatewayResult<i64>;

    fn delete_message(&self, channel: &str, message_id: i64) -> GatewayResult<()>;
}

impl<G: MessagingGateway + ?Sized> MessagingGateway for std::sync::Arc<G> {
    fn send_message(&self, channel: &str, content: &RichText) -> GatewayResult<i64> {
        (**self).send_message(channel, content)
    }

    fn edit_message_content(
        &self,
        channel: &str,
        message_id: i64,
        content: &RichText,
    ) -> GatewayResult<()> {
        (**self).edit_message_content(channel, message_id, content)
    }

    fn edit_message_controls(
        &self,
        channel: &str,
        message_id: i64,
        controls: &[Vec<ControlButton>],
    ) -> GatewayResult<()> {
        (**self).edit_message_controls(channel, message_id, controls)
    }

    fn copy_message(&self, channel: &str, message_id: i64, to_channel: &str) -> GatewayResult<i64> {
        (**self).copy_message(channel, message_id, to_channel)
    }

    fn delete_message(&self, channel: &str, message_id: i64) -> GatewayResult<()> {
        (**self).delete_message(channel, message_id)
    }
}
