//! Uniform rate-limit retry around gateway calls.
//!
//! Every outbound call goes through [`with_retry`] instead of handling
//! `RateLimited` ad hoc at each site. Rate limits are retried indefinitely;
//! the per-ticket lock bounds how long a pass can stall.

use std::thread;
use std::time::Duration;

use tracing::warn;

use tagline_core::config::ChannelConfig;

use crate::gateway::{GatewayError, GatewayResult};

/// Delay bounds for rate-limit sleeps.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn from_config(config: &ChannelConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Server-requested delay floored at the base delay and capped at the
    /// maximum, so a zero `retry-after` never busy-loops.
    #[must_use]
    pub fn delay_for(&self, retry_after: Duration) -> Duration {
        retry_after.max(self.base_delay).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ChannelConfig::default())
    }
}

/// Run `call`, sleeping and retrying on `RateLimited` until it returns
/// anything else.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: impl FnMut() -> GatewayResult<T>,
) -> GatewayResult<T> {
    loop {
        match call() {
            Err(GatewayError::RateLimited { retry_after }) => {
                let delay = policy.delay_for(retry_after);
                warn!(operation, ?delay, "gateway rate limited; retrying");
                thread::sleep(delay);
            }
            other => return other,
        }
    }
}

/// An edit that changed nothing is a successful no-op.
pub fn ok_if_unchanged(result: GatewayResult<()>) -> GatewayResult<()> {
    match result {
        Err(GatewayError::ContentUnchanged) => Ok(()),
        other => other,
    }
}

/// Deleting an already-deleted message is a successful no-op.
pub fn ok_if_missing(result: GatewayResult<()>) -> GatewayResult<()> {
    match result {
        Err(GatewayError::NotFound) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn instant_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn retries_until_rate_limit_clears() {
        let attempts = Cell::new(0);
        let result = with_retry(&instant_policy(), "send_message", || {
            attempts.set(attempts.get() + 1);
            if attempts.get() < 3 {
                Err(GatewayError::RateLimited {
                    retry_after: Duration::ZERO,
                })
            } else {
                Ok(42)
            }
        });
        assert_eq!(result, Ok(42));
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn non_rate_limit_errors_pass_through() {
        let result: GatewayResult<()> = with_retry(&instant_policy(), "delete_message", || {
            Err(GatewayError::NotFound)
        });
        assert_eq!(result, Err(GatewayError::NotFound));
    }

    #[test]
    fn delay_is_floored_and_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(2_000),
        };
        assert_eq!(
            policy.delay_for(Duration::ZERO),
            Duration::from_millis(500)
        );
        assert_eq!(
            policy.delay_for(Duration::from_millis(700)),
            Duration::from_millis(700)
        );
        assert_eq!(
            policy.delay_for(Duration::from_secs(60)),
            Duration::from_millis(2_000)
        );
    }

    #[test]
    fn unchanged_and_missing_are_no_ops() {
        assert_eq!(
            ok_if_unchanged(Err(GatewayError::ContentUnchanged)),
            Ok(())
        );
        assert_eq!(ok_if_missing(Err(GatewayError::NotFound)), Ok(()));
        assert_eq!(
            ok_if_unchanged(Err(GatewayError::NotFound)),
            Err(GatewayError::NotFound)
        );
    }
}
