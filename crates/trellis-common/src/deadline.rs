//! Per-pass cancellation and deadline
//!
//! Every reconciliation pass gets a [`PassGuard`]. Controllers call
//! [`PassGuard::check`] before each store call; once the controller is
//! shutting down or the pass has run past its deadline, the pass aborts
//! with [`Error::Cancelled`] and writes no partial status.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Cancellation token plus deadline for one reconciliation pass
#[derive(Debug, Clone)]
pub struct PassGuard {
    token: CancellationToken,
    deadline: Instant,
}

impl PassGuard {
    /// Guard that expires `timeout` from now or when `token` is cancelled
    pub fn new(token: CancellationToken, timeout: Duration) -> Self {
        Self {
            token,
            deadline: Instant::now() + timeout,
        }
    }

    /// Fail if the pass should not issue `operation`
    pub fn check(&self, operation: &str) -> Result<(), Error> {
        if self.token.is_cancelled() || Instant::now() >= self.deadline {
            return Err(Error::cancelled(operation));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_guard_allows_operations() {
        let guard = PassGuard::new(CancellationToken::new(), Duration::from_secs(30));
        assert!(guard.check("get broker").is_ok());
    }

    #[tokio::test]
    async fn cancelled_token_aborts_pass() {
        let token = CancellationToken::new();
        let guard = PassGuard::new(token.child_token(), Duration::from_secs(30));
        token.cancel();

        let err = guard.check("create subscription").expect_err("should be cancelled");
        assert!(matches!(err, Error::Cancelled { ref operation } if operation == "create subscription"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_aborts_pass() {
        let guard = PassGuard::new(CancellationToken::new(), Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(guard.check("update status").is_err());
    }
}
