//! Timeout defaults and async timeout helpers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Bound on connect plus handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound silence after which a reliable channel is closed
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound silence after which a keepalive ping is written
pub const WRITE_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifetime of an issued association token
pub const TOKEN_TTL: Duration = Duration::from_secs(30);

/// Default period of the client reconnect driver
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Interval at which a client repeats its association token until established
pub const TOKEN_RESEND_INTERVAL: Duration = Duration::from_millis(250);

/// Pause before a failed UDP receive loop retries
pub const RECV_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Run `fut`, mapping an elapsed deadline to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_protocol_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        };
        let result = with_timeout_error(slow, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let failing = async { Err::<(), _>(ProtocolError::ConnectionClosed) };
        let result = with_timeout_error(failing, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }
}
