//! Byte pumping between two connected streams

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Pause before accepting again after a failed `accept()`
pub(crate) const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Wait out [`ACCEPT_RETRY_DELAY`] after an accept error.
///
/// Returns `false` if `cancel` fired meanwhile and the accept loop should end.
pub(crate) async fn pause_after_accept_error(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

/// Copy bytes both ways until either side closes or `cancel` fires
pub(crate) async fn bridge<A, B>(mut a: A, mut b: B, cancel: CancellationToken, label: String)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!("{}: closed by session shutdown", label);
        }
        result = tokio::io::copy_bidirectional(&mut a, &mut b) => match result {
            Ok((sent, received)) => {
                tracing::trace!("{}: closed ({} bytes out, {} bytes in)", label, sent, received);
            }
            Err(e) => {
                tracing::debug!("{}: closed with error: {}", label, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bridge_copies_both_ways() {
        let (mut left, left_inner) = tokio::io::duplex(64);
        let (right_inner, mut right) = tokio::io::duplex(64);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge(
            left_inner,
            right_inner,
            cancel.clone(),
            "test".to_string(),
        ));

        left.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        right.write_all(b"pong").await.unwrap();
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_pauses_before_retry() {
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        assert!(pause_after_accept_error(&cancel).await);
        assert!(started.elapsed() >= ACCEPT_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_accept_pause_ends_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let paused = tokio::time::timeout(
            Duration::from_millis(50),
            pause_after_accept_error(&cancel),
        )
        .await
        .unwrap();
        assert!(!paused);
    }
}
