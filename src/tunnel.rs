use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::debug;

use crate::error::is_expected_error;

/// Copies bytes both ways between `client` and `origin` without looking at
/// them, until both directions have closed or `limit` elapses.
///
/// Returns `(client_to_origin, origin_to_client)` byte counts. Normal
/// disconnects are not errors; whatever was relayed before them is counted
/// as zero since `copy_bidirectional` does not report partial totals.
pub async fn splice<A, B>(
    client: &mut A,
    origin: &mut B,
    limit: Option<Duration>,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let copy_result = match limit {
        Some(timeout_duration) => {
            timeout(
                timeout_duration,
                tokio::io::copy_bidirectional(client, origin),
            )
            .await
        }
        None => Ok(tokio::io::copy_bidirectional(client, origin).await),
    };

    match copy_result {
        Ok(Ok(counts)) => Ok(counts),
        Ok(Err(e)) if is_expected_error(&e) => Ok((0, 0)),
        Ok(Err(e)) => {
            debug!("Copy error: {}", e);
            Err(e)
        }
        Err(_) => {
            debug!("Tunnel time limit reached");
            Ok((0, 0))
        }
    }
}
