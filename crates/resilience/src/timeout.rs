use std::future::Future;
use std::time::Duration;

use crate::ResilienceError;

/// Bounds `fut` by `after`, reporting expiry as [`ResilienceError::Timeout`].
pub async fn with_timeout<Fut, T, E>(after: Duration, fut: Fut) -> Result<T, ResilienceError<E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result.map_err(ResilienceError::Operation),
        Err(_) => Err(ResilienceError::Timeout { after }),
    }
}
