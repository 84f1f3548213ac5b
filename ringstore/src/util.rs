//! Small helpers shared across the codebase.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Current wall-clock time in nanoseconds since the epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Run `f` until it succeeds or the token is cancelled, sleeping
/// `interval` between attempts.
pub async fn retry_forever<F, Fut, E>(
    ctx: &CancellationToken,
    name: &str,
    interval: Duration,
    mut f: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    loop {
        if ctx.is_cancelled() {
            return;
        }

        match f().await {
            Ok(()) => return,
            Err(err) => {
                if ctx.is_cancelled() {
                    return;
                }
                warn!("{}: {}, retrying in {:?}", name, err, interval);
            }
        }

        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = sleep(interval) => (),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retry_until_success() {
        let ctx = CancellationToken::new();
        let attempts = AtomicUsize::new(0);

        retry_forever(&ctx, "test", Duration::from_millis(5), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err("not yet")
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_stops_on_cancel() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let attempts = AtomicUsize::new(0);

        retry_forever(&ctx, "test", Duration::from_millis(5), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("never") }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn now_ns_advances() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
