use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::MarketTuning;
use crate::error::Result;

/// Bounded exponential backoff with random jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Total tries, including the first one
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_tuning(t: &MarketTuning) -> Self {
        Backoff {
            attempts: t.retry_attempts.max(1),
            base: Duration::from_millis(t.retry_base_ms),
            max: Duration::from_millis(t.retry_max_ms),
        }
    }

    /// Delay before retry number `retry` (0-based), before jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// `base_delay` plus up to 50% random jitter
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let jitter_ms = (base.as_millis() as u64) / 2;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Run `op` until it succeeds or the attempts are used up.
pub async fn retry_async<T, F, Fut>(backoff: &Backoff, label: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if retry + 1 < backoff.attempts => {
                let delay = backoff.delay(retry);
                warn!("{} failed (attempt {}/{}): {}; retrying in {:?}", label, retry + 1, backoff.attempts, e, delay);
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run a storage step, retrying only busy/locked database failures.
pub fn retry_sync<T, F>(backoff: &Backoff, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut retry = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && retry + 1 < backoff.attempts => {
                let delay = backoff.delay(retry);
                warn!("{} hit a busy database (attempt {}/{}); retrying in {:?}", label, retry + 1, backoff.attempts, delay);
                std::thread::sleep(delay);
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::cell::Cell;

    fn quick() -> Backoff {
        Backoff {
            attempts: 3,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    #[test]
    fn base_delay_doubles_and_caps() {
        let b = Backoff {
            attempts: 5,
            base: Duration::from_millis(500),
            max: Duration::from_millis(8_000),
        };
        assert_eq!(b.base_delay(0), Duration::from_millis(500));
        assert_eq!(b.base_delay(1), Duration::from_millis(1_000));
        assert_eq!(b.base_delay(3), Duration::from_millis(4_000));
        assert_eq!(b.base_delay(10), Duration::from_millis(8_000));
        let d = b.delay(1);
        assert!(d >= Duration::from_millis(1_000) && d <= Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn async_retry_gives_up_after_attempts() {
        let calls = Cell::new(0);
        let res: anyhow::Result<()> = retry_async(&quick(), "feed", || {
            calls.set(calls.get() + 1);
            async { Err(anyhow::anyhow!("boom")) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn async_retry_returns_first_success() {
        let calls = Cell::new(0);
        let res = retry_async(&quick(), "feed", || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 2 {
                    Err(anyhow::anyhow!("flaky"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(res, 2);
    }

    #[test]
    fn sync_retry_skips_non_transient_errors() {
        let calls = Cell::new(0);
        let res: Result<()> = retry_sync(&quick(), "store", || {
            calls.set(calls.get() + 1);
            Err(PipelineError::MissingReason)
        });
        assert!(res.is_err());
        assert_eq!(calls.get(), 1);
    }
}
