//! Bounded retry with exponential backoff + jitter, used on the
//! serving-runtime commit path (reload and traffic-reset calls).

use rand::{thread_rng, Rng};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: 0.25,
        }
    }
}

pub async fn retry_async<F, Fut, T, E>(cfg: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries => return Err(e),
            Err(e) => {
                let exp = cfg.base_delay.mul_f64(2f64.powi(attempt as i32));
                let mut delay = std::cmp::min(exp, cfg.max_delay);
                if cfg.jitter > 0.0 {
                    let jitter_ms = (delay.as_millis() as f64 * cfg.jitter) as u64;
                    if jitter_ms > 0 {
                        let offset: i64 =
                            thread_rng().gen_range(-(jitter_ms as i64)..(jitter_ms as i64 + 1));
                        let base_ms = delay.as_millis() as i64 + offset;
                        delay = Duration::from_millis(base_ms.max(0) as u64);
                    }
                }
                debug!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn eventual_success_within_budget() {
        let cfg = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        };
        let mut attempts = 0;
        let res: Result<usize, &str> = retry_async(&cfg, |_i| {
            attempts += 1;
            async move { if attempts < 3 { Err("reload failed") } else { Ok(7) } }
        })
        .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error() {
        let cfg = RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: 0.0,
        };
        let mut attempts = 0;
        let res: Result<(), &str> = retry_async(&cfg, |_i| {
            attempts += 1;
            async move { Err("still down") }
        })
        .await;
        assert_eq!(res.unwrap_err(), "still down");
        assert_eq!(attempts, 3); // initial try + 2 retries
    }
}
