use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::types::{Result, WalletError};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub timeout: Duration,
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter_ms: 250,
        }
    }
}

pub async fn retry_with_timeout<T, F, Fut>(
    label: &'static str,
    config: &RetryConfig,
    mut action: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempts = config.max_retries.saturating_add(1);
    for attempt in 0..attempts {
        match timeout(config.timeout, action()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                if attempt + 1 >= attempts {
                    return Err(err);
                }
                warn!(attempt = attempt + 1, %err, "wallet RPC error on {label}; retrying");
            }
            Err(_) => {
                if attempt + 1 >= attempts {
                    return Err(WalletError::Timeout(label));
                }
                warn!(attempt = attempt + 1, "wallet RPC timeout on {label}; retrying");
            }
        }

        let backoff = config
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt as u32));
        let capped = std::cmp::min(backoff, config.max_delay);
        let jitter = if config.jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=config.jitter_ms))
        };
        sleep(capped + jitter).await;
    }

    Err(WalletError::Timeout(label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_until_success() {
        let config = RetryConfig {
            timeout: Duration::from_millis(50),
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter_ms: 0,
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result = retry_with_timeout("test", &config, move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) + 1 < 3 {
                    Err(anyhow::anyhow!("transient").into())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_retries_on_timeout() {
        let config = RetryConfig {
            timeout: Duration::from_millis(5),
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            jitter_ms: 0,
        };
        let result = retry_with_timeout("stall", &config, || async {
            sleep(Duration::from_millis(50)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(WalletError::Timeout("stall"))));
    }
}
