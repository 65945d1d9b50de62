use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, prelude::*};

/// Installs the global subscriber: stdout plus a daily rolling file under `log_dir`.
///
/// `RUST_LOG` wins over `default_directive` when it is set.
pub fn init_tracing(log_dir: &str, default_directive: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = rolling::daily(log_dir, "log");

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stdout);

    // no ANSI escapes in the file
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard // keep it alive in main
}

/// Upper bound of the failure backoff, as a multiple of `delay`.
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Runs `task` every `delay` until the handle is aborted.
///
/// Consecutive failures double the wait up to `MAX_BACKOFF_FACTOR * delay`;
/// one success brings it back to `delay`.
pub fn spawn_with_retry<Fut, F>(name: &'static str, task: F, delay: Duration) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut factor = 0;
        loop {
            let result = task().await;
            factor = next_backoff(factor, result.is_err());
            if let Err(e) = result {
                tracing::warn!("{name} failed, next attempt in {:?}: {e:?}", delay * factor);
            }
            sleep(delay * factor).await;
        }
    })
}

fn next_backoff(factor: u32, failed: bool) -> u32 {
    if failed {
        (factor * 2).clamp(1, MAX_BACKOFF_FACTOR)
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_doubles_then_resets() {
        let mut factor = 0;
        let mut waits = Vec::new();
        for failed in [true, true, true, true, true, false, true] {
            factor = next_backoff(factor, failed);
            waits.push(factor);
        }
        assert_eq!(waits, vec![1, 2, 4, 8, 8, 1, 2]);
    }

    #[tokio::test]
    async fn test_spawn_with_retry_keeps_running_after_errors() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = spawn_with_retry(
            "flaky",
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n % 2 == 0 {
                        anyhow::bail!("failing run {n}");
                    }
                    Ok(())
                }
            },
            Duration::from_millis(1),
        );

        while runs.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        handle.abort();
        assert!(runs.load(Ordering::SeqCst) >= 4);
    }
}
