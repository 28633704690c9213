//! Bootstrap utilities for courier binaries.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};

/// Initialize tracing with the COURIER_LOG environment variable.
///
/// Defaults to "info" level if COURIER_LOG is not set. `COURIER_LOG_FORMAT=json`
/// switches to one JSON object per line.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json_logs() {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn json_logs() -> bool {
    std::env::var(LOG_FORMAT_ENV_VAR)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Config file path from `--config <path>` or `-c <path>` on the command line.
pub fn parse_config_path() -> Option<String> {
    config_path_from(std::env::args().skip(1))
}

fn config_path_from(mut args: impl Iterator<Item = String>) -> Option<String> {
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Run `connect` with exponential backoff until it succeeds or retries run out.
///
/// Returns the last error after `max_retries` attempts.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    max_retries: u32,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    const INITIAL_DELAY: Duration = Duration::from_millis(100);
    const MAX_DELAY: Duration = Duration::from_secs(5);

    let max_retries = max_retries.max(1);
    let mut delay = INITIAL_DELAY;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match connect().await {
            Ok(client) => {
                info!(service = service_name, attempt, "Connected");
                return Ok(client);
            }
            Err(e) if attempt < max_retries => {
                warn!(
                    service = service_name,
                    attempt,
                    max_retries,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, MAX_DELAY);
            }
            Err(e) => {
                error!(service = service_name, attempts = max_retries, error = %e, "Giving up connecting");
                return Err(e);
            }
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_config_path_from_args() {
        assert_eq!(config_path_from(args(&["--config", "relay.yaml"])).as_deref(), Some("relay.yaml"));
        assert_eq!(config_path_from(args(&["-v", "-c", "a.yaml"])).as_deref(), Some("a.yaml"));
        assert_eq!(config_path_from(args(&["--config=b.yaml"])).as_deref(), Some("b.yaml"));
        assert_eq!(config_path_from(args(&["--verbose"])), None);
        assert_eq!(config_path_from(args(&["--config"])), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_eventually_connects() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, String> = connect_with_retry("broker", 5, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("refused #{n}"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_returns_last_error() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = connect_with_retry("broker", 4, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("refused #{n}"))
        })
        .await;

        assert_eq!(result.unwrap_err(), "refused #4");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
