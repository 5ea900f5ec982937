//! Process signal handling for the service binary

use std::fmt;

use tracing::warn;

/// Which signal ended the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Ctrl+C / SIGINT
    Interrupt,
    /// SIGTERM (Unix only)
    Terminate,
}

impl ShutdownSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve on the first Ctrl+C or SIGTERM and report which one arrived
///
/// If the SIGTERM handler cannot be installed only Ctrl+C is honoured.
pub async fn wait_for_shutdown() -> ShutdownSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term_signal = signal(SignalKind::terminate())
            .map_err(|e| warn!("SIGTERM handler unavailable, Ctrl+C only: {}", e))
            .ok();

        let terminated = async {
            match term_signal.as_mut() {
                Some(sig) => {
                    sig.recv().await;
                },
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
            _ = terminated => ShutdownSignal::Terminate,
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl+C handler failed: {}", e);
        }
        ShutdownSignal::Interrupt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::Terminate.as_str(), "SIGTERM");
    }

    #[tokio::test]
    async fn test_pending_without_signal() {
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            wait_for_shutdown(),
        )
        .await;
        assert!(waited.is_err());
    }
}
