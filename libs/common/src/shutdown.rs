//! Graceful shutdown utilities

use tracing::{info, warn};

/// Which signal ended the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
}

/// Wait for Ctrl+C, or SIGTERM on Unix
///
/// ```ignore
/// tokio::select! {
///     reason = common::shutdown::wait_for_shutdown() => {
///         info!("Stopping: {:?}", reason);
///     }
///     // ... polling loop
/// }
/// ```
pub async fn wait_for_shutdown() -> ShutdownReason {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!(
                    "Failed to install SIGTERM handler: {}. Only Ctrl+C will stop the service",
                    e
                );
                None
            },
        };

        let reason = tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownReason::Interrupt,
            _ = async {
                match term_signal.as_mut() {
                    Some(sig) => {
                        sig.recv().await;
                    },
                    None => std::future::pending::<()>().await,
                }
            } => ShutdownReason::Terminate,
        };
        info!("Shutdown signal received: {:?}", reason);
        reason
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received: Interrupt");
        ShutdownReason::Interrupt
    }
}
