//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGTERM/SIGINT in binaries
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)

/// Resolve when the process is asked to terminate.
pub async fn wait_for_termination() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
        tracing::info!("termination signal received");
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("termination signal received");
        Ok(())
    }
}
