//! Termination signals for the host process.
//!
//! Supervised children live in their own process groups, so a Ctrl-C on
//! the terminal does not reach them directly; the host stops them through
//! [`crate::Supervisor::shutdown`] once [`shutdown_signal`] resolves.

use std::io;
use tracing::info;

/// Resolves on SIGINT or SIGTERM (Ctrl-C elsewhere).
pub async fn shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl-C");
        Ok(())
    }
}
