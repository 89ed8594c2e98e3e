//! Process shutdown signals
//!
//! Handlers are registered at construction. A signal delivered before
//! [`ShutdownSignals::recv`] is polled is buffered, not lost.

use tokio::signal::unix::{signal, Signal, SignalKind};

#[derive(Debug)]
pub struct ShutdownSignals {
    sigint: Signal,
    sigterm: Signal,
}

impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for SIGINT or SIGTERM and return its name
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        }
    }
}
