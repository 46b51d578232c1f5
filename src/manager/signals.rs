//! Termination signals
//!
//! SIGTERM and SIGINT are taken over by the runtime as soon as the handler
//! exists, so they never kill the launcher preemptively. They are delivered
//! through the event loop instead, which then shuts down cleanly.

use tokio::signal::unix::{signal, Signal, SignalKind};

/// Signals the launcher handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchSignal {
    /// Shutdown request (SIGTERM)
    Term,
    /// Interrupt (SIGINT, Ctrl+C)
    Int,
}

pub struct SignalHandler {
    sigterm: Signal,
    sigint: Signal,
}

impl SignalHandler {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next signal
    pub async fn wait(&mut self) -> LaunchSignal {
        tokio::select! {
            _ = self.sigterm.recv() => LaunchSignal::Term,
            _ = self.sigint.recv() => LaunchSignal::Int,
        }
    }
}
