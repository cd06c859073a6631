//! Worker connection lifecycle.
//!
//! `Disconnected → Connecting → Connected → Draining → Closed`. A runtime
//! that failed to connect falls back to `Disconnected`; `Closed` is terminal.

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a worker's hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    /// In-flight calls finish, new sends are rejected.
    Draining = 3,
    Closed = 4,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl ConnectionState {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Draining,
            _ => Self::Closed,
        }
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Draining)
                | (Connected, Closed)
                | (Draining, Closed)
                | (Disconnected, Closed)
        )
    }
}

/// Resolve when the process receives SIGINT or SIGTERM (Ctrl+C elsewhere).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(error = %e, "Signal handlers unavailable, falling back to ctrl_c");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C");
    }
}

/// Atomic holder for a [`ConnectionState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected as u8))
    }
}

impl StateCell {
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`. Fails (returning the actual state) if the
    /// cell is not in `from` or the transition is illegal.
    pub fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> Result<(), ConnectionState> {
        if !from.can_transition_to(to) {
            return Err(self.get());
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }

    /// Force the terminal state.
    pub fn close(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(ConnectionState::Closed as u8, Ordering::SeqCst))
    }
}
