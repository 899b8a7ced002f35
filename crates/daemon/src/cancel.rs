//! Cooperative stop signal.
//!
//! A [`StopSignal`] is created once per run and handed to the walker and the
//! supervisor. It is set at most once and never cleared; long-running loops
//! poll it at their iteration boundaries.

use log::info;
use std::io;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop. Later calls have no further effect.
    pub fn request_stop(&self) {
        if !self.token.is_cancelled() {
            info!("stop requested, finishing the current step");
            self.token.cancel();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// Routes SIGTERM into `signal`.
///
/// The handler task only sets the flag; teardown happens on the main path.
#[cfg(unix)]
pub fn install_termination_handler(signal: StopSignal) -> io::Result<()> {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    let mut term = unix_signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        if term.recv().await.is_some() {
            signal.request_stop();
        }
    });
    Ok(())
}

/// Routes Ctrl-C into `signal` where SIGTERM does not exist.
#[cfg(not(unix))]
pub fn install_termination_handler(signal: StopSignal) -> io::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.request_stop();
        }
    });
    Ok(())
}
