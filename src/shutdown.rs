//! # Termination signals for [`Node::run_until_signal`](crate::Node::run_until_signal).
//!
//! **Unix:** `SIGINT`, `SIGTERM` (systemd, Kubernetes) and `SIGQUIT`.
//! **Elsewhere:** Ctrl-C only.

/// Which signal ended the wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Quit,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Quit => "SIGQUIT",
        }
    }
}

/// Waits for a termination signal.
///
/// Each call registers its own listeners; `Err` if registration fails.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<Signal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let received = tokio::select! {
        _ = sigint.recv() => Signal::Interrupt,
        _ = sigterm.recv() => Signal::Terminate,
        _ = sigquit.recv() => Signal::Quit,
    };
    Ok(received)
}

/// Waits for a termination signal.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<Signal> {
    tokio::signal::ctrl_c().await?;
    Ok(Signal::Interrupt)
}
