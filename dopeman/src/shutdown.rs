//! Signal-driven shutdown for the host process.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{self as nix_signal, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancelled on the first SIGINT, SIGTERM or SIGHUP. A second signal exits
/// the process immediately.
#[derive(Debug)]
pub struct Shutdown {
    token: CancellationToken,
    last_signal: AtomicI32,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            last_signal: AtomicI32::new(0),
        })
    }

    /// Listen for termination signals in a background task.
    pub fn install_signals(self: &Arc<Self>) -> std::io::Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let shutdown = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = sigint.recv() => Signal::SIGINT,
                    _ = sigterm.recv() => Signal::SIGTERM,
                    _ = sighup.recv() => Signal::SIGHUP,
                };

                if shutdown.last_signal().is_some() {
                    warn!("Received second signal, forcing exit");
                    shutdown.exit_process();
                }

                info!("Received {}, stopping services...", received);
                shutdown
                    .last_signal
                    .store(received as i32, Ordering::Relaxed);
                shutdown.shutdown();
            }
        });
        Ok(())
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    pub fn last_signal(&self) -> Option<Signal> {
        match self.last_signal.load(Ordering::Relaxed) {
            0 => None,
            i => Signal::try_from(i).ok(),
        }
    }

    /// Exit status a shell reports for the last signal (`128 + signo`).
    pub fn exit_code(&self) -> u8 {
        self.last_signal()
            .map_or(0, |signal| 128u8.saturating_add(signal as u8))
    }

    /// Re-raise the last signal with its default action so the parent sees
    /// the conventional status.
    fn exit_process(&self) -> ! {
        let signal = self.last_signal().unwrap_or(Signal::SIGTERM);
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: installs the default disposition; no handler code runs.
        if unsafe { nix_signal::sigaction(signal, &action) }.is_ok() {
            let _ = nix_signal::kill(unistd::getpid(), signal);
        }
        std::process::exit(1);
    }
}
