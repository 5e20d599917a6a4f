//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Energy integration engine and lifecycle primitives."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! One-shot wait that ends on operator quit or on a programmatic signal.
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// How a [`CancellableWait`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The operator asked to quit (Enter on stdin, Ctrl-C).
    OperatorQuit,
    /// [`TerminationSignal::signal`] was called.
    SignalReceived,
}

/// Sending half. Cheap to clone and safe to use from any task or thread.
#[derive(Debug, Clone)]
pub struct TerminationSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl TerminationSignal {
    /// Release the waiter. Calling it again, or before anyone waits, is fine:
    /// the latch stays set.
    pub fn signal(&self) {
        if !self.tx.send_replace(true) {
            debug!("termination signal raised");
        }
    }

    pub fn is_signalled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiving half. Consumed by [`CancellableWait::wait`].
#[derive(Debug)]
pub struct CancellableWait {
    rx: watch::Receiver<bool>,
}

impl CancellableWait {
    /// Create a fresh wait together with the signal that releases it.
    pub fn new() -> (Self, TerminationSignal) {
        let (tx, rx) = watch::channel(false);
        (
            Self { rx },
            TerminationSignal { tx: Arc::new(tx) },
        )
    }

    /// Block until `quit` resolves or the signal is raised, whichever comes
    /// first. A signal raised before this call returns immediately.
    ///
    /// If every [`TerminationSignal`] is dropped without signalling, only
    /// `quit` can end the wait.
    pub async fn wait<Q>(mut self, quit: Q) -> WaitOutcome
    where
        Q: Future<Output = ()>,
    {
        tokio::pin!(quit);
        tokio::select! {
            biased;
            signalled = self.rx.wait_for(|raised| *raised) => {
                if signalled.is_ok() {
                    return WaitOutcome::SignalReceived;
                }
            }
            _ = &mut quit => return WaitOutcome::OperatorQuit,
        }
        quit.await;
        WaitOutcome::OperatorQuit
    }
}
