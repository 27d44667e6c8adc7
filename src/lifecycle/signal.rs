//! Cooperative shutdown signalling
//!
//! A single trigger fans out to any number of signals. Long waits select on
//! [`ShutdownSignal::wait`] so they unwind promptly once shutdown starts.

use tokio::sync::watch;

/// Create a connected trigger/signal pair
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownTrigger { sender }, ShutdownSignal { receiver })
}

/// Sending half; firing it more than once is a no-op
#[derive(Debug)]
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Fire the signal; returns true only for the first call
    pub fn trigger(&self) -> bool {
        self.sender.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// A new receiving half
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiving half, cheap to clone
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown has been triggered
    ///
    /// If the trigger is dropped without firing, this never resolves.
    pub async fn wait(&mut self) {
        if self.receiver.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
