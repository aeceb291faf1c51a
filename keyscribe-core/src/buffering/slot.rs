//! Single-slot SPSC handoff of analysis windows to the decode thread.
//!
//! Windows are produced strictly in order by the capture loop. When the decode
//! thread has not picked up the previous window yet, the configured
//! [`BackpressurePolicy`] decides: drop the new window (capture stays real-time)
//! or block the capture loop until the slot frees up (the ring buffer absorbs
//! the stall until it fills).

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::buffering::window::AnalysisWindow;

/// Behaviour when the slot is still occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressurePolicy {
    /// Drop the newly produced window.
    #[default]
    DropNewest,
    /// Block the producer until the consumer takes the pending window.
    Block,
}

/// Result of [`WindowSender::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Delivered,
    /// Slot occupied under `DropNewest`; the window was discarded.
    Dropped,
    /// The consumer is gone.
    Closed,
}

/// Producer half, owned by the capture loop.
#[derive(Debug)]
pub struct WindowSender {
    tx: Sender<AnalysisWindow>,
    policy: BackpressurePolicy,
}

/// Consumer half, owned by the decode loop.
#[derive(Debug)]
pub struct WindowReceiver {
    rx: Receiver<AnalysisWindow>,
}

/// Create a single-slot channel.
pub fn window_slot(policy: BackpressurePolicy) -> (WindowSender, WindowReceiver) {
    let (tx, rx) = bounded(1);
    (WindowSender { tx, policy }, WindowReceiver { rx })
}

impl WindowSender {
    pub fn offer(&self, window: AnalysisWindow) -> OfferOutcome {
        match self.policy {
            BackpressurePolicy::DropNewest => match self.tx.try_send(window) {
                Ok(()) => OfferOutcome::Delivered,
                Err(TrySendError::Full(_)) => OfferOutcome::Dropped,
                Err(TrySendError::Disconnected(_)) => OfferOutcome::Closed,
            },
            BackpressurePolicy::Block => match self.tx.send(window) {
                Ok(()) => OfferOutcome::Delivered,
                Err(_) => OfferOutcome::Closed,
            },
        }
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }
}

impl WindowReceiver {
    /// Wait up to `timeout` for the next window.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<AnalysisWindow, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<AnalysisWindow> {
        self.rx.try_recv().ok()
    }
}
