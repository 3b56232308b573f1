//! Coalescing, non-blocking signals
//!
//! Capacity is one: firing while a signal is already pending drops the new
//! one and counts it. Used both to wake the refresher after a commit and
//! for the caught-up notification.

use prometheus::IntCounter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Clone)]
pub struct Trigger {
    tx: mpsc::Sender<()>,
    dropped: Arc<AtomicU64>,
    counter: Option<IntCounter>,
}

pub struct TriggerReceiver {
    rx: mpsc::Receiver<()>,
}

pub fn coalescing() -> (Trigger, TriggerReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (
        Trigger {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            counter: None,
        },
        TriggerReceiver { rx },
    )
}

impl Trigger {
    /// Also count drops in a Prometheus counter
    pub fn with_counter(mut self, counter: IntCounter) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Returns whether the signal was queued. Never blocks.
    pub fn fire(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(counter) = &self.counter {
                    counter.inc();
                }
                false
            }
            Err(TrySendError::Closed(())) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TriggerReceiver {
    /// Waits for a signal; `None` once every trigger is gone
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn excess_signals_are_dropped_and_counted() {
        let (trigger, mut rx) = coalescing();
        assert!(trigger.fire());
        assert!(!trigger.fire());
        assert!(!trigger.clone().fire());
        assert_eq!(trigger.dropped(), 2);

        assert_eq!(rx.recv().await, Some(()));
        assert!(!rx.try_recv());
        assert!(trigger.fire());
        assert!(rx.try_recv());
    }

    #[tokio::test]
    async fn closed_receiver_is_not_a_drop() {
        let (trigger, rx) = coalescing();
        drop(rx);
        assert!(!trigger.fire());
        assert_eq!(trigger.dropped(), 0);
    }
}
