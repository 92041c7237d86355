//! Cooperative cancellation built on a `tokio::sync::watch` channel.
//!
//! A [`Canceller`] fires once; any number of [`CancelToken`]s observe it.
//! Dropping the canceller without firing counts as cancellation, so an
//! activity never outlives whoever was responsible for stopping it.

use tokio::sync::watch;

pub fn pair() -> (Canceller, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (Canceller { tx }, CancelToken { rx })
}

#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    /// Requests cancellation. Returns `true` only for the call that actually
    /// flipped the state; later calls are no-ops.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once cancellation has been requested. Cancel-safe.
    pub async fn cancelled(&mut self) {
        // An Err means the canceller is gone, which is treated the same way.
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}
