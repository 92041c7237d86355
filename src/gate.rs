//! The presence gate shared between the status listener and the heart-rate relay.
//!
//! The flag has exactly one writer and one reader, so the handles are split:
//! [`GateWriter`] cannot be cloned and is moved into the listener, while
//! [`GateReader`] goes to the relay. Both sides use sequentially consistent
//! atomic access, so a reader only ever observes a whole `true` or `false`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Creates a gate that starts closed (`detected == false`).
pub fn channel() -> (GateWriter, GateReader) {
    let detected = Arc::new(AtomicBool::new(false));
    (
        GateWriter {
            detected: detected.clone(),
        },
        GateReader { detected },
    )
}

#[derive(Debug)]
pub struct GateWriter {
    detected: Arc<AtomicBool>,
}

impl GateWriter {
    /// Stores `value` and returns the previous state.
    pub fn set(&self, value: bool) -> bool {
        self.detected.swap(value, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct GateReader {
    detected: Arc<AtomicBool>,
}

impl GateReader {
    pub fn get(&self) -> bool {
        self.detected.load(Ordering::SeqCst)
    }
}
