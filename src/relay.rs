//! Gated heart-rate relay.

use log::{info, warn};

use crate::gate::GateReader;
use crate::messages::{HeartRateEvent, OutboundSample};
use crate::sensor::HeartRateHandler;

/// Downstream consumer of gated samples.
pub trait Sink: Send + Sync {
    fn send(&self, address: &str, value: i32) -> anyhow::Result<()>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn send(&self, address: &str, value: i32) -> anyhow::Result<()> {
        (**self).send(address, value)
    }
}

pub struct HeartRateRelay<S> {
    gate: GateReader,
    sink: S,
    address: String,
}

impl<S: Sink> HeartRateRelay<S> {
    pub fn new(gate: GateReader, sink: S, address: impl Into<String>) -> Self {
        HeartRateRelay {
            gate,
            sink,
            address: address.into(),
        }
    }

    /// Handles one notification. The gate is read once; a failed send is
    /// logged and otherwise ignored.
    pub fn handle(&self, event: HeartRateEvent) -> OutboundSample {
        let sample = OutboundSample::gated(event, self.gate.get());

        match self
            .sink
            .send(&self.address, i32::from(sample.heartrate_to_send))
        {
            Ok(()) => info!(
                "Sent {} {} (measured {} bpm)",
                self.address, sample.heartrate_to_send, event.heartrate
            ),
            Err(err) => warn!(
                "Error sending {} {}: {:#}",
                self.address, sample.heartrate_to_send, err
            ),
        }

        sample
    }
}

impl<S: Sink + 'static> HeartRateRelay<S> {
    pub fn into_handler(self) -> HeartRateHandler {
        Box::new(move |event| {
            self.handle(event);
        })
    }
}
