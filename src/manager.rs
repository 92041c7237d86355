//! Session lifecycle: start the sensor stream and the status listener, wait
//! for shutdown, then drain and close.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use log::{debug, error, info, warn};

use crate::cancel::{self, CancelToken};
use crate::config::{OscConfig, StatusConfig};
use crate::gate::{self, GateReader, GateWriter};
use crate::relay::{HeartRateRelay, Sink};
use crate::sensor::{SensorError, SensorSession};
use crate::status::StatusListener;

/// How long draining waits for the status listener before aborting it. The
/// listener itself reacts within one poll interval.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Idle,
    SessionStarting,
    Streaming,
    Draining,
    Closed,
}

struct Lifecycle {
    phase: Phase,
    #[cfg(test)]
    history: std::sync::Arc<std::sync::Mutex<Vec<Phase>>>,
}

impl Lifecycle {
    fn new() -> Self {
        Lifecycle {
            phase: Phase::Idle,
            #[cfg(test)]
            history: std::sync::Arc::new(std::sync::Mutex::new(vec![Phase::Idle])),
        }
    }

    fn advance(&mut self, next: Phase) {
        let current = self.phase;
        debug_assert!(next > current, "lifecycle moved backwards: {current:?} -> {next:?}");
        info!("Lifecycle: {current:?} -> {next:?}");
        self.phase = next;
        #[cfg(test)]
        self.history.lock().unwrap().push(next);
    }
}

pub struct Manager<S> {
    status_addr: SocketAddr,
    osc_address: String,
    sink: S,
    gate: (GateWriter, GateReader),
    lifecycle: Lifecycle,
}

impl<S: Sink + 'static> Manager<S> {
    pub fn new(status: &StatusConfig, osc: &OscConfig, sink: S) -> Self {
        Manager {
            status_addr: status.bind_addr(),
            osc_address: osc.address(),
            sink,
            gate: gate::channel(),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Drives one session from start to close. Startup failures are returned;
    /// everything after `Streaming` is logged and absorbed.
    ///
    /// `connect` receives the shutdown token and is expected to clean up and
    /// return [`SensorError::Cancelled`] once it fires.
    pub async fn run_loop<Sess, C, F>(
        self,
        connect: C,
        mut shutdown: CancelToken,
    ) -> anyhow::Result<()>
    where
        Sess: SensorSession,
        C: FnOnce(CancelToken) -> F,
        F: Future<Output = Result<Sess, SensorError>>,
    {
        let Manager {
            status_addr,
            osc_address,
            sink,
            gate: (gate_writer, gate_reader),
            mut lifecycle,
        } = self;

        lifecycle.advance(Phase::SessionStarting);

        let listener = match StatusListener::bind(status_addr, gate_writer).await {
            Ok(listener) => listener,
            Err(err) => {
                lifecycle.advance(Phase::Closed);
                return Err(err).with_context(|| format!("Binding status listener on {status_addr}"));
            }
        };

        let mut session = match connect(shutdown.clone()).await {
            Ok(session) => session,
            Err(SensorError::Cancelled) => {
                info!("Shutdown requested while starting session");
                lifecycle.advance(Phase::Closed);
                return Ok(());
            }
            Err(err) => {
                lifecycle.advance(Phase::Closed);
                return Err(err).context("Establishing sensor session");
            }
        };

        // The session may have been established just as shutdown fired.
        if shutdown.is_cancelled() {
            info!("Shutdown requested while starting session");
            close_session(session).await;
            lifecycle.advance(Phase::Closed);
            return Ok(());
        }

        let relay = HeartRateRelay::new(gate_reader, sink, osc_address);
        if let Err(err) = session.start_heartrate_stream(relay.into_handler()).await {
            close_session(session).await;
            lifecycle.advance(Phase::Closed);
            return Err(err).context("Starting heart rate stream");
        }

        lifecycle.advance(Phase::Streaming);
        let (listener_cancel, listener_token) = cancel::pair();
        let mut listener_task = tokio::spawn(listener.run(listener_token));

        shutdown.cancelled().await;

        lifecycle.advance(Phase::Draining);
        listener_cancel.cancel();
        match tokio::time::timeout(DRAIN_TIMEOUT, &mut listener_task).await {
            Ok(Ok(())) => debug!("Status listener drained"),
            Ok(Err(err)) if err.is_cancelled() => debug!("Status listener cancelled: {err}"),
            Ok(Err(err)) => error!("Status listener failed: {err}"),
            Err(_) => {
                warn!("Status listener did not stop within {DRAIN_TIMEOUT:?}; aborting");
                listener_task.abort();
            }
        }

        close_session(session).await;
        lifecycle.advance(Phase::Closed);
        Ok(())
    }

    #[cfg(test)]
    fn phase_history(&self) -> std::sync::Arc<std::sync::Mutex<Vec<Phase>>> {
        self.lifecycle.history.clone()
    }

    #[cfg(test)]
    fn gate(&self) -> GateReader {
        self.gate.1.clone()
    }
}

async fn close_session<Sess: SensorSession>(session: Sess) {
    if let Err(err) = session.close().await {
        error!("Error closing sensor session: {err}");
    }
}
