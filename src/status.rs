//! Presence status listener.
//!
//! Receives broadcast datagrams on the status port and turns the two
//! recognized codes into gate updates. Everything else is logged and dropped.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::UdpSocket;

use crate::cancel::CancelToken;
use crate::gate::GateWriter;
use crate::messages::StatusMessage;

/// Upper bound on how long the loop waits for a datagram before rechecking
/// for cancellation.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Large enough for any UDP payload, so `recv_from` never truncates and a
/// long datagram cannot trim down to a recognized code.
const MAX_DATAGRAM_SIZE: usize = 65536;

pub struct StatusListener {
    socket: UdpSocket,
    gate: GateWriter,
}

impl StatusListener {
    /// Binds the status socket with broadcast reception enabled. Failure here
    /// is fatal for session startup.
    pub async fn bind(addr: SocketAddr, gate: GateWriter) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        socket.set_broadcast(true)?;
        let listener = StatusListener { socket, gate };
        info!("Status listener bound to {}", listener.local_addr()?);
        Ok(listener)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Runs until `cancel` fires. The socket is dropped on return, which is
    /// the only place it is released.
    pub async fn run(self, mut cancel: CancelToken) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        while !cancel.is_cancelled() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = tokio::time::timeout(POLL_INTERVAL, self.socket.recv_from(&mut buffer)) => {
                    match received {
                        // Nothing arrived within the poll interval.
                        Err(_) => continue,
                        Ok(Ok((len, src))) => self.handle_datagram(&buffer[..len], src),
                        Ok(Err(e))
                            if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                        {
                            continue;
                        }
                        Ok(Err(e)) => {
                            error!("Status socket receive error: {e}");
                            tokio::time::sleep(POLL_INTERVAL).await;
                        }
                    }
                }
            }
        }

        info!("Status listener stopped");
    }

    fn handle_datagram(&self, payload: &[u8], src: SocketAddr) {
        let message = StatusMessage::parse(payload);
        match message.gate_value() {
            Some(detected) => {
                let previous = self.gate.set(detected);
                if previous != detected {
                    info!("Gate {} ({:?} from {src})", if detected { "opened" } else { "closed" }, message);
                } else {
                    debug!("Gate unchanged ({:?} from {src})", message);
                }
            }
            None => warn!("Unrecognized status message from {src}: {:?}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::cancel;
    use crate::gate::{self, GateReader};

    async fn spawn_listener() -> (
        SocketAddr,
        GateReader,
        cancel::Canceller,
        tokio::task::JoinHandle<()>,
    ) {
        let (writer, reader) = gate::channel();
        let listener = StatusListener::bind(
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
            writer,
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let (canceller, token) = cancel::pair();
        let handle = tokio::spawn(listener.run(token));
        (addr, reader, canceller, handle)
    }

    async fn send(addr: SocketAddr, payload: &[u8]) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(payload, addr).await.unwrap();
    }

    async fn wait_for_gate(reader: &GateReader, expected: bool) -> bool {
        for _ in 0..50 {
            if reader.get() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_detected_then_no_object() {
        let (addr, reader, canceller, handle) = spawn_listener().await;

        send(addr, b"SENSOR:DETECTED").await;
        assert!(wait_for_gate(&reader, true).await);

        send(addr, b"SENSOR:NO_OBJECT\n").await;
        assert!(wait_for_gate(&reader, false).await);

        canceller.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_detected_keeps_gate_open() {
        let (addr, reader, canceller, handle) = spawn_listener().await;

        send(addr, b"SENSOR:DETECTED").await;
        send(addr, b"SENSOR:DETECTED").await;
        assert!(wait_for_gate(&reader, true).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reader.get());

        canceller.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_does_not_change_gate() {
        let (addr, reader, canceller, handle) = spawn_listener().await;

        send(addr, b"SENSOR:DETECTED").await;
        assert!(wait_for_gate(&reader, true).await);
        send(addr, b"GARBAGE").await;
        send(addr, &[0xff, 0x00, 0xfe]).await;
        // A trailing close proves the garbage was processed before it.
        send(addr, b"SENSOR:NO_OBJECT").await;
        send(addr, b"GARBAGE").await;
        assert!(wait_for_gate(&reader, false).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.get());

        canceller.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_long_datagram_with_code_prefix_is_unrecognized() {
        let (addr, reader, canceller, handle) = spawn_listener().await;

        let mut payload = b"SENSOR:DETECTED".to_vec();
        payload.extend(std::iter::repeat_n(b' ', 1100));
        payload.extend_from_slice(b"GARBAGE");
        send(addr, &payload).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!reader.get());

        // The listener is still running and reacts to the real code.
        send(addr, b"SENSOR:DETECTED").await;
        assert!(wait_for_gate(&reader, true).await);

        canceller.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_within_poll_interval() {
        let (_addr, _reader, canceller, handle) = spawn_listener().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        canceller.cancel();
        tokio::time::timeout(POLL_INTERVAL * 2, handle)
            .await
            .expect("listener did not observe cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_mutations_after_cancel() {
        let (addr, reader, canceller, handle) = spawn_listener().await;

        canceller.cancel();
        handle.await.unwrap();

        // The port is released; the datagram goes nowhere.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let _ = socket.send_to(b"SENSOR:DETECTED", addr).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.get());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let (writer, _reader) = gate::channel();
        let result = StatusListener::bind(taken.local_addr().unwrap(), writer).await;
        assert!(result.is_err());
    }
}
