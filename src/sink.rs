use std::net::{SocketAddr, ToSocketAddrs as _, UdpSocket};

use anyhow::{Context as _, anyhow};
use clap::ValueEnum;
use log::{debug, info};
use rosc::{OscMessage, OscPacket, OscType};

use crate::config::OscConfig;
use crate::relay::Sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputMode {
    /// Send OSC messages over UDP.
    #[default]
    Osc,
    /// Only log what would have been sent.
    Log,
}

pub fn build(mode: OutputMode, config: &OscConfig) -> anyhow::Result<Box<dyn Sink>> {
    Ok(match mode {
        OutputMode::Osc => Box::new(OscSink::new(config)?),
        OutputMode::Log => Box::new(LogSink),
    })
}

/// Sends single-integer OSC messages to a fixed destination.
#[derive(Debug)]
pub struct OscSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl OscSink {
    pub fn new(config: &OscConfig) -> anyhow::Result<Self> {
        let target = (config.host(), config.port())
            .to_socket_addrs()
            .with_context(|| format!("Resolving OSC target {}:{}", config.host(), config.port()))?
            .next()
            .ok_or_else(|| anyhow!("No address for OSC target {}", config.host()))?;

        let bind_addr: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).context("Binding OSC socket")?;

        info!("Sending OSC to {target}");
        Ok(OscSink { socket, target })
    }
}

impl Sink for OscSink {
    fn send(&self, address: &str, value: i32) -> anyhow::Result<()> {
        let packet = OscPacket::Message(OscMessage {
            addr: address.to_string(),
            args: vec![OscType::Int(value)],
        });
        let bytes = rosc::encoder::encode(&packet)
            .map_err(|e| anyhow!("Encoding OSC message: {e:?}"))?;
        self.socket
            .send_to(&bytes, self.target)
            .with_context(|| format!("Sending OSC message to {}", self.target))?;
        debug!("Sent OSC message: {address} {value}");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LogSink;

impl Sink for LogSink {
    fn send(&self, address: &str, value: i32) -> anyhow::Result<()> {
        info!("{address} {value}");
        Ok(())
    }
}
