//! Heart-rate sensor session over Bluetooth LE.
//!
//! Uses the standard Heart Rate Service, which Polar devices expose alongside
//! their proprietary measurement streams.

use std::future::Future;

use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{Central as _, CentralEvent, Characteristic, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use futures::{Stream, StreamExt as _};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::config::SensorConfig;
use crate::messages::HeartRateEvent;

const HEART_RATE_MEASUREMENT: u16 = 0x2A37;

/// Invoked once per heart-rate notification, from whichever task delivers it.
pub type HeartRateHandler = Box<dyn Fn(HeartRateEvent) + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("no device matching \"{0}\" found")]
    NotFound(String),

    #[error("device does not expose the heart rate measurement characteristic")]
    MissingCharacteristic,

    #[error("session startup cancelled")]
    Cancelled,

    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
}

pub trait SensorSession: Sized {
    /// Registers `handler` and asks the device to start notifying.
    async fn start_heartrate_stream(&mut self, handler: HeartRateHandler)
    -> Result<(), SensorError>;

    async fn close(self) -> Result<(), SensorError>;
}

/// Decodes a Heart Rate Measurement value. Bit 0 of the flags byte selects
/// between an 8-bit and a little-endian 16-bit reading.
pub fn parse_heart_rate_measurement(data: &[u8]) -> Option<u16> {
    let (&flags, rest) = data.split_first()?;
    if flags & 0x01 == 0 {
        rest.first().map(|&bpm| u16::from(bpm))
    } else {
        match rest {
            [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }
}

/// Scans for the first peripheral whose local name contains the configured
/// filter, then connects to it.
///
/// Returns [`SensorError::Cancelled`] once `cancel` fires. Every exit path
/// stops the scan, and any failure after connecting disconnects again, so an
/// aborted startup never leaves the device attached.
pub async fn discover(
    adapter: &Adapter,
    config: &SensorConfig,
    mut cancel: CancelToken,
) -> Result<BleSession, SensorError> {
    let filter = config.name_filter();
    info!("Scanning for \"{filter}\" ({:?})", config.scan_timeout());

    let mut events = adapter.events().await?;
    adapter.start_scan(ScanFilter::default()).await?;

    let found = tokio::select! {
        found = tokio::time::timeout(
            config.scan_timeout(),
            find_peripheral(adapter, &mut events, filter),
        ) => Some(found),
        _ = cancel.cancelled() => None,
    };

    if let Err(err) = adapter.stop_scan().await {
        warn!("Error stopping scan: {err}");
    }

    let peripheral = match found {
        None => return Err(SensorError::Cancelled),
        Some(Ok(Ok(Some(peripheral)))) => peripheral,
        Some(Ok(Ok(None)) | Err(_)) => return Err(SensorError::NotFound(filter.to_string())),
        Some(Ok(Err(err))) => return Err(err),
    };

    undo_on_failure(connect(&peripheral), &mut cancel, async {
        if let Err(err) = peripheral.disconnect().await {
            debug!("Error disconnecting after failed startup: {err}");
        }
    })
    .await?;
    info!("Connected to {}", peripheral.address());

    Ok(BleSession {
        peripheral,
        characteristic: None,
        pump: None,
    })
}

/// Runs `step` unless `cancel` fires first. If the step fails or is
/// cancelled, `undo` runs before the error is returned.
async fn undo_on_failure<T>(
    step: impl Future<Output = Result<T, SensorError>>,
    cancel: &mut CancelToken,
    undo: impl Future<Output = ()>,
) -> Result<T, SensorError> {
    let result = tokio::select! {
        result = step => result,
        _ = cancel.cancelled() => Err(SensorError::Cancelled),
    };
    if result.is_err() {
        undo.await;
    }
    result
}

async fn connect(peripheral: &Peripheral) -> Result<(), SensorError> {
    peripheral.connect().await?;
    peripheral.discover_services().await?;
    Ok(())
}

async fn find_peripheral(
    adapter: &Adapter,
    events: &mut (impl Stream<Item = CentralEvent> + Unpin),
    filter: &str,
) -> Result<Option<Peripheral>, SensorError> {
    // Devices seen by an earlier scan do not produce a new discovery event.
    for peripheral in adapter.peripherals().await? {
        if name_matches(&peripheral, filter).await? {
            return Ok(Some(peripheral));
        }
    }
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDiscovered(id) = event {
            let peripheral = adapter.peripheral(&id).await?;
            if name_matches(&peripheral, filter).await? {
                return Ok(Some(peripheral));
            }
        }
    }
    Ok(None)
}

async fn name_matches(peripheral: &Peripheral, filter: &str) -> Result<bool, SensorError> {
    let name = peripheral.properties().await?.and_then(|p| p.local_name);
    debug!("Saw {:?} {:?}", peripheral.address(), name);
    Ok(name.is_some_and(|name| name.contains(filter)))
}

pub struct BleSession {
    peripheral: Peripheral,
    characteristic: Option<Characteristic>,
    pump: Option<JoinHandle<()>>,
}

impl SensorSession for BleSession {
    async fn start_heartrate_stream(
        &mut self,
        handler: HeartRateHandler,
    ) -> Result<(), SensorError> {
        let measurement_uuid = uuid_from_u16(HEART_RATE_MEASUREMENT);
        let characteristic = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == measurement_uuid)
            .ok_or(SensorError::MissingCharacteristic)?;

        let mut notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&characteristic).await?;
        self.characteristic = Some(characteristic);

        self.pump = Some(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != measurement_uuid {
                    continue;
                }
                match parse_heart_rate_measurement(&notification.value) {
                    Some(heartrate) => {
                        info!("Received heart rate: {heartrate} bpm");
                        handler(HeartRateEvent { heartrate });
                    }
                    None => warn!("Undecodable heart rate notification: {:?}", notification.value),
                }
            }
            debug!("Heart rate notification stream ended");
        }));

        info!("Heart rate stream started");
        Ok(())
    }

    async fn close(mut self) -> Result<(), SensorError> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(characteristic) = self.characteristic.take() {
            if let Err(err) = self.peripheral.unsubscribe(&characteristic).await {
                warn!("Error unsubscribing from heart rate: {err}");
            }
        }
        self.peripheral.disconnect().await?;
        info!("Disconnected from {}", self.peripheral.address());
        Ok(())
    }
}
