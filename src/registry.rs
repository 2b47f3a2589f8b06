//! Registry of connected instruments.
//!
//! A [`DeviceRegistry`] is constructed explicitly over a [`Connector`] and
//! owns one [`InstrumentHandle`] per connected device:
//!
//! - **Connect**: open a port, identify the device, refuse unsupported
//!   firmware, start a handle. Idempotent per port and per device name.
//! - **Disconnect detection**: a watcher per handle removes the device and
//!   publishes [`RegistryEvent::DeviceDisconnected`] once.
//! - **Firmware updates**: install the bundled firmware, reporting progress
//!   as [`RegistryEvent::FirmwareUpdate`]. The device reboots afterwards and
//!   must be connected again.
//!
//! # Example
//!
//! ```
//! use echem_daq::config::AppConfig;
//! use echem_daq::registry::DeviceRegistry;
//! use echem_daq::sim::{SimBench, SimSpec};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() {
//! let bench = SimBench::new();
//! bench.plug("sim0", SimSpec::new("Plus1000"));
//! let registry = DeviceRegistry::new(Arc::new(bench), AppConfig::default());
//!
//! assert_eq!(registry.connect_all().await, 1);
//! assert_eq!(registry.connect_all().await, 0);
//! let handle = registry.handler("Plus1000").unwrap();
//! assert_eq!(handle.channel_count(), 4);
//! registry.shutdown().await;
//! # }
//! ```

use crate::config::AppConfig;
use crate::error::{InstrumentError, InstrumentResult, TransportError};
use crate::events::{FirmwareStatus, RegistryEvent};
use crate::handler::{identify, InstrumentHandle};
use crate::transport::{Connection, Connector};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

/// Depth of the registry event channel.
pub const REGISTRY_EVENT_CAPACITY: usize = 256;

struct Inner {
    connector: Arc<dyn Connector>,
    config: AppConfig,
    /// Connected devices by name
    devices: Mutex<BTreeMap<String, InstrumentHandle>>,
    events: broadcast::Sender<RegistryEvent>,
    /// Serialises connects and firmware updates
    lifecycle: tokio::sync::Mutex<()>,
}

/// Explicitly constructed registry of connected devices. Cheap to clone.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.connected_devices())
            .finish_non_exhaustive()
    }
}

fn connect_error(port: &str, e: TransportError) -> InstrumentError {
    InstrumentError::ConnectionFailed(format!("{port}: {e}"))
}

impl DeviceRegistry {
    /// Create a registry over `connector`.
    pub fn new(connector: Arc<dyn Connector>, config: AppConfig) -> Self {
        let (events, _) = broadcast::channel(REGISTRY_EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                devices: Mutex::new(BTreeMap::new()),
                events,
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Subscribe to registry lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    fn publish(&self, event: RegistryEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Configuration the registry was built with.
    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// Handle of the connected device `name`.
    ///
    /// # Errors
    ///
    /// [`InstrumentError::DeviceNotFound`] if no such device is connected.
    pub fn handler(&self, name: &str) -> InstrumentResult<InstrumentHandle> {
        self.inner
            .devices
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| InstrumentError::DeviceNotFound(name.to_string()))
    }

    /// Names of connected devices.
    pub fn connected_devices(&self) -> Vec<String> {
        self.inner.devices.lock().keys().cloned().collect()
    }

    fn by_port(&self, port: &str) -> Option<InstrumentHandle> {
        self.inner
            .devices
            .lock()
            .values()
            .find(|h| h.port() == port)
            .cloned()
    }

    /// Open `port` and identify the device without admitting it.
    async fn open_identified(
        &self,
        port: &str,
    ) -> InstrumentResult<(Connection, crate::transport::DeviceInfo)> {
        let connection = self
            .inner
            .connector
            .open(port)
            .await
            .map_err(|e| connect_error(port, e))?;
        let timeout = self.inner.config.transport.command_timeout();
        match identify(connection.transport.as_ref(), timeout).await {
            Ok(info) => Ok((connection, info)),
            Err(e) => {
                let _ = connection.transport.close().await;
                Err(e)
            }
        }
    }

    /// Connect the device on `port`.
    ///
    /// Returns the existing handle if the port or the device is already
    /// connected.
    ///
    /// # Errors
    ///
    /// - [`InstrumentError::ConnectionFailed`] if the port cannot be opened
    ///   or the device does not identify itself.
    /// - [`InstrumentError::FirmwareNotSupported`] for firmware older than
    ///   `firmware.min_supported`. No session is created.
    #[instrument(skip(self))]
    pub async fn connect(&self, port: &str) -> InstrumentResult<InstrumentHandle> {
        self.connect_inner(port).await.map(|(handle, _)| handle)
    }

    async fn connect_inner(&self, port: &str) -> InstrumentResult<(InstrumentHandle, bool)> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if let Some(handle) = self.by_port(port) {
            debug!(%port, device = %handle.name(), "Port already connected");
            return Ok((handle, false));
        }

        let (connection, info) = self.open_identified(port).await?;
        let minimum = self.inner.config.firmware.min_supported;
        if info.firmware_version < minimum {
            warn!(%port, device = %info.name, found = info.firmware_version, minimum, "Unsupported firmware");
            let _ = connection.transport.close().await;
            return Err(InstrumentError::FirmwareNotSupported {
                found: info.firmware_version,
                minimum,
            });
        }
        if let Ok(existing) = self.handler(&info.name) {
            debug!(%port, device = %info.name, "Device already connected on another port");
            let _ = connection.transport.close().await;
            return Ok((existing, false));
        }

        let name = info.name.clone();
        let handle =
            InstrumentHandle::spawn(connection, info, self.inner.config.transport.handle_settings());
        self.inner
            .devices
            .lock()
            .insert(name.clone(), handle.clone());
        self.spawn_watcher(handle.clone());

        info!(%port, device = %name, "Device connected");
        self.publish(RegistryEvent::DeviceConnected {
            name,
            port: port.to_string(),
        });
        Ok((handle, true))
    }

    /// Remove `handle` once it disconnects.
    fn spawn_watcher(&self, handle: InstrumentHandle) {
        let registry = self.clone();
        tokio::spawn(async move {
            handle.wait_disconnected().await;
            let removed = {
                let mut devices = registry.inner.devices.lock();
                match devices.get(handle.name()) {
                    Some(current) if current.same_connection(&handle) => {
                        devices.remove(handle.name());
                        true
                    }
                    _ => false,
                }
            };
            if removed {
                info!(device = %handle.name(), port = %handle.port(), "Device removed");
                registry.publish(RegistryEvent::DeviceDisconnected {
                    name: handle.name().to_string(),
                });
            }
        });
    }

    async fn candidate_ports(&self) -> Vec<String> {
        let mut ports: BTreeSet<String> = match self.inner.connector.available_ports().await {
            Ok(ports) => ports.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "Port discovery failed");
                BTreeSet::new()
            }
        };
        ports.extend(self.inner.config.ports.iter().cloned());
        ports.into_iter().collect()
    }

    /// Connect every discovered or configured port. Returns the number of
    /// newly connected devices.
    pub async fn connect_all(&self) -> usize {
        let mut connected = 0;
        for port in self.candidate_ports().await {
            match self.connect_inner(&port).await {
                Ok((_, true)) => connected += 1,
                Ok((_, false)) => {}
                Err(e) => warn!(%port, error = %e, "Connect failed"),
            }
        }
        connected
    }

    /// Install the bundled firmware on the device at `port`.
    ///
    /// The device need not be admitted; devices refused for old firmware
    /// can be updated. On success the device has rebooted and is no longer
    /// in the registry.
    ///
    /// # Errors
    ///
    /// - [`InstrumentError::FirmwareUptodate`] if the device already runs the
    ///   bundled version or newer.
    /// - [`InstrumentError::FirmwareFileNotFound`] if the configured image is
    ///   missing.
    /// - [`InstrumentError::BusyChannel`] if a channel is running.
    /// - [`InstrumentError::FirmwareUpdateInProgress`] if the device stops
    ///   reporting before the update finishes.
    #[instrument(skip(self))]
    pub async fn update_firmware(&self, port: &str) -> InstrumentResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let firmware = &self.inner.config.firmware;

        let (handle, temporary) = match self.by_port(port) {
            Some(handle) => (handle, false),
            None => {
                let (connection, info) = self.open_identified(port).await?;
                let settings = self.inner.config.transport.handle_settings();
                (InstrumentHandle::spawn(connection, info, settings), true)
            }
        };

        let result = self.run_update(port, &handle, firmware).await;
        if temporary && result.is_err() {
            handle.close().await;
        }
        result
    }

    async fn run_update(
        &self,
        port: &str,
        handle: &InstrumentHandle,
        firmware: &crate::config::FirmwareConfig,
    ) -> InstrumentResult<()> {
        let current = handle.info().firmware_version;
        if current >= firmware.bundled_version {
            return Err(InstrumentError::FirmwareUptodate(current));
        }
        if let Some(image) = &firmware.image {
            if !image.exists() {
                return Err(InstrumentError::FirmwareFileNotFound(
                    image.display().to_string(),
                ));
            }
        }

        let mut progress = handle.update_firmware(firmware.bundled_version).await?;
        self.publish(RegistryEvent::FirmwareUpdate {
            port: port.to_string(),
            status: FirmwareStatus::Started,
        });

        let mut last = None;
        while let Some(percent) = progress.recv().await {
            debug!(%port, percent, "Firmware progress");
            last = Some(percent);
            self.publish(RegistryEvent::FirmwareUpdate {
                port: port.to_string(),
                status: FirmwareStatus::Progress { percent },
            });
        }

        if last == Some(100) {
            info!(%port, version = firmware.bundled_version, "Firmware update completed");
            self.publish(RegistryEvent::FirmwareUpdate {
                port: port.to_string(),
                status: FirmwareStatus::Completed,
            });
            Ok(())
        } else {
            let message = format!(
                "device went away at {}%",
                last.map_or_else(|| "0".to_string(), |p| p.to_string())
            );
            warn!(%port, %message, "Firmware update failed");
            self.publish(RegistryEvent::FirmwareUpdate {
                port: port.to_string(),
                status: FirmwareStatus::Failed {
                    message: message.clone(),
                },
            });
            Err(InstrumentError::FirmwareUpdateInProgress(message))
        }
    }

    /// Update every reachable device running outdated firmware. Returns the
    /// number updated.
    pub async fn update_firmware_all(&self) -> usize {
        let mut updated = 0;
        for port in self.candidate_ports().await {
            match self.update_firmware(&port).await {
                Ok(()) => updated += 1,
                Err(InstrumentError::FirmwareUptodate(version)) => {
                    debug!(%port, version, "Firmware up to date");
                }
                Err(e) => warn!(%port, error = %e, "Firmware update failed"),
            }
        }
        updated
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        let handles: Vec<InstrumentHandle> = self.inner.devices.lock().values().cloned().collect();
        join_all(handles.iter().map(|handle| handle.close())).await;
        info!("Registry shut down");
    }
}
