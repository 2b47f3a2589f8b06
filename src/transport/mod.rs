//! Transport seam between the host library and an instrument.
//!
//! The core never touches bytes. It issues [`DeviceCommand`]s through a
//! [`Transport`] and consumes [`DeviceNotification`]s from the receiver that
//! came with the [`Connection`]. A [`Connector`] enumerates ports and opens
//! connections.
//!
//! Implementations:
//!
//! - [`LineTransport`]: newline-delimited JSON over any async byte stream
//! - `SerialConnector`: [`LineTransport`] over a USB virtual COM port
//!   (requires the `serial` feature)
//! - [`SimBench`](crate::sim::SimBench): in-process simulated instruments

pub mod protocol;
mod serial;

pub use protocol::{
    DeviceCommand, DeviceFrame, DeviceInfo, DeviceNotification, DeviceReply, HostFrame, RejectCode,
    ReplyFrame,
};
#[cfg(feature = "serial")]
pub use serial::SerialConnector;
pub use serial::{LineTransport, SerialPortIO};

use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Request/response path to one connected device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `command` and wait for the device's reply.
    ///
    /// Implementations do not apply timeouts; callers bound each request.
    async fn request(&self, command: DeviceCommand) -> Result<DeviceReply, TransportError>;

    /// Close the connection. Further requests fail with
    /// [`TransportError::Closed`].
    async fn close(&self) -> Result<(), TransportError>;
}

/// An open connection: a transport plus its notification stream.
pub struct Connection {
    /// Port the connection was opened on
    pub port: String,
    /// Request path
    pub transport: Arc<dyn Transport>,
    /// Unsolicited device messages, in arrival order
    pub notifications: mpsc::Receiver<DeviceNotification>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Discovers ports and opens connections on them.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Ports with a candidate instrument attached.
    async fn available_ports(&self) -> Result<Vec<String>, TransportError>;

    /// Open a connection on `port`.
    async fn open(&self, port: &str) -> Result<Connection, TransportError>;
}
