//! Newline-delimited JSON transport over async byte streams.
//!
//! [`LineTransport`] works over anything implementing [`SerialPortIO`]:
//! a `tokio_serial::SerialStream` for real hardware, or a
//! `tokio::io::DuplexStream` in tests. A reader task demultiplexes replies
//! (matched to requests by id) from notifications.

use super::protocol::{encode_line, DeviceFrame, HostFrame};
use super::{Connection, DeviceCommand, DeviceNotification, DeviceReply, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can carry a
/// [`LineTransport`], including `tokio_serial::SerialStream` and
/// `tokio::io::DuplexStream`.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> SerialPortIO for T {}

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<DeviceReply>>>>;

/// Removes an in-flight request when its caller goes away.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

// =============================================================================
// LineTransport
// =============================================================================

/// JSON-lines [`Transport`] over a byte stream.
pub struct LineTransport {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl LineTransport {
    /// Start a transport over `stream` and return the connection.
    ///
    /// `notification_capacity` bounds the notification queue; the reader
    /// applies backpressure to the stream when it is full.
    pub fn connect<S: SerialPortIO>(
        port: impl Into<String>,
        stream: S,
        notification_capacity: usize,
    ) -> Connection {
        let port = port.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(notification_capacity.max(1));
        let pending: PendingMap = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            port.clone(),
            BufReader::new(read_half),
            Arc::clone(&pending),
            Arc::clone(&closed),
            tx,
        ));

        let transport = LineTransport {
            writer: tokio::sync::Mutex::new(Some(Box::new(write_half))),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader: Mutex::new(Some(reader)),
        };

        Connection {
            port,
            transport: Arc::new(transport),
            notifications: rx,
        }
    }
}

#[async_trait]
impl Transport for LineTransport {
    async fn request(&self, command: DeviceCommand) -> Result<DeviceReply, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = command.name();
        let line = encode_line(&HostFrame { id, command })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(TransportError::Closed)?;
            writer.write_all(&line).await?;
            writer.flush().await?;
        }
        debug!(id, command = name, "Request written");

        rx.await.map_err(|_| TransportError::Disconnected)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        if let Some(mut writer) = self.writer.lock().await.take() {
            // Best effort; the peer may already be gone.
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.pending.lock().clear();
        Ok(())
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    port: String,
    reader: BufReader<R>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    tx: mpsc::Sender<DeviceNotification>,
) {
    let mut lines = reader.lines();
    let mut device_said_goodbye = false;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(%port, "Stream reached EOF");
                break;
            }
            Err(e) => {
                warn!(%port, error = %e, "Stream read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<DeviceFrame>(&line) {
            Ok(DeviceFrame::Reply(reply)) => {
                let waiter = pending.lock().remove(&reply.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply.result);
                    }
                    None => warn!(%port, id = reply.id, "Reply for unknown or abandoned request"),
                }
            }
            Ok(DeviceFrame::Notification(notification)) => {
                let goodbye = matches!(notification, DeviceNotification::Disconnected);
                if tx.send(notification).await.is_err() {
                    debug!(%port, "Notification receiver dropped");
                    break;
                }
                if goodbye {
                    device_said_goodbye = true;
                    break;
                }
            }
            Err(e) => warn!(%port, error = %e, "Discarding malformed line"),
        }
    }

    closed.store(true, Ordering::Release);
    pending.lock().clear();
    if !device_said_goodbye {
        let _ = tx.send(DeviceNotification::Disconnected).await;
    }
}

// =============================================================================
// SerialConnector
// =============================================================================

#[cfg(feature = "serial")]
pub use self::usb::SerialConnector;

#[cfg(feature = "serial")]
mod usb {
    use super::LineTransport;
    use crate::error::TransportError;
    use crate::transport::{Connection, Connector};
    use async_trait::async_trait;
    use tokio::task::spawn_blocking;
    use tokio_serial::{SerialPortBuilderExt, SerialPortType};

    /// Opens [`LineTransport`]s on USB virtual COM ports.
    #[derive(Debug, Clone)]
    pub struct SerialConnector {
        baud_rate: u32,
        notification_capacity: usize,
    }

    impl SerialConnector {
        /// Create a connector with the given line settings.
        pub fn new(baud_rate: u32, notification_capacity: usize) -> Self {
            Self {
                baud_rate,
                notification_capacity,
            }
        }
    }

    fn join_error(e: tokio::task::JoinError) -> TransportError {
        TransportError::Io(std::io::Error::other(e))
    }

    #[async_trait]
    impl Connector for SerialConnector {
        async fn available_ports(&self) -> Result<Vec<String>, TransportError> {
            let ports = spawn_blocking(tokio_serial::available_ports)
                .await
                .map_err(join_error)?
                .map_err(|e| TransportError::Io(e.into()))?;
            Ok(ports
                .into_iter()
                .filter(|p| matches!(p.port_type, SerialPortType::UsbPort(_)))
                .map(|p| p.port_name)
                .collect())
        }

        async fn open(&self, port: &str) -> Result<Connection, TransportError> {
            let path = port.to_string();
            let baud_rate = self.baud_rate;
            let stream = spawn_blocking(move || {
                tokio_serial::new(&path, baud_rate)
                    .data_bits(tokio_serial::DataBits::Eight)
                    .parity(tokio_serial::Parity::None)
                    .stop_bits(tokio_serial::StopBits::One)
                    .flow_control(tokio_serial::FlowControl::None)
                    .open_native_async()
            })
            .await
            .map_err(join_error)?
            .map_err(|e| match e.kind {
                tokio_serial::ErrorKind::NoDevice => TransportError::PortNotFound(port.to_string()),
                _ => TransportError::Io(e.into()),
            })?;

            Ok(LineTransport::connect(port, stream, self.notification_capacity))
        }
    }
}
