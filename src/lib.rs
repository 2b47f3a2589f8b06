//! # echem_daq
//!
//! Control and telemetry library for multichannel potentiostat/galvanostat
//! instruments. Experiments are composed on the host from electrochemical
//! elements, flattened into an execution plan, uploaded to a device channel
//! and run there, while the device streams measurements and lifecycle
//! notifications back.
//!
//! ## Crate Structure
//!
//! - **`elements`**: the closed set of parameterized measurement elements
//!   (open circuit, constant current/potential, sweeps, pulses, EIS).
//! - **`experiment`**: the nested, repeatable experiment tree and the
//!   deterministic flattener producing an `ExecutionPlan`.
//! - **`session`**: the per-channel state machine, limits and link groups.
//! - **`events`**: sample types, provenances and the events published to
//!   subscribers.
//! - **`handler`**: `InstrumentHandle`, the host-side handle of one
//!   connected device and its notification dispatcher.
//! - **`registry`**: `DeviceRegistry`, connecting devices, detecting
//!   disconnects and updating firmware.
//! - **`transport`**: the command/notification seam, a JSON line transport
//!   and (with the `serial` feature) a USB serial connector.
//! - **`sim`**: simulated instruments for tests and demonstrations.
//! - **`config`** / **`logging`**: Figment configuration and tracing setup.
//! - **`error`**: the `InstrumentError` taxonomy with stable result codes.

pub mod config;
pub mod elements;
pub mod error;
pub mod events;
pub mod experiment;
pub mod handler;
pub mod logging;
pub mod registry;
pub mod session;
pub mod sim;
pub mod transport;

pub use error::{ErrorCategory, InstrumentError, InstrumentResult, Operation, TransportError};
pub use events::{EventKind, InstrumentEvent, RegistryEvent, StopReason};
pub use experiment::{flatten, ExecutionPlan, Experiment};
pub use handler::{HandleSettings, InstrumentHandle};
pub use registry::DeviceRegistry;
