//! Seplos BMS poller
//!
//! Polls Seplos battery packs over an RS-485 bus (local serial device or a
//! serial-over-TCP bridge), decodes their telemetry and telesignalization
//! replies, and publishes one combined record per pack to MQTT or a local
//! JSON sink.
//!
//! [`protocol`] holds the pure frame codec and payload decoders; [`api`]
//! holds the bus scheduler, polling cycles and the publish hand-off. The
//! runtime/boot helpers are kept in hidden modules.

pub mod api;
#[doc(hidden)]
pub mod boot;
#[doc(hidden)]
pub mod cli;
pub mod mqtt;
pub mod protocol;

pub use api::*;
