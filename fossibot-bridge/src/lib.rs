//! MQTT bridge for Fossibot/Sydpower portable power stations.
//!
//! The bridge keeps authenticated sessions against the vendor cloud
//! (three-stage signed handshake, MQTT over WebSocket), translates the
//! devices' Modbus-style binary telemetry into JSON on canonical
//! `fossibot/...` topics of a local broker, and forwards JSON commands
//! back as CRC-signed register writes. One process serves any number of
//! accounts and survives network, token and broker failures on its own.

pub mod bridge;
pub mod cloud;
pub mod config;
pub mod connection;
pub mod modbus;
pub mod mqtt;
pub mod persistence;
pub mod state;

pub use bridge::Bridge;
pub use config::Config;
