//! MQTT bridge for a Modbus RTU ventilation controller.
//!
//! The bridge polls the controller's input registers over a half-duplex RS-485
//! line, republishes each valid snapshot as JSON over MQTT and announces
//! Sparkplug-style birth certificates whenever a broker session starts. An
//! operator console on stdin changes the fan mode and polling behavior.
//!
//! # Topics
//!
//! ```text
//! spBv1.0/<group>/NBIRTH/<node>           node birth
//! spBv1.0/<group>/DBIRTH/<node>/<device>  device birth (metric schema)
//! sensors/<node>                          snapshot data
//! ```

pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod publisher;
pub mod reader;
pub mod session;
pub mod snapshot;
pub mod supervisor;
pub mod transport;
