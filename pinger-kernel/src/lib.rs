//! Adaptive pinger and SNMP collector.
//!
//! One supervisor loop probes every registered device each cycle, keeps the
//! last known state per device, persists only log-worthy observations,
//! notifies on up/down transitions and tunes its own concurrency and check
//! interval from what it observes.

pub mod config;
pub mod governor;
pub mod health;
pub mod http;
pub mod log_buffer;
pub mod logging;
pub mod models;
pub mod mqtt;
pub mod notifier;
pub mod ports;
pub mod probe;
pub mod registry;
pub mod settings;
pub mod state;
pub mod supervisor;
pub mod tracker;
