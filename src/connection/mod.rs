//! Connection management for a single peripheral link
//!
//! This module handles:
//! - Transport selection (Bluetooth serial or WiFi socket) per manager
//! - Asynchronous connect with close-then-reconnect semantics
//! - The WiFi polling read loop and marker frame decoding
//! - Lifecycle events fanned out to subscribers

mod config;
mod events;
mod manager;

pub use config::{BluetoothConfig, BluetoothMode, ManagerConfig, WifiConfig};
pub use events::{ConnectionEvent, EventBus, EventReceiver};
pub use manager::ConnectionManager;
