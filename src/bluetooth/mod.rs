//! Bluetooth layer: GATT backends, device discovery and the connection
//! manager that ties a peer to the framing layer.

pub mod bluez;
pub mod discovery;
pub mod gatt;
pub mod manager;
pub mod memory;
pub mod registry;
