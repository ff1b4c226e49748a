//! Robot discovery.
//!
//! Scans on the default adapter for a device matching the configured filter:
//! an exact address when one is set, otherwise a name prefix.

use std::{pin::pin, time::Duration};

use bluer::{Adapter, AdapterEvent, Device, Session};
use futures::StreamExt;
use log::{debug, info};
use tokio::time;

use crate::{
   bluetooth::{bluez::BluezPeripheral, gatt::GattError},
   config::{Config, DeviceFilter},
   error::{Result, TransportError},
};

/// Returns true if a device with this identity satisfies `filter`.
pub fn matches_identity(filter: &DeviceFilter, address: &str, name: Option<&str>) -> bool {
   if let Some(wanted) = &filter.address {
      return wanted.eq_ignore_ascii_case(address);
   }
   name.is_some_and(|name| name.starts_with(&filter.name_prefix))
}

fn describe(filter: &DeviceFilter) -> String {
   match &filter.address {
      Some(address) => format!("address {address}"),
      None => format!("name prefix {:?}", filter.name_prefix),
   }
}

async fn is_match(device: &Device, filter: &DeviceFilter) -> bool {
   let address = device.address().to_string();
   let name = device.name().await.ok().flatten();
   matches_identity(filter, &address, name.as_deref())
}

/// Finds the robot, bounded by the configured discovery timeout.
pub async fn select_device(config: &Config) -> Result<BluezPeripheral> {
   let session = Session::new().await.map_err(|e| {
      TransportError::selection("could not open Bluetooth session", Some(GattError::from(e)))
   })?;
   let adapter = session.default_adapter().await.map_err(|e| {
      TransportError::selection("no Bluetooth adapter available", Some(GattError::from(e)))
   })?;

   // Ensure adapter is powered on
   if let Ok(powered) = adapter.is_powered().await
      && !powered
   {
      adapter.set_powered(true).await.map_err(|e| {
         TransportError::selection(
            format!("could not power on adapter {}", adapter.name()),
            Some(GattError::from(e)),
         )
      })?;
      info!("Powered on adapter: {}", adapter.name());
   }

   let timeout = Duration::from_secs(config.discovery_timeout_sec);
   info!(
      "Scanning on {} for {} ({timeout:?})",
      adapter.name(),
      describe(&config.device)
   );
   match time::timeout(timeout, scan(&adapter, &config.device)).await {
      Ok(result) => result,
      Err(_) => Err(TransportError::selection(
         format!("no device with {} found", describe(&config.device)),
         None,
      )),
   }
}

async fn scan(adapter: &Adapter, filter: &DeviceFilter) -> Result<BluezPeripheral> {
   let events = adapter.discover_devices().await.map_err(|e| {
      TransportError::selection("could not start discovery", Some(GattError::from(e)))
   })?;
   let mut events = pin!(events);

   // Already-known devices are reported as added too
   while let Some(event) = events.next().await {
      let AdapterEvent::DeviceAdded(addr) = event else {
         continue;
      };
      let Ok(device) = adapter.device(addr) else {
         continue;
      };
      if is_match(&device, filter).await {
         info!("Selected device {addr}");
         return Ok(BluezPeripheral::new(device));
      }
      debug!("Ignoring device {addr}");
   }

   Err(TransportError::selection("discovery stopped", None))
}
