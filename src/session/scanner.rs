//! Device discovery for supported scales.
//!
//! Wraps the adapter's advertisement stream in a cancellable background
//! task. Scales are recognised by their advertised name prefixes or by the
//! Xiaomi advertisement service id; weak signals below the configured RSSI
//! floor are ignored.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, error, info};
use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScaleError};
use crate::protocol::constants::{
    SCALE_NAME_FALLBACK_PREFIX, SCALE_NAME_PREFIXES, UUID_BODY_COMPOSITION_SERVICE,
    UUID_WEIGHT_SCALE_SERVICE, UUID_XIAOMI_ADVERTISEMENT,
};
use crate::session::events::Subscribers;
use crate::session::types::DeviceInfo;

pub struct ScaleScanner {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    cancel_token: Arc<CancellationToken>,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl ScaleScanner {
    pub fn new(adapter: Adapter, devices: Arc<Mutex<HashMap<String, Device>>>) -> Self {
        Self {
            adapter,
            devices,
            cancel_token: Arc::new(CancellationToken::new()),
            scan_task_handle: None,
        }
    }

    /// Starts a background scan that emits each matching device once and
    /// stops after `timeout`. `on_complete` runs when the task winds down,
    /// whether by timeout, cancellation or stream end.
    pub async fn start_scan(
        &mut self,
        timeout: Duration,
        min_rssi: i16,
        discovered: Arc<Subscribers<DeviceInfo>>,
        on_complete: Box<dyn FnOnce() + Send>,
    ) -> Result<()> {
        // Clear existing devices
        self.devices.lock().unwrap().clear();
        if self.scan_task_handle.is_some() {
            self.stop_scan().await;
        }

        self.cancel_token = Arc::new(CancellationToken::new());
        let cancel_token_for_task = self.cancel_token.clone();
        let adapter_for_task = self.adapter.clone();
        let devices_for_task = self.devices.clone();

        let handle = tokio::spawn(async move {
            let result = tokio::time::timeout(
                timeout,
                Self::internal_scan_task(
                    adapter_for_task,
                    devices_for_task,
                    discovered,
                    cancel_token_for_task,
                    min_rssi,
                ),
            )
            .await;
            if result.is_err() {
                info!("Scan window elapsed.");
            }
            on_complete();
        });

        self.scan_task_handle = Some(handle);
        info!("Device scan task started.");
        Ok(())
    }

    async fn internal_scan_task(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        discovered: Arc<Subscribers<DeviceInfo>>,
        cancel_token: Arc<CancellationToken>,
        min_rssi: i16,
    ) {
        // Already-connected scales never show up in advertisements.
        info!("Checking for connected devices");
        if let Ok(connected) = adapter.connected_devices().await {
            for device in connected {
                if is_scale_name(device.name().ok().as_deref()) {
                    Self::emit_device_found(&devices, &discovered, device, None).await;
                }
            }
        }

        info!("Starting bluetooth scan");
        let mut scan_stream = match adapter.scan(&[]).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                return;
            }
        };

        let mut seen: HashSet<String> = HashSet::new();
        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(adv) => {
                            let device = adv.device;
                            let rssi = adv.rssi;
                            debug!("Found device - Device: {:?}, RSSI: {:?}", device, rssi);

                            if let Some(signal_strength) = rssi {
                                if signal_strength < min_rssi {
                                    continue;
                                }
                            }
                            let name = adv.adv_data.local_name.clone()
                                .or_else(|| device.name().ok());
                            if !is_scale(name.as_deref(), &adv.adv_data.services) {
                                continue;
                            }
                            let id = device.id().to_string();
                            if seen.insert(id) {
                                Self::emit_device_found(&devices, &discovered, device, rssi).await;
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    }

    pub async fn stop_scan(&mut self) {
        info!("Stopping Bluetooth scan.");
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            match handle.await {
                Ok(()) => info!("Scan task finished after cancellation."),
                Err(e) if e.is_cancelled() => info!("Scan task was cancelled."),
                Err(e) => error!("Scan task finished with a join error: {:?}", e),
            }
        }
    }

    /// One-shot discovery: scans for `timeout` and returns every matching
    /// device seen in that window.
    pub async fn scan_for_devices(
        &self,
        timeout: Duration,
        min_rssi: i16,
    ) -> Result<Vec<DeviceInfo>> {
        let mut found = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        if let Ok(connected) = self.adapter.connected_devices().await {
            for device in connected {
                if is_scale_name(device.name().ok().as_deref()) {
                    let info = Self::device_info(&device, None).await;
                    seen.insert(info.id.clone());
                    self.devices
                        .lock()
                        .unwrap()
                        .insert(info.id.clone(), device);
                    found.push(info);
                }
            }
        }

        let mut scan_stream = self.adapter.scan(&[]).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let adv = tokio::select! {
                adv = scan_stream.next() => adv,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            let Some(adv) = adv else { break };

            if let Some(rssi) = adv.rssi {
                if rssi < min_rssi {
                    continue;
                }
            }
            let name = adv
                .adv_data
                .local_name
                .clone()
                .or_else(|| adv.device.name().ok());
            if !is_scale(name.as_deref(), &adv.adv_data.services) {
                continue;
            }
            let info = Self::device_info(&adv.device, adv.rssi).await;
            if seen.insert(info.id.clone()) {
                self.devices
                    .lock()
                    .unwrap()
                    .insert(info.id.clone(), adv.device);
                found.push(info);
            }
        }

        info!("One-shot scan finished, {} device(s) found.", found.len());
        Ok(found)
    }

    /// Resolves a target address to a device handle, scanning if it has not
    /// been discovered yet.
    pub async fn find_device(&self, address: &str, timeout: Duration, min_rssi: i16) -> Result<Device> {
        if let Some(device) = self.lookup(address) {
            return Ok(device);
        }
        self.scan_for_devices(timeout, min_rssi).await?;
        self.lookup(address)
            .ok_or_else(|| ScaleError::DeviceNotFound(address.to_string()))
    }

    fn lookup(&self, address: &str) -> Option<Device> {
        let wanted = normalize_address(address);
        let devices = self.devices.lock().unwrap();
        devices
            .iter()
            .find(|(id, _)| {
                let id_norm = normalize_address(id);
                id_norm.contains(&wanted)
                    || extract_mac_address(id)
                        .map(|mac| normalize_address(&mac) == wanted)
                        .unwrap_or(false)
            })
            .map(|(_, device)| device.clone())
    }

    async fn emit_device_found(
        devices: &Arc<Mutex<HashMap<String, Device>>>,
        discovered: &Arc<Subscribers<DeviceInfo>>,
        device: Device,
        rssi: Option<i16>,
    ) {
        let info = Self::device_info(&device, rssi).await;
        info!(
            "Found scale: Address: {:?}, ID: {}, Name: {:?}, RSSI: {:?}",
            info.address, info.id, info.name, info.rssi
        );
        {
            let mut devices = devices.lock().unwrap();
            devices.insert(info.id.clone(), device);
        }
        discovered.emit(&info);
    }

    async fn device_info(device: &Device, rssi: Option<i16>) -> DeviceInfo {
        let id = device.id().to_string();
        DeviceInfo {
            name: device.name().ok(),
            address: extract_mac_address(&id),
            rssi: match rssi {
                Some(rssi) => Some(rssi),
                None => device.rssi().await.ok(),
            },
            is_connected: device.is_connected().await,
            id,
        }
    }
}

/// Pulls a MAC address out of a platform device id when one is embedded.
pub fn extract_mac_address(device_id_str: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").unwrap();
    re.find_iter(device_id_str)
        .last()
        .map(|m| m.as_str().to_uppercase())
}

fn normalize_address(address: &str) -> String {
    address
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Returns true if this advertisement belongs to a supported scale.
fn is_scale(name: Option<&str>, services: &[uuid::Uuid]) -> bool {
    if is_scale_name(name) {
        return true;
    }
    services.iter().any(|s| {
        *s == UUID_XIAOMI_ADVERTISEMENT
            || *s == UUID_WEIGHT_SCALE_SERVICE
            || *s == UUID_BODY_COMPOSITION_SERVICE
    })
}

fn is_scale_name(name: Option<&str>) -> bool {
    let Some(name) = name else { return false };
    let upper = name.to_uppercase();
    SCALE_NAME_PREFIXES.iter().any(|p| upper.starts_with(p))
        || upper.starts_with(SCALE_NAME_FALLBACK_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_filter_recognizes_known_prefixes() {
        assert!(is_scale_name(Some("MIBFS Scale")));
        assert!(is_scale_name(Some("MIBCS")));
        assert!(is_scale_name(Some("Mi Smart Scale"))); // generic fallback
        assert!(!is_scale_name(Some("Polar H10")));
        assert!(!is_scale_name(None));
    }

    #[test]
    fn service_filter_recognizes_vendor_and_standard_services() {
        assert!(is_scale(None, &[UUID_XIAOMI_ADVERTISEMENT]));
        assert!(is_scale(None, &[UUID_BODY_COMPOSITION_SERVICE]));
        assert!(!is_scale(None, &[]));
    }

    #[test]
    fn mac_extraction_from_platform_ids() {
        assert_eq!(
            extract_mac_address("dev_AA:BB:CC:DD:EE:FF"),
            Some("AA:BB:CC:DD:EE:FF".to_string())
        );
        assert_eq!(extract_mac_address("3f2504e0-4f89"), None);
    }

    #[test]
    fn address_normalization_matches_separators() {
        assert_eq!(normalize_address("AA:BB-CC"), "aabbcc");
        assert_eq!(normalize_address("aabbcc"), "aabbcc");
    }
}
