//! Connection handling for the scale.
//! This module handles connecting to the device and locating the
//! measurement characteristics the read fallback chain uses.

use bluest::{Adapter, Characteristic, Device, Uuid};
use log::info;

use crate::error::{Result, ScaleError};
use crate::protocol::constants::{
    UUID_BODY_COMPOSITION_MEASUREMENT_CHAR, UUID_BODY_COMPOSITION_SERVICE,
    UUID_WEIGHT_MEASUREMENT_CHAR, UUID_WEIGHT_SCALE_SERVICE, UUID_XIAOMI_MEASUREMENT_CHAR,
    UUID_XIAOMI_SCALE_SERVICE,
};
use crate::retry::{RetryConfig, with_conditional_retry};
use crate::session::types::ConnectedScaleState;

/// Connection manager for the scale.
#[derive(Clone)]
pub struct ConnectionManager {
    adapter: Adapter,
    retry: RetryConfig,
}

impl ConnectionManager {
    pub fn new(adapter: Adapter, retry: RetryConfig) -> Self {
        Self { adapter, retry }
    }

    /// Connect to the scale with retry, then discover its measurement
    /// characteristics. A freshly woken scale drops the first attempt more
    /// often than not, hence the backoff loop.
    pub async fn connect_with_retry(&self, device: &Device) -> Result<ConnectedScaleState> {
        with_conditional_retry(
            || self.try_connect(device),
            ScaleError::is_retryable,
            |attempt, err, _delay| {
                info!("Connection attempt {} failed: {}", attempt, err);
            },
            &self.retry,
        )
        .await
    }

    async fn try_connect(&self, device: &Device) -> Result<ConnectedScaleState> {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let id = device.id().to_string();
        info!("Device details - ID: {}, Name: {:?}", id, name);

        if !device.is_connected().await {
            info!("Initiating connection to {}...", id);
            self.adapter.connect_device(device).await?;
        }

        info!("Connection successful, discovering services...");
        let services = device.services().await?;

        let body_composition_char = Self::find_characteristic(
            &services,
            UUID_BODY_COMPOSITION_SERVICE,
            UUID_BODY_COMPOSITION_MEASUREMENT_CHAR,
        )
        .await;
        let weight_char = Self::find_characteristic(
            &services,
            UUID_WEIGHT_SCALE_SERVICE,
            UUID_WEIGHT_MEASUREMENT_CHAR,
        )
        .await;
        let vendor_char = Self::find_characteristic(
            &services,
            UUID_XIAOMI_SCALE_SERVICE,
            UUID_XIAOMI_MEASUREMENT_CHAR,
        )
        .await;

        if body_composition_char.is_none() && weight_char.is_none() && vendor_char.is_none() {
            for service in &services {
                info!("Available service: {}", service.uuid());
            }
            return Err(ScaleError::CharacteristicNotFound);
        }

        info!(
            "Discovered characteristics - body composition: {}, weight: {}, vendor: {}",
            body_composition_char.is_some(),
            weight_char.is_some(),
            vendor_char.is_some()
        );

        Ok(ConnectedScaleState {
            device: device.clone(),
            body_composition_char,
            weight_char,
            vendor_char,
        })
    }

    async fn find_characteristic(
        services: &[bluest::Service],
        service_uuid: Uuid,
        char_uuid: Uuid,
    ) -> Option<Characteristic> {
        let service = services.iter().find(|s| s.uuid() == service_uuid)?;
        let characteristics = service.characteristics().await.ok()?;
        characteristics.into_iter().find(|c| c.uuid() == char_uuid)
    }

    /// Disconnect from the scale.
    pub async fn disconnect(&self, device: &Device) -> Result<()> {
        if device.is_connected().await {
            info!("Disconnecting from device {}", device.id());
            self.adapter.disconnect_device(device).await?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", device.id());
        }
        Ok(())
    }
}
