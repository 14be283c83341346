//! Measurement sources and the fallback chain.
//!
//! One read cycle tries an ordered list of named sources, each bounded by
//! its own timeout; the first source that produces a weight wins. A source
//! that times out or errors degrades to the next one, and only exhausting
//! the whole chain fails the read.

use std::time::Duration;

use async_trait::async_trait;
use bluest::Characteristic;
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::error::{Result, ScaleError};
use crate::protocol::crypto::{self, DecryptionParams};
use crate::protocol::frame;
use crate::protocol::measurement::{
    RawMeasurement, StabilityTracker, parse_advertisement_data, parse_body_composition,
    parse_weight_measurement,
};

/// One way of obtaining a measurement from the connected scale.
#[async_trait]
pub trait MeasurementSource: Send {
    fn name(&self) -> &'static str;

    /// Waits for the source to produce one validated measurement.
    async fn read(&mut self) -> Result<RawMeasurement>;
}

/// Runs the sources in order and returns the first measurement produced.
///
/// Each source gets its own `per_source_timeout`; a fired timeout cancels
/// only that source. When every source is exhausted the most specific
/// non-retryable error seen is returned, then the last
/// [`ScaleError::ReadTimeout`], then [`ScaleError::ReadFailed`].
pub async fn first_success(
    sources: &mut [Box<dyn MeasurementSource>],
    per_source_timeout: Duration,
) -> Result<RawMeasurement> {
    let mut fatal: Option<ScaleError> = None;
    let mut timed_out: Option<ScaleError> = None;

    for source in sources.iter_mut() {
        let name = source.name();
        info!("Trying measurement source '{}'", name);
        match tokio::time::timeout(per_source_timeout, source.read()).await {
            Ok(Ok(measurement)) => {
                info!("Source '{}' produced {:.2} kg", name, measurement.weight_kg);
                return Ok(measurement);
            }
            Ok(Err(err)) => {
                warn!("Source '{}' failed: {}", name, err);
                if !err.is_retryable() {
                    fatal = Some(err);
                }
            }
            Err(_) => {
                let err = ScaleError::ReadTimeout(name);
                warn!("{}", err);
                timed_out = Some(err);
            }
        }
    }

    Err(fatal.or(timed_out).unwrap_or(ScaleError::ReadFailed))
}

/// Drops readings that arrive faster than the debounce threshold, keeping
/// the first reading of each burst.
struct Debouncer {
    threshold: Duration,
    last: Option<Instant>,
}

impl Debouncer {
    fn new(threshold_ms: u64) -> Self {
        Self {
            threshold: Duration::from_millis(threshold_ms),
            last: None,
        }
    }

    fn accept(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.threshold => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Standard Body Composition Measurement (0x2A9C) notifications.
pub struct BodyCompositionSource {
    characteristic: Characteristic,
    tracker: StabilityTracker,
    debouncer: Debouncer,
}

impl BodyCompositionSource {
    pub fn new(characteristic: Characteristic, config: &SessionConfig) -> Self {
        Self {
            characteristic,
            tracker: StabilityTracker::new(config.stability_threshold, config.stability_tolerance_kg),
            debouncer: Debouncer::new(config.measurement_debounce_ms),
        }
    }
}

#[async_trait]
impl MeasurementSource for BodyCompositionSource {
    fn name(&self) -> &'static str {
        "body-composition"
    }

    async fn read(&mut self) -> Result<RawMeasurement> {
        self.tracker.reset();
        let mut stream = self.characteristic.notify().await?;
        while let Some(value) = stream.next().await {
            let value = value?;
            debug!("Body composition notification: {:02x?}", value);
            if !self.debouncer.accept() {
                continue;
            }
            let Some(reading) = parse_body_composition(&value) else {
                continue;
            };
            let Some(weight_kg) = reading.weight_kg else {
                continue;
            };
            if self.tracker.check(weight_kg) {
                return Ok(RawMeasurement::new(weight_kg, reading.impedance_ohm));
            }
        }
        Err(ScaleError::ReadFailed)
    }
}

/// Standard Weight Measurement (0x2A9D) notifications.
pub struct WeightScaleSource {
    characteristic: Characteristic,
    tracker: StabilityTracker,
    debouncer: Debouncer,
}

impl WeightScaleSource {
    pub fn new(characteristic: Characteristic, config: &SessionConfig) -> Self {
        Self {
            characteristic,
            tracker: StabilityTracker::new(config.stability_threshold, config.stability_tolerance_kg),
            debouncer: Debouncer::new(config.measurement_debounce_ms),
        }
    }
}

#[async_trait]
impl MeasurementSource for WeightScaleSource {
    fn name(&self) -> &'static str {
        "weight-scale"
    }

    async fn read(&mut self) -> Result<RawMeasurement> {
        self.tracker.reset();
        let mut stream = self.characteristic.notify().await?;
        while let Some(value) = stream.next().await {
            let value = value?;
            debug!("Weight notification: {:02x?}", value);
            if !self.debouncer.accept() {
                continue;
            }
            let Some(reading) = parse_weight_measurement(&value) else {
                continue;
            };
            // 0x2A9D has no stability flag; require consecutive agreement.
            if self.tracker.check(reading.weight_kg) {
                return Ok(RawMeasurement::new(reading.weight_kg, None));
            }
        }
        Err(ScaleError::ReadFailed)
    }
}

/// Vendor characteristic carrying MiBeacon frames, encrypted with the
/// device bind key.
pub struct VendorEncryptedSource {
    characteristic: Characteristic,
    key: [u8; 16],
    /// Address from the connect call, used when the frame omits its MAC.
    fallback_mac: Option<[u8; 6]>,
    verify_mic: bool,
    debouncer: Debouncer,
}

impl VendorEncryptedSource {
    pub fn new(
        characteristic: Characteristic,
        key: [u8; 16],
        fallback_mac: Option<[u8; 6]>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            characteristic,
            key,
            fallback_mac,
            verify_mic: config.verify_mic,
            debouncer: Debouncer::new(config.measurement_debounce_ms),
        }
    }

    fn decode_frame(&self, bytes: &[u8]) -> Result<Option<RawMeasurement>> {
        let Some(adv) = frame::decode_advertisement(bytes) else {
            return Ok(None);
        };
        let Some(payload) = adv.payload.as_deref() else {
            return Ok(None);
        };

        let plaintext;
        let objects: &[u8] = if adv.frame_control.is_encrypted {
            let mac = match adv.mac.as_deref() {
                Some(mac) => frame::parse_mac(mac)?,
                None => match self.fallback_mac {
                    Some(mac) => mac,
                    None => return Ok(None),
                },
            };
            let params = DecryptionParams {
                payload,
                key: &self.key,
                frame_counter: adv.frame_counter,
                mac,
                product_id: adv.product_id,
                frame_control_bits: adv.frame_control_bits,
            };
            plaintext = if self.verify_mic {
                crypto::decrypt(&params)?
            } else {
                crypto::decrypt_unverified(&params)?
            };
            &plaintext
        } else {
            payload
        };

        let parsed = parse_advertisement_data(objects);
        Ok(parsed
            .weight_kg
            .map(|weight_kg| RawMeasurement::new(weight_kg, parsed.impedance_ohm)))
    }
}

#[async_trait]
impl MeasurementSource for VendorEncryptedSource {
    fn name(&self) -> &'static str {
        "vendor-encrypted"
    }

    async fn read(&mut self) -> Result<RawMeasurement> {
        let mut stream = self.characteristic.notify().await?;
        while let Some(value) = stream.next().await {
            let value = value?;
            debug!("Vendor notification: {:02x?}", value);
            if !self.debouncer.accept() {
                continue;
            }
            if let Some(measurement) = self.decode_frame(&value)? {
                return Ok(measurement);
            }
        }
        Err(ScaleError::ReadFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubSource {
        name: &'static str,
        outcome: Option<Result<RawMeasurement>>,
        hang: bool,
        calls: std::sync::Arc<std::sync::atomic::AtomicU32>,
    }

    impl StubSource {
        fn boxed(
            name: &'static str,
            outcome: Result<RawMeasurement>,
            calls: std::sync::Arc<std::sync::atomic::AtomicU32>,
        ) -> Box<dyn MeasurementSource> {
            Box::new(Self {
                name,
                outcome: Some(outcome),
                hang: false,
                calls,
            })
        }

        fn hanging(
            name: &'static str,
            calls: std::sync::Arc<std::sync::atomic::AtomicU32>,
        ) -> Box<dyn MeasurementSource> {
            Box::new(Self {
                name,
                outcome: None,
                hang: true,
                calls,
            })
        }
    }

    #[async_trait]
    impl MeasurementSource for StubSource {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn read(&mut self) -> Result<RawMeasurement> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.outcome.take().unwrap()
        }
    }

    fn counter() -> std::sync::Arc<std::sync::atomic::AtomicU32> {
        std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0))
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_stops_at_first_weight() {
        let first = counter();
        let second = counter();
        let mut sources = vec![
            StubSource::boxed("a", Ok(RawMeasurement::new(75.5, None)), first.clone()),
            StubSource::boxed("b", Ok(RawMeasurement::new(80.0, None)), second.clone()),
        ];

        let result = first_success(&mut sources, Duration::from_secs(30)).await.unwrap();
        assert_eq!(result.weight_kg, 75.5);
        assert_eq!(first.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(second.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_source_degrades_to_next() {
        let hung = counter();
        let next = counter();
        let mut sources = vec![
            StubSource::hanging("hung", hung.clone()),
            StubSource::boxed("next", Ok(RawMeasurement::new(62.3, Some(480))), next.clone()),
        ];

        let result = first_success(&mut sources, Duration::from_secs(30)).await.unwrap();
        assert_eq!(result.weight_kg, 62.3);
        assert_eq!(result.impedance_ohm, Some(480));
        assert_eq!(hung.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_the_fatal_error() {
        let mut sources = vec![
            StubSource::boxed("a", Err(ScaleError::ReadFailed), counter()),
            StubSource::boxed(
                "b",
                Err(ScaleError::DecryptionFailed("MIC verification failed".into())),
                counter(),
            ),
        ];

        let err = first_success(&mut sources, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::DecryptionFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_by_timeouts_names_the_timed_out_source() {
        let mut sources = vec![
            StubSource::hanging("a", counter()),
            StubSource::hanging("b", counter()),
        ];

        let err = first_success(&mut sources, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::ReadTimeout("b")));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_by_plain_failures_is_read_failed() {
        let mut sources = vec![
            StubSource::boxed("a", Err(ScaleError::ReadFailed), counter()),
            StubSource::boxed("b", Err(ScaleError::ReadFailed), counter()),
        ];

        let err = first_success(&mut sources, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ScaleError::ReadFailed));
    }
}
