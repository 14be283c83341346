//! The scale session, tying scanning, connection and reads together.
//!
//! `ScaleSession` is the single entry point callers hold. It owns the
//! adapter, tracks the connection lifecycle, and fans lifecycle changes,
//! errors and discovered devices out to registered subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bluest::{Adapter, Device};
use log::{info, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::{Result, ScaleError};
use crate::protocol::crypto::parse_ble_key;
use crate::protocol::frame::parse_mac;
use crate::protocol::measurement::RawMeasurement;
use crate::session::connection::ConnectionManager;
use crate::session::events::{Subscribers, Subscription};
use crate::session::scanner::ScaleScanner;
use crate::session::sources::{
    self, BodyCompositionSource, MeasurementSource, VendorEncryptedSource, WeightScaleSource,
};
use crate::session::types::{ConnectedScaleState, ConnectionState, DeviceInfo};

/// How often the background watcher polls the link after connecting.
const DISCONNECT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A session with one body composition scale.
///
/// The session moves through the states of [`ConnectionState`]; every
/// transition is pushed to `on_state_change` subscribers, and every surfaced
/// failure additionally reaches `on_error` subscribers before the error is
/// returned to the caller.
pub struct ScaleSession {
    config: SessionConfig,
    scanner: ScaleScanner,
    connection: ConnectionManager,
    connected: Arc<AsyncMutex<Option<ConnectedScaleState>>>,
    state: Arc<Mutex<ConnectionState>>,
    /// Bind key from the last `connect` call.
    key: Option<[u8; 16]>,
    /// MAC parsed from the connect address, used for decryption when the
    /// vendor frames omit their own.
    target_mac: Option<[u8; 6]>,
    state_subscribers: Arc<Subscribers<ConnectionState>>,
    error_subscribers: Arc<Subscribers<ScaleError>>,
    discovered_subscribers: Arc<Subscribers<DeviceInfo>>,
    read_in_flight: Arc<AtomicBool>,
    watcher_cancel: CancellationToken,
}

impl ScaleSession {
    /// Opens the default Bluetooth adapter and waits for it to come up.
    pub async fn new(config: SessionConfig) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(ScaleError::AdapterUnavailable)?;
        adapter
            .wait_available()
            .await
            .map_err(|_| ScaleError::BluetoothOff)?;

        let devices = Arc::new(Mutex::new(HashMap::new()));
        let scanner = ScaleScanner::new(adapter.clone(), devices);
        let connection = ConnectionManager::new(adapter, config.connect_retry.clone());

        Ok(Self {
            config,
            scanner,
            connection,
            connected: Arc::new(AsyncMutex::new(None)),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            key: None,
            target_mac: None,
            state_subscribers: Arc::new(Subscribers::default()),
            error_subscribers: Arc::new(Subscribers::default()),
            discovered_subscribers: Arc::new(Subscribers::default()),
            read_in_flight: Arc::new(AtomicBool::new(false)),
            watcher_cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn on_state_change(
        &self,
        callback: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        self.state_subscribers.subscribe(callback)
    }

    pub fn on_error(
        &self,
        callback: impl Fn(&ScaleError) + Send + Sync + 'static,
    ) -> Subscription {
        self.error_subscribers.subscribe(callback)
    }

    pub fn on_device_discovered(
        &self,
        callback: impl Fn(&DeviceInfo) + Send + Sync + 'static,
    ) -> Subscription {
        self.discovered_subscribers.subscribe(callback)
    }

    fn set_state(&self, new_state: ConnectionState) {
        set_state(&self.state, &self.state_subscribers, new_state);
    }

    fn surface(&self, err: ScaleError) -> ScaleError {
        log::error!("[{}] {}", err.code(), err);
        if let Some(suggestion) = err.suggestion() {
            info!("Suggestion: {}", suggestion);
        }
        self.error_subscribers.emit(&err);
        err
    }

    /// Starts a background scan; discovered scales are pushed to
    /// `on_device_discovered` subscribers. The scan stops on its own after
    /// `timeout_ms` (falling back to the configured scan window) and the
    /// session returns to disconnected.
    pub async fn scan(&mut self, timeout_ms: Option<u64>) -> Result<()> {
        self.set_state(ConnectionState::Scanning);

        let state = self.state.clone();
        let subscribers = self.state_subscribers.clone();
        let on_complete = Box::new(move || {
            // Only unwind the scanning state; a connect started mid-scan owns
            // the state machine from there.
            let mut guard = state.lock().unwrap();
            if *guard == ConnectionState::Scanning {
                *guard = ConnectionState::Disconnected;
                drop(guard);
                subscribers.emit(&ConnectionState::Disconnected);
            }
        });

        let timeout = timeout_ms.unwrap_or(self.config.scan_timeout_ms);
        self.scanner
            .start_scan(
                Duration::from_millis(timeout),
                self.config.min_rssi,
                self.discovered_subscribers.clone(),
                on_complete,
            )
            .await
            .map_err(|e| self.surface(e))
    }

    /// Cancels a running background scan.
    pub async fn stop_scan(&mut self) {
        self.scanner.stop_scan().await;
        if self.state() == ConnectionState::Scanning {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// One-shot discovery that collects matching devices for one scan
    /// window and returns them all at once.
    pub async fn scan_for_devices(&self, timeout_ms: Option<u64>) -> Result<Vec<DeviceInfo>> {
        let timeout = timeout_ms.unwrap_or(self.config.scan_timeout_ms);
        self.scanner
            .scan_for_devices(Duration::from_millis(timeout), self.config.min_rssi)
            .await
            .map_err(|e| self.surface(e))
    }

    /// Connects to the scale at `address` using the hex-encoded bind key.
    ///
    /// The key is validated before any radio work happens; a malformed key
    /// fails fast without touching the state machine.
    pub async fn connect(&mut self, address: &str, key: &str) -> Result<()> {
        let key = parse_ble_key(key).map_err(|e| self.surface(e))?;
        self.key = Some(key);
        self.target_mac = parse_mac(address).ok();

        // A previous link must be fully torn down first, or its disconnect
        // watcher would keep polling the stale device.
        if self.connected.lock().await.is_some() {
            self.disconnect().await?;
        }

        self.set_state(ConnectionState::Connecting);

        let device = match self
            .scanner
            .find_device(
                address,
                Duration::from_millis(self.config.scan_timeout_ms),
                self.config.min_rssi,
            )
            .await
        {
            Ok(device) => device,
            Err(e) => {
                self.set_state(ConnectionState::Error);
                return Err(self.surface(e));
            }
        };

        let scale_state = match self.connection.connect_with_retry(&device).await {
            Ok(state) => state,
            Err(e) => {
                self.set_state(ConnectionState::Error);
                return Err(self.surface(e));
            }
        };

        self.watcher_cancel.cancel();
        self.watcher_cancel = CancellationToken::new();
        self.spawn_disconnect_watcher(scale_state.device.clone());

        *self.connected.lock().await = Some(scale_state);
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Watches the link and forces the session back to disconnected when the
    /// peripheral drops it (scales power off aggressively between uses).
    fn spawn_disconnect_watcher(&self, device: Device) {
        let state = self.state.clone();
        let subscribers = self.state_subscribers.clone();
        let connected = self.connected.clone();

        spawn_link_watcher(
            self.watcher_cancel.clone(),
            move || {
                let device = device.clone();
                async move { device.is_connected().await }
            },
            move || async move {
                warn!("Scale dropped the connection.");
                *connected.lock().await = None;
                set_state(&state, &subscribers, ConnectionState::Disconnected);
            },
        );
    }

    /// Tears the connection down. Also clears a lingering error state, which
    /// is the only way out of [`ConnectionState::Error`].
    pub async fn disconnect(&mut self) -> Result<()> {
        self.watcher_cancel.cancel();

        if let Some(scale_state) = self.connected.lock().await.take() {
            self.connection
                .disconnect(&scale_state.device)
                .await
                .map_err(|e| self.surface(e))?;
        }

        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Waits for one stable measurement from the connected scale.
    ///
    /// Sources are tried in order of data quality: the standard Body
    /// Composition characteristic (weight plus impedance), then the standard
    /// Weight characteristic, then the vendor characteristic with encrypted
    /// MiBeacon frames. Each source is bounded by `read_timeout_ms`.
    pub async fn read_measurement(&self) -> Result<RawMeasurement> {
        if self.read_in_flight.load(Ordering::SeqCst) {
            return Err(ScaleError::ReadInProgress);
        }
        // A connected handle alone is not enough: a failed read parks the
        // session in the error state with the link still up, and only a
        // disconnect clears it.
        if !read_allowed(self.state()) {
            return Err(self.surface(ScaleError::NotConnected));
        }

        let scale_state = match self.connected.lock().await.clone() {
            Some(state) => state,
            None => return Err(self.surface(ScaleError::NotConnected)),
        };

        if self
            .read_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ScaleError::ReadInProgress);
        }

        self.set_state(ConnectionState::Reading);
        let result = self.run_read_chain(&scale_state).await;
        self.read_in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(measurement) => {
                info!(
                    "Measurement complete: {:.2} kg, impedance {:?}",
                    measurement.weight_kg, measurement.impedance_ohm
                );
                self.set_state(ConnectionState::Connected);
                Ok(measurement)
            }
            Err(e) => {
                self.set_state(ConnectionState::Error);
                Err(self.surface(e))
            }
        }
    }

    async fn run_read_chain(&self, scale_state: &ConnectedScaleState) -> Result<RawMeasurement> {
        let mut chain: Vec<Box<dyn MeasurementSource>> = Vec::new();

        if let Some(characteristic) = scale_state.body_composition_char.clone() {
            chain.push(Box::new(BodyCompositionSource::new(
                characteristic,
                &self.config,
            )));
        }
        if let Some(characteristic) = scale_state.weight_char.clone() {
            chain.push(Box::new(WeightScaleSource::new(characteristic, &self.config)));
        }
        if let Some(characteristic) = scale_state.vendor_char.clone() {
            match self.key {
                Some(key) => chain.push(Box::new(VendorEncryptedSource::new(
                    characteristic,
                    key,
                    self.target_mac,
                    &self.config,
                ))),
                None => warn!("Vendor characteristic present but no bind key; skipping it."),
            }
        }

        if chain.is_empty() {
            return Err(ScaleError::CharacteristicNotFound);
        }

        sources::first_success(&mut chain, Duration::from_millis(self.config.read_timeout_ms)).await
    }
}

/// Polls `probe` until it reports the link is gone, then runs `on_drop`.
/// Cancelling the token stops the task without running `on_drop`.
fn spawn_link_watcher<P, PFut, D, DFut>(
    cancel: CancellationToken,
    mut probe: P,
    on_drop: D,
) -> tokio::task::JoinHandle<()>
where
    P: FnMut() -> PFut + Send + 'static,
    PFut: std::future::Future<Output = bool> + Send,
    D: FnOnce() -> DFut + Send + 'static,
    DFut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(DISCONNECT_POLL_INTERVAL) => {}
            }
            if !probe().await {
                on_drop().await;
                return;
            }
        }
    })
}

/// Reads are only legal from the connected state; in particular an `error`
/// state left by a failed read must be cleared by a disconnect first.
fn read_allowed(state: ConnectionState) -> bool {
    state == ConnectionState::Connected
}

fn set_state(
    state: &Arc<Mutex<ConnectionState>>,
    subscribers: &Arc<Subscribers<ConnectionState>>,
    new_state: ConnectionState,
) {
    let mut guard = state.lock().unwrap();
    if *guard == new_state {
        return;
    }
    info!("Session state: {} -> {}", *guard, new_state);
    *guard = new_state;
    drop(guard);
    subscribers.emit(&new_state);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_state_emits_only_on_change() {
        let state = Arc::new(Mutex::new(ConnectionState::Disconnected));
        let subscribers: Arc<Subscribers<ConnectionState>> = Arc::new(Subscribers::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_for_cb = seen.clone();
        let _sub = subscribers.subscribe(move |s: &ConnectionState| {
            seen_for_cb.lock().unwrap().push(*s);
        });

        set_state(&state, &subscribers, ConnectionState::Scanning);
        set_state(&state, &subscribers, ConnectionState::Scanning);
        set_state(&state, &subscribers, ConnectionState::Connecting);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectionState::Scanning, ConnectionState::Connecting]
        );
        assert_eq!(*state.lock().unwrap(), ConnectionState::Connecting);
    }

    #[test]
    fn reads_are_only_allowed_while_connected() {
        assert!(read_allowed(ConnectionState::Connected));
        // An error left by a failed read blocks further reads until a
        // disconnect resets the session.
        assert!(!read_allowed(ConnectionState::Error));
        assert!(!read_allowed(ConnectionState::Disconnected));
        assert!(!read_allowed(ConnectionState::Scanning));
        assert!(!read_allowed(ConnectionState::Connecting));
        assert!(!read_allowed(ConnectionState::Reading));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_watcher_stops_polling_while_replacement_runs() {
        use std::sync::atomic::AtomicU32;

        let old_polls = Arc::new(AtomicU32::new(0));
        let old_token = CancellationToken::new();
        let polls = old_polls.clone();
        let old_handle = spawn_link_watcher(
            old_token.clone(),
            move || {
                polls.fetch_add(1, Ordering::SeqCst);
                async { true }
            },
            || async {},
        );

        tokio::time::sleep(DISCONNECT_POLL_INTERVAL * 3).await;
        assert!(old_polls.load(Ordering::SeqCst) >= 2);

        // Reconnecting cancels the old watcher before installing a new one.
        old_token.cancel();
        old_handle.await.unwrap();
        let stale_polls = old_polls.load(Ordering::SeqCst);

        let new_polls = Arc::new(AtomicU32::new(0));
        let polls = new_polls.clone();
        let _new_handle = spawn_link_watcher(
            CancellationToken::new(),
            move || {
                polls.fetch_add(1, Ordering::SeqCst);
                async { true }
            },
            || async {},
        );

        tokio::time::sleep(DISCONNECT_POLL_INTERVAL * 3).await;
        assert_eq!(old_polls.load(Ordering::SeqCst), stale_polls);
        assert!(new_polls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_runs_on_drop_when_the_link_goes_down() {
        use std::sync::atomic::{AtomicBool, AtomicU32};

        let dropped = Arc::new(AtomicBool::new(false));
        let dropped_in_cb = dropped.clone();
        let up = Arc::new(AtomicU32::new(2));
        let up_in_probe = up.clone();
        let handle = spawn_link_watcher(
            CancellationToken::new(),
            move || {
                let remaining = up_in_probe.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    Some(n.saturating_sub(1))
                });
                async move { remaining.unwrap() > 0 }
            },
            move || async move {
                dropped_in_cb.store(true, Ordering::SeqCst);
            },
        );

        handle.await.unwrap();
        assert!(dropped.load(Ordering::SeqCst));
    }
}
