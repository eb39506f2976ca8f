//! Multi-device height reconciliation.
//!
//! Sync is a purely local scalar: the difference between a reference height
//! (read off another device) and this device's fused height, added to every
//! displayed value. Known devices are kept in a registry keyed by id and
//! filtered by age when read.

use crate::error::{ensure_finite, Persisted, TrackerError, TrackerResult};
use crate::store::{load_json, save_json, KeyValueStore, DEVICES_KEY, SYNC_OFFSET_KEY};
use crate::types::Clock;
use futures::future::BoxFuture;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEFAULT_STALE_WINDOW_MS: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub current_height: f64,
    pub last_sync_height: f64,
    /// Epoch milliseconds
    pub last_sync_time: i64,
    pub offset: f64,
}

/// Device seen by the discovery layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyDevice {
    pub id: String,
    pub display_name: String,
    pub rssi: i32,
    pub last_seen: i64,
}

/// Nearby-device discovery and transport, implemented outside this crate
/// (Bluetooth or otherwise). Only the scalar height from `connect` is used.
pub trait DeviceDiscovery: Send + Sync {
    fn scan(&self, on_devices: Box<dyn Fn(Vec<NearbyDevice>) + Send + Sync>);
    fn stop_scan(&self);
    /// Height currently reported by the remote device.
    fn connect(&self, id: &str) -> BoxFuture<'_, TrackerResult<f64>>;
}

pub struct DeviceSyncCoordinator {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    devices: BTreeMap<String, DeviceRecord>,
    offset: f64,
    stale_window_ms: i64,
    local_id: String,
}

impl DeviceSyncCoordinator {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, stale_window_ms: i64) -> Self {
        let local_id = format!("device_{}", clock.now_ms());
        Self {
            store,
            clock,
            devices: BTreeMap::new(),
            offset: 0.0,
            stale_window_ms,
            local_id,
        }
    }

    /// Restore the persisted offset and registry. Missing records leave the defaults.
    pub fn load(&mut self) -> TrackerResult<()> {
        if let Some(offset) = load_json::<f64>(self.store.as_ref(), SYNC_OFFSET_KEY)? {
            self.offset = offset;
        }
        if let Some(entries) = load_json::<Vec<(String, DeviceRecord)>>(self.store.as_ref(), DEVICES_KEY)? {
            self.devices = entries.into_iter().collect();
        }
        info!(
            "Sync state loaded: offset {:.2} m, {} known device(s)",
            self.offset,
            self.devices.len()
        );
        Ok(())
    }

    pub fn local_device_id(&self) -> &str {
        &self.local_id
    }

    /// Insert or overwrite the record for `id`, stamped now with zero offset.
    pub fn register_device(&mut self, id: &str, current_height: f64) -> Persisted<DeviceRecord> {
        let record = DeviceRecord {
            id: id.to_string(),
            current_height,
            last_sync_height: current_height,
            last_sync_time: self.clock.now_ms(),
            offset: 0.0,
        };
        self.devices.insert(id.to_string(), record.clone());
        let written = self.persist_devices();
        Persisted::new(record, written)
    }

    /// Update the height of a known device. Unknown ids are ignored.
    pub fn update_device_height(&mut self, id: &str, height: f64) -> bool {
        match self.devices.get_mut(id) {
            Some(record) => {
                record.current_height = height;
                true
            }
            None => false,
        }
    }

    pub fn device(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    /// Records synced within the stale window. Older records stay in the registry.
    pub fn connected_devices(&self) -> Vec<DeviceRecord> {
        let now = self.clock.now_ms();
        self.devices
            .values()
            .filter(|d| now - d.last_sync_time < self.stale_window_ms)
            .cloned()
            .collect()
    }

    /// Mean height of the connected devices, 0 when there are none.
    pub fn compute_group_sync(&self) -> f64 {
        let connected = self.connected_devices();
        if connected.is_empty() {
            return 0.0;
        }
        connected.iter().map(|d| d.current_height).sum::<f64>() / connected.len() as f64
    }

    /// Align this device with a reference height read elsewhere.
    ///
    /// Sets the display offset to `remote_height - local_height` so that
    /// `apply_sync_offset(local_height) == remote_height`, and records the
    /// local device at `local_height`.
    pub fn apply_manual_sync(&mut self, remote_height: f64, local_height: f64) -> TrackerResult<Persisted<f64>> {
        ensure_finite("remote height", remote_height)?;
        ensure_finite("local height", local_height)?;

        let local_id = self.local_id.clone();
        let registered = self.register_device(&local_id, local_height);

        let offset = remote_height - local_height;
        self.offset = offset;
        info!("Sync applied: offset {:.2} m", offset);

        let saved = save_json(self.store.as_ref(), SYNC_OFFSET_KEY, &offset);
        let written = match registered.persist_error {
            Some(e) => Err(e),
            None => saved,
        };
        if let Err(e) = &written {
            warn!("Sync offset not persisted, it will be lost on restart: {}", e);
        }
        Ok(Persisted::new(offset, written))
    }

    /// Read a remote device's height over the discovery transport and sync to it.
    pub async fn sync_with_device(
        &mut self,
        discovery: &dyn DeviceDiscovery,
        id: &str,
        local_height: f64,
    ) -> TrackerResult<Persisted<f64>> {
        let remote_height = discovery.connect(id).await?;
        ensure_finite("remote height", remote_height)?;
        let registered = self.register_device(id, remote_height);
        let mut synced = self.apply_manual_sync(remote_height, local_height)?;
        // A later registry write can succeed without the peer's record having landed
        if synced.persist_error.is_none() {
            synced.persist_error = registered.persist_error;
        }
        Ok(synced)
    }

    pub fn apply_sync_offset(&self, height: f64) -> f64 {
        height + self.offset
    }

    pub fn sync_offset(&self) -> f64 {
        self.offset
    }

    fn persist_devices(&self) -> TrackerResult<()> {
        let entries: Vec<(&String, &DeviceRecord)> = self.devices.iter().collect();
        save_json(self.store.as_ref(), DEVICES_KEY, &entries).map_err(|e| {
            warn!("Device registry not persisted: {}", e);
            e
        })
    }
}

/// Discovery used when no transport is available: finds nothing, connects to nothing.
pub struct NoDiscovery;

impl DeviceDiscovery for NoDiscovery {
    fn scan(&self, on_devices: Box<dyn Fn(Vec<NearbyDevice>) + Send + Sync>) {
        on_devices(Vec::new());
    }

    fn stop_scan(&self) {}

    fn connect(&self, id: &str) -> BoxFuture<'_, TrackerResult<f64>> {
        let err = TrackerError::Unavailable(format!("no discovery transport to reach {id}"));
        Box::pin(async move { Err(err) })
    }
}
