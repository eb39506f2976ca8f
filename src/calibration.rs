use crate::error::{ensure_finite, Persisted, TrackerError, TrackerResult};
use crate::store::{load_json, save_json, KeyValueStore, CALIBRATION_KEY};
use crate::types::Clock;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Physical reference point all reported heights are measured from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationState {
    /// hPa
    pub reference_pressure: f64,
    /// m
    pub reference_height: f64,
    /// °C
    pub reference_temperature: f64,
    /// Epoch milliseconds
    pub timestamp: i64,
}

/// Owns the current calibration and its persisted copy.
pub struct CalibrationStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    current: Option<CalibrationState>,
    /// Set by the first calibrate or clear; a late restore must not undo either
    touched: bool,
}

impl CalibrationStore {
    /// Starts uncalibrated. Call [`load`](Self::load) or [`restore`](Self::restore) to pick up a persisted reference.
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            current: None,
            touched: false,
        }
    }

    /// Take a new reference snapshot, replacing any previous calibration.
    ///
    /// The snapshot is applied even if writing it fails; the write error is
    /// returned alongside so the caller can warn it won't survive a restart.
    pub fn calibrate(
        &mut self,
        pressure: f64,
        temperature: f64,
        known_height: f64,
    ) -> TrackerResult<Persisted<CalibrationState>> {
        ensure_finite("pressure", pressure)?;
        ensure_finite("temperature", temperature)?;
        ensure_finite("known height", known_height)?;
        if pressure <= 0.0 {
            return Err(TrackerError::Validation(format!(
                "reference pressure must be positive, got {pressure} hPa"
            )));
        }

        let state = CalibrationState {
            reference_pressure: pressure,
            reference_height: known_height,
            reference_temperature: temperature,
            timestamp: self.clock.now_ms(),
        };
        self.current = Some(state);
        self.touched = true;
        info!(
            "Calibrated: {:.2} hPa, {:.1} °C => {:.2} m",
            pressure, temperature, known_height
        );

        let written = save_json(self.store.as_ref(), CALIBRATION_KEY, &state);
        if let Err(e) = &written {
            warn!("Calibration not persisted, it will be lost on restart: {}", e);
        }
        Ok(Persisted::new(state, written))
    }

    /// Read the persisted calibration. Absence is `Ok(None)`.
    ///
    /// Does not touch the in-memory state; the result is applied with
    /// [`restore`](Self::restore) once loading completes.
    pub fn load(&self) -> TrackerResult<Option<CalibrationState>> {
        load_json(self.store.as_ref(), CALIBRATION_KEY)
    }

    /// Install a loaded calibration unless it was calibrated or cleared in
    /// the meantime.
    pub fn restore(&mut self, loaded: Option<CalibrationState>) {
        if self.touched || self.current.is_some() {
            debug!("Ignoring loaded calibration, superseded in this session");
            return;
        }
        if let Some(state) = loaded {
            info!(
                "Restored calibration from {}: {:.2} hPa => {:.2} m",
                state.timestamp, state.reference_pressure, state.reference_height
            );
            self.current = Some(state);
        }
    }

    /// Forget the calibration. Conversions return no value until recalibrated.
    pub fn clear(&mut self) -> Persisted<()> {
        self.current = None;
        self.touched = true;
        info!("Calibration cleared");
        let removed = self.store.remove(CALIBRATION_KEY);
        if let Err(e) = &removed {
            warn!("Failed to remove persisted calibration: {}", e);
        }
        Persisted::new((), removed)
    }

    pub fn current(&self) -> Option<&CalibrationState> {
        self.current.as_ref()
    }

    pub fn is_calibrated(&self) -> bool {
        self.current.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::ManualClock;

    fn new_store() -> (Arc<MemoryStore>, CalibrationStore) {
        let backing = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = CalibrationStore::new(backing.clone(), clock);
        (backing, store)
    }

    #[test]
    fn test_calibrate_persists_and_loads() {
        let (backing, mut store) = new_store();
        let result = store.calibrate(1013.25, 20.0, 3.0).unwrap();
        assert!(result.is_durable());
        assert_eq!(result.value.timestamp, 1_700_000_000_000);

        let mut restarted = CalibrationStore::new(backing, Arc::new(ManualClock::new(0)));
        assert!(!restarted.is_calibrated());
        let loaded = restarted.load().unwrap();
        assert_eq!(loaded, Some(result.value));
        restarted.restore(loaded);
        assert_eq!(restarted.current(), Some(&result.value));
    }

    #[test]
    fn test_recalibration_overwrites() {
        let (_, mut store) = new_store();
        store.calibrate(1013.25, 20.0, 0.0).unwrap();
        store.calibrate(990.0, 12.0, 150.0).unwrap();

        let current = store.current().unwrap();
        assert_eq!(current.reference_pressure, 990.0);
        assert_eq!(current.reference_height, 150.0);
        assert_eq!(store.load().unwrap().unwrap().reference_pressure, 990.0);
    }

    #[test]
    fn test_load_absent_is_not_an_error() {
        let (_, store) = new_store();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_rejects_non_finite_input() {
        let (_, mut store) = new_store();
        assert!(matches!(
            store.calibrate(f64::NAN, 20.0, 0.0),
            Err(TrackerError::Validation(_))
        ));
        assert!(store.calibrate(1000.0, f64::INFINITY, 0.0).is_err());
        assert!(store.calibrate(0.0, 20.0, 0.0).is_err());
        assert!(!store.is_calibrated());
    }

    #[test]
    fn test_write_failure_keeps_session_calibration() {
        let (backing, mut store) = new_store();
        backing.set_failing(true);

        let result = store.calibrate(1000.0, 20.0, 0.0).unwrap();
        assert!(!result.is_durable());
        assert!(store.is_calibrated());
    }

    #[test]
    fn test_clear() {
        let (_, mut store) = new_store();
        store.calibrate(1000.0, 20.0, 0.0).unwrap();
        assert!(store.clear().is_durable());
        assert!(!store.is_calibrated());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_restore_does_not_override_fresh_calibration() {
        let (_, mut store) = new_store();
        let fresh = store.calibrate(1005.0, 20.0, 10.0).unwrap().value;
        let stale = CalibrationState {
            reference_pressure: 1013.25,
            reference_height: 0.0,
            reference_temperature: 20.0,
            timestamp: 1,
        };
        store.restore(Some(stale));
        assert_eq!(store.current(), Some(&fresh));
    }

    #[test]
    fn test_restore_after_clear_stays_cleared() {
        let (backing, mut store) = new_store();
        store.calibrate(1005.0, 20.0, 10.0).unwrap();

        // Read at startup, applied only after the user cleared
        let mut restarted = CalibrationStore::new(backing, Arc::new(ManualClock::new(0)));
        let loaded = restarted.load().unwrap();
        assert!(loaded.is_some());
        restarted.clear();
        restarted.restore(loaded);

        assert!(!restarted.is_calibrated());
        assert_eq!(restarted.load().unwrap(), None);
    }
}
