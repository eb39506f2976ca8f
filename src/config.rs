use crate::error::{TrackerError, TrackerResult};
use crate::filters::VerticalFilterConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub window_size: usize,
    /// Magnitude variance, (m/s²)²
    pub threshold: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            threshold: 2.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub stale_window_ms: i64,
    pub sweep_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_window_ms: 60_000,
            sweep_interval_ms: 5_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub baro_interval_ms: u64,
    pub accel_interval_ms: u64,
    pub gps_interval_ms: u64,
    pub simulation_interval_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            baro_interval_ms: 50,  // ~20 Hz
            accel_interval_ms: 50, // ~20 Hz
            gps_interval_ms: 1_000,
            simulation_interval_ms: 50,
        }
    }
}

/// Every tunable in one place. Missing fields in a config file take these defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub filter: VerticalFilterConfig,
    pub motion: MotionConfig,
    pub sync: SyncConfig,
    pub acquisition: AcquisitionConfig,
    pub history_capacity: usize,
    /// Used until a temperature has been reported
    pub default_temperature_c: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            filter: VerticalFilterConfig::default(),
            motion: MotionConfig::default(),
            sync: SyncConfig::default(),
            acquisition: AcquisitionConfig::default(),
            history_capacity: crate::history::DEFAULT_HISTORY_CAPACITY,
            default_temperature_c: 20.0,
        }
    }
}

impl TrackerConfig {
    pub fn from_json(json: &str) -> TrackerResult<Self> {
        let config: TrackerConfig = serde_json::from_str(json)
            .map_err(|e| TrackerError::Validation(format!("bad config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> TrackerResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| TrackerError::Validation(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> TrackerResult<()> {
        let weights = [("alpha", self.filter.alpha), ("gps_weight", self.filter.gps_weight)];
        for (name, w) in weights {
            if !(0.0..=1.0).contains(&w) {
                return Err(TrackerError::Validation(format!("{name} must be within 0-1, got {w}")));
            }
        }
        if self.filter.max_step_s <= 0.0 || self.filter.max_gap_s <= 0.0 {
            return Err(TrackerError::Validation("filter time limits must be positive".into()));
        }
        if self.motion.window_size == 0 {
            return Err(TrackerError::Validation("motion window must hold at least one sample".into()));
        }
        if self.history_capacity == 0 {
            return Err(TrackerError::Validation("history capacity must be positive".into()));
        }
        if self.sync.stale_window_ms <= 0 || self.sync.sweep_interval_ms == 0 {
            return Err(TrackerError::Validation("sync intervals must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrackerConfig::default();
        assert_eq!(config.filter.alpha, 0.05);
        assert_eq!(config.filter.gps_weight, 0.3);
        assert_eq!(config.filter.baro_bias_learn_rate, 0.0001);
        assert_eq!(config.motion.window_size, 10);
        assert_eq!(config.motion.threshold, 2.0);
        assert_eq!(config.sync.stale_window_ms, 60_000);
        assert_eq!(config.sync.sweep_interval_ms, 5_000);
        assert_eq!(config.history_capacity, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_overrides() {
        let config = TrackerConfig::from_json(r#"{"filter": {"gps_weight": 0.5}, "history_capacity": 60}"#).unwrap();
        assert_eq!(config.filter.gps_weight, 0.5);
        assert_eq!(config.filter.alpha, 0.05);
        assert_eq!(config.history_capacity, 60);
        assert_eq!(config.motion, MotionConfig::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(TrackerConfig::from_json(r#"{"filter": {"alpha": 1.5}}"#).is_err());
        assert!(TrackerConfig::from_json(r#"{"motion": {"window_size": 0}}"#).is_err());
        assert!(TrackerConfig::from_json("not json").is_err());
    }
}
