use log::debug;
use serde::{Deserialize, Serialize};

/// Fixed gains for the vertical filter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerticalFilterConfig {
    /// Baro trust in the inertial/baro blend
    pub alpha: f64,
    /// GPS trust when a GPS altitude is present
    pub gps_weight: f64,
    pub baro_bias_learn_rate: f64,
    /// Integration step ceiling (s)
    pub max_step_s: f64,
    /// Elapsed time (s) beyond which the previous state is considered stale
    pub max_gap_s: f64,
}

impl Default for VerticalFilterConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            gps_weight: 0.3,
            baro_bias_learn_rate: 0.0001,
            max_step_s: 0.1,
            max_gap_s: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerticalFilterState {
    pub altitude: f64,
    pub velocity: f64,
    pub last_timestamp: Option<i64>,
    pub accel_bias: f64,
    pub baro_bias: f64,
}

impl Default for VerticalFilterState {
    fn default() -> Self {
        Self {
            altitude: 0.0,
            velocity: 0.0,
            last_timestamp: None,
            accel_bias: 0.0,
            baro_bias: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReseedReason {
    /// Timestamp did not advance
    TimeRegression,
    /// Too long since the previous update
    Gap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// First update after construction or reset
    Seeded,
    /// Continuity was broken; state reinitialised from the latest observation
    Reseeded(ReseedReason),
    Integrated,
}

/// Fixed-gain vertical filter
///
/// Integrates bias-corrected vertical acceleration for a short-term
/// prediction, then pulls the prediction toward barometric altitude (and
/// GPS altitude when there is one) with constant weights. No covariance is
/// propagated, so the output is deterministic and cheap.
///
/// `baro_bias` is learned slowly from the baro/fused residual and exposed
/// for diagnostics. It is not fed back into the barometric input.
pub struct VerticalFilter {
    state: VerticalFilterState,
    config: VerticalFilterConfig,
    updates: u64,
    reseeds: u64,
}

impl VerticalFilter {
    pub fn new(config: VerticalFilterConfig) -> Self {
        Self {
            state: VerticalFilterState::default(),
            config,
            updates: 0,
            reseeds: 0,
        }
    }

    pub fn update(
        &mut self,
        baro_height: f64,
        gps_height: Option<f64>,
        linear_accel_z: f64,
        timestamp: i64,
    ) -> UpdateOutcome {
        let Some(last) = self.state.last_timestamp else {
            self.seed(baro_height, gps_height, timestamp);
            return UpdateOutcome::Seeded;
        };

        let elapsed = (timestamp - last) as f64 / 1000.0;
        if elapsed <= 0.0 || elapsed > self.config.max_gap_s {
            let reason = if elapsed <= 0.0 {
                ReseedReason::TimeRegression
            } else {
                ReseedReason::Gap
            };
            debug!(
                "Vertical filter reseed ({:?}): {:.3}s since last update",
                reason, elapsed
            );
            self.seed(baro_height, gps_height, timestamp);
            self.reseeds += 1;
            return UpdateOutcome::Reseeded(reason);
        }
        let dt = elapsed.min(self.config.max_step_s);
        self.state.last_timestamp = Some(timestamp);

        // Predict
        let a = linear_accel_z - self.state.accel_bias;
        self.state.velocity += a * dt;
        let predicted = self.state.altitude + self.state.velocity * dt;

        // Correct
        let alpha = self.config.alpha;
        let inertial_baro = (1.0 - alpha) * predicted + alpha * baro_height;
        let fused = match gps_height {
            Some(gps) => {
                let w = self.config.gps_weight;
                (1.0 - w) * inertial_baro + w * gps
            }
            None => inertial_baro,
        };

        self.state.altitude = fused;
        self.state.baro_bias += (baro_height - fused) * self.config.baro_bias_learn_rate;
        self.updates += 1;

        UpdateOutcome::Integrated
    }

    fn seed(&mut self, baro_height: f64, gps_height: Option<f64>, timestamp: i64) {
        self.state.altitude = gps_height.unwrap_or(baro_height);
        self.state.velocity = 0.0;
        self.state.baro_bias = 0.0;
        self.state.last_timestamp = Some(timestamp);
    }

    pub fn altitude(&self) -> f64 {
        self.state.altitude
    }

    pub fn vertical_velocity(&self) -> f64 {
        self.state.velocity
    }

    pub fn baro_bias(&self) -> f64 {
        self.state.baro_bias
    }

    pub fn is_seeded(&self) -> bool {
        self.state.last_timestamp.is_some()
    }

    pub fn get_state(&self) -> VerticalFilterState {
        self.state
    }

    /// (integrated updates, reseeds) since construction
    pub fn counters(&self) -> (u64, u64) {
        (self.updates, self.reseeds)
    }

    pub fn reset(&mut self) {
        self.state = VerticalFilterState::default();
    }
}

impl Default for VerticalFilter {
    fn default() -> Self {
        Self::new(VerticalFilterConfig::default())
    }
}
