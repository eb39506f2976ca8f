use crate::types::SensorSet;

const BAROMETER_POINTS: u32 = 30;
const GPS_PRECISE_POINTS: u32 = 30;
const GPS_COARSE_POINTS: u32 = 10;
const TEMPERATURE_POINTS: u32 = 5;
const MAGNETOMETER_POINTS: u32 = 10;
const LIGHT_POINTS: u32 = 10;
const STEPS_POINTS: u32 = 5;

const GPS_PRECISE_ACCURACY_M: f64 = 10.0;
const GPS_COARSE_ACCURACY_M: f64 = 30.0;

/// 0-100 trust score from which sensor channels are currently reporting.
///
/// Additive: each available channel contributes a fixed weight. The two GPS
/// accuracy tiers are checked independently, so a fix better than 10 m
/// earns both (40 points). A GPS altitude with unknown accuracy earns none.
pub fn score(sensors: &SensorSet) -> u8 {
    let mut total = 0u32;

    if sensors.pressure.is_some() {
        total += BAROMETER_POINTS;
    }
    if sensors.gps_altitude.is_some() {
        let accuracy = sensors.gps_accuracy.unwrap_or(f64::INFINITY);
        if accuracy < GPS_PRECISE_ACCURACY_M {
            total += GPS_PRECISE_POINTS;
        }
        if accuracy < GPS_COARSE_ACCURACY_M {
            total += GPS_COARSE_POINTS;
        }
    }
    if sensors.temperature.is_some() {
        total += TEMPERATURE_POINTS;
    }
    if sensors.magnetometer.is_some() {
        total += MAGNETOMETER_POINTS;
    }
    if sensors.light_lux.is_some() {
        total += LIGHT_POINTS;
    }
    if sensors.step_count > 0 {
        total += STEPS_POINTS;
    }

    total.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MagSample;

    fn full_set() -> SensorSet {
        SensorSet {
            pressure: Some(1013.0),
            temperature: Some(20.0),
            humidity: Some(40.0),
            accel: None,
            gps_altitude: Some(100.0),
            gps_accuracy: Some(3.0),
            magnetometer: Some(MagSample {
                x: 20.0,
                y: 0.0,
                z: -40.0,
                timestamp: 0,
            }),
            light_lux: Some(300.0),
            step_count: 12,
        }
    }

    #[test]
    fn test_empty_scores_zero() {
        assert_eq!(score(&SensorSet::default()), 0);
    }

    #[test]
    fn test_everything_present_scores_100() {
        assert_eq!(score(&full_set()), 100);
    }

    #[test]
    fn test_gps_tiers_are_additive() {
        let mut set = SensorSet {
            gps_altitude: Some(50.0),
            gps_accuracy: Some(5.0),
            ..SensorSet::default()
        };
        assert_eq!(score(&set), 40);

        set.gps_accuracy = Some(20.0);
        assert_eq!(score(&set), 10);

        set.gps_accuracy = Some(30.0);
        assert_eq!(score(&set), 0);

        set.gps_accuracy = None;
        assert_eq!(score(&set), 0);
    }

    #[test]
    fn test_gps_accuracy_without_altitude_scores_nothing() {
        let set = SensorSet {
            gps_accuracy: Some(1.0),
            ..SensorSet::default()
        };
        assert_eq!(score(&set), 0);
    }

    #[test]
    fn test_barometer_and_temperature() {
        let set = SensorSet {
            pressure: Some(1000.0),
            temperature: Some(18.0),
            ..SensorSet::default()
        };
        assert_eq!(score(&set), 35);
    }

    #[test]
    fn test_always_within_bounds() {
        let base = full_set();
        for mask in 0u32..64 {
            let mut set = base.clone();
            if mask & 1 == 0 {
                set.pressure = None;
            }
            if mask & 2 == 0 {
                set.gps_altitude = None;
            }
            if mask & 4 == 0 {
                set.temperature = None;
            }
            if mask & 8 == 0 {
                set.magnetometer = None;
            }
            if mask & 16 == 0 {
                set.light_lux = None;
            }
            if mask & 32 == 0 {
                set.step_count = 0;
            }
            assert!(score(&set) <= 100);
        }
    }
}
