/// Barometric altitude conversion
/// Hypsometric equation with virtual-temperature (humidity) compensation,
/// measured relative to the current calibration reference.
use crate::calibration::CalibrationState;
use crate::error::{ensure_finite, TrackerError, TrackerResult};
use crate::types::SensorSample;

const KELVIN_OFFSET: f64 = 273.15;
const LAPSE_RATE: f64 = 0.0065; // K/m
const HYPSOMETRIC_EXPONENT: f64 = 5.25588;
/// Ratio of the gas constants of dry air and water vapour
const EPSILON: f64 = 0.622;

// Magnus formula coefficients (hPa, °C)
const MAGNUS_A: f64 = 6.112;
const MAGNUS_B: f64 = 17.67;
const MAGNUS_C: f64 = 243.5;

pub struct AltitudeConverter {
    default_temperature_c: f64,
}

impl AltitudeConverter {
    pub fn new(default_temperature_c: f64) -> Self {
        Self {
            default_temperature_c,
        }
    }

    pub fn default_temperature(&self) -> f64 {
        self.default_temperature_c
    }

    /// Absolute height in metres for a barometer sample.
    ///
    /// `Ok(None)` when the sample carries no pressure or there is no
    /// calibration. Samples without a temperature use the configured default,
    /// samples without humidity are treated as dry air.
    pub fn convert(
        &self,
        sample: &SensorSample,
        calibration: Option<&CalibrationState>,
    ) -> TrackerResult<Option<f64>> {
        let Some(pressure) = sample.pressure else {
            return Ok(None);
        };
        let temperature = sample.temperature.unwrap_or(self.default_temperature_c);
        self.convert_raw(pressure, temperature, sample.humidity.unwrap_or(0.0), calibration)
    }

    pub fn convert_raw(
        &self,
        pressure_hpa: f64,
        temperature_c: f64,
        humidity_percent: f64,
        calibration: Option<&CalibrationState>,
    ) -> TrackerResult<Option<f64>> {
        validate_inputs(pressure_hpa, temperature_c, humidity_percent)?;

        let Some(calibration) = calibration else {
            return Ok(None);
        };

        let virtual_temp_k = virtual_temperature(pressure_hpa, temperature_c, humidity_percent)?;
        let delta = height_difference(calibration.reference_pressure, pressure_hpa, virtual_temp_k);
        Ok(Some(calibration.reference_height + delta))
    }
}

impl Default for AltitudeConverter {
    fn default() -> Self {
        Self::new(20.0)
    }
}

fn validate_inputs(pressure_hpa: f64, temperature_c: f64, humidity_percent: f64) -> TrackerResult<()> {
    ensure_finite("pressure", pressure_hpa)?;
    if pressure_hpa <= 0.0 {
        return Err(TrackerError::Validation(format!(
            "pressure must be positive, got {pressure_hpa} hPa"
        )));
    }
    ensure_finite("temperature", temperature_c)?;
    if temperature_c <= -KELVIN_OFFSET {
        return Err(TrackerError::Validation(format!(
            "temperature below absolute zero: {temperature_c} °C"
        )));
    }
    ensure_finite("humidity", humidity_percent)?;
    if !(0.0..=100.0).contains(&humidity_percent) {
        return Err(TrackerError::Validation(format!(
            "humidity must be within 0-100 %, got {humidity_percent}"
        )));
    }
    Ok(())
}

/// Partial pressure of water vapour (hPa) from the Magnus saturation formula.
pub fn vapor_pressure(temperature_c: f64, humidity_percent: f64) -> f64 {
    (humidity_percent / 100.0) * MAGNUS_A * (MAGNUS_B * temperature_c / (temperature_c + MAGNUS_C)).exp()
}

/// Temperature (K) of dry air with the same density as the moist sample.
pub fn virtual_temperature(
    pressure_hpa: f64,
    temperature_c: f64,
    humidity_percent: f64,
) -> TrackerResult<f64> {
    let e = vapor_pressure(temperature_c, humidity_percent);
    let tv = (temperature_c + KELVIN_OFFSET) / (1.0 - (e / pressure_hpa) * (1.0 - EPSILON));
    if tv.is_finite() && tv > 0.0 {
        Ok(tv)
    } else {
        Err(TrackerError::Validation(format!(
            "vapour pressure {e:.2} hPa is implausible at {pressure_hpa} hPa"
        )))
    }
}

/// Hypsometric height above the reference pressure level.
pub fn height_difference(reference_pressure_hpa: f64, pressure_hpa: f64, virtual_temp_k: f64) -> f64 {
    ((reference_pressure_hpa / pressure_hpa).powf(1.0 / HYPSOMETRIC_EXPONENT) - 1.0) * virtual_temp_k
        / LAPSE_RATE
}

/// Standard-atmosphere approximation without humidity, scaled by the
/// reference/current temperature ratio. Kept for comparison with the
/// canonical model; the tracker never uses it.
pub fn simplified_height_difference(
    pressure_hpa: f64,
    reference_pressure_hpa: f64,
    temperature_c: f64,
    reference_temperature_c: f64,
) -> f64 {
    let base = (1.0 - (pressure_hpa / reference_pressure_hpa).powf(0.190284)) * 145366.45 * 0.3048;
    base * (reference_temperature_c + KELVIN_OFFSET) / (temperature_c + KELVIN_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn calibration(pressure: f64, temperature: f64, height: f64) -> CalibrationState {
        CalibrationState {
            reference_pressure: pressure,
            reference_height: height,
            reference_temperature: temperature,
            timestamp: 0,
        }
    }

    #[test]
    fn test_uncalibrated_returns_none() {
        let converter = AltitudeConverter::default();
        let sample = SensorSample::new(1000.0, Some(20.0), 0);
        assert_eq!(converter.convert(&sample, None).unwrap(), None);
    }

    #[test]
    fn test_missing_pressure_returns_none() {
        let converter = AltitudeConverter::default();
        let cal = calibration(1013.25, 20.0, 0.0);
        let sample = SensorSample {
            pressure: None,
            temperature: Some(20.0),
            humidity: None,
            timestamp: 0,
        };
        assert_eq!(converter.convert(&sample, Some(&cal)).unwrap(), None);
    }

    #[test]
    fn test_calibration_round_trip() {
        let converter = AltitudeConverter::default();
        for (p0, t0, h0) in [(1013.25, 20.0, 0.0), (950.0, -5.0, 540.0), (1020.4, 31.5, -12.0)] {
            let cal = calibration(p0, t0, h0);
            let height = converter
                .convert(&SensorSample::new(p0, Some(t0), 0), Some(&cal))
                .unwrap()
                .unwrap();
            assert_abs_diff_eq!(height, h0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_strictly_decreasing_in_pressure() {
        let converter = AltitudeConverter::default();
        let cal = calibration(1013.25, 20.0, 0.0);
        let mut previous = f64::INFINITY;
        let mut pressure = 900.0;
        while pressure <= 1050.0 {
            let height = converter
                .convert_raw(pressure, 15.0, 40.0, Some(&cal))
                .unwrap()
                .unwrap();
            assert!(height < previous, "height must fall as pressure rises");
            previous = height;
            pressure += 0.5;
        }
    }

    #[test]
    fn test_lower_pressure_is_a_few_metres_up() {
        let converter = AltitudeConverter::default();
        let cal = calibration(1013.25, 20.0, 0.0);
        let sample = SensorSample::new(1011.0, Some(20.0), 0);
        let height = converter.convert(&sample, Some(&cal)).unwrap().unwrap();

        // ~8.5 m per hPa near sea level
        assert!(height > 15.0 && height < 25.0, "got {height}");
    }

    #[test]
    fn test_humidity_raises_estimate() {
        let converter = AltitudeConverter::default();
        let cal = calibration(1013.25, 25.0, 0.0);
        let dry = converter.convert_raw(1005.0, 25.0, 0.0, Some(&cal)).unwrap().unwrap();
        let humid = converter.convert_raw(1005.0, 25.0, 90.0, Some(&cal)).unwrap().unwrap();
        assert!(humid > dry);
        assert!((humid - dry) / dry < 0.02);
    }

    #[test]
    fn test_simplified_variant_agrees_roughly() {
        let converter = AltitudeConverter::default();
        let cal = calibration(1013.25, 20.0, 0.0);
        let canonical = converter.convert_raw(1000.0, 20.0, 0.0, Some(&cal)).unwrap().unwrap();
        let simplified = simplified_height_difference(1000.0, 1013.25, 20.0, 20.0);
        assert!((canonical - simplified).abs() / canonical < 0.05);
    }

    #[test]
    fn test_rejects_non_positive_pressure() {
        let converter = AltitudeConverter::default();
        let cal = calibration(1013.25, 20.0, 0.0);
        for pressure in [0.0, -3.0, f64::NAN, f64::INFINITY] {
            let result = converter.convert_raw(pressure, 20.0, 0.0, Some(&cal));
            assert!(matches!(result, Err(TrackerError::Validation(_))));
        }
        // Validation happens even without a calibration
        assert!(converter.convert_raw(0.0, 20.0, 0.0, None).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_humidity() {
        let converter = AltitudeConverter::default();
        assert!(converter.convert_raw(1000.0, 20.0, 120.0, None).is_err());
        assert!(converter.convert_raw(1000.0, 20.0, -1.0, None).is_err());
    }

    #[test]
    fn test_default_temperature_used_when_missing() {
        let cal = calibration(1013.25, 20.0, 0.0);
        let sample = SensorSample {
            pressure: Some(1000.0),
            temperature: None,
            humidity: None,
            timestamp: 0,
        };
        let cold = AltitudeConverter::new(0.0).convert(&sample, Some(&cal)).unwrap().unwrap();
        let warm = AltitudeConverter::new(30.0).convert(&sample, Some(&cal)).unwrap().unwrap();
        assert!(warm > cold);
    }
}
