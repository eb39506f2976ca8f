use thiserror::Error;

/// Vertical tracker error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    /// Non-finite or out-of-domain numeric input. Nothing was mutated.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Required sensor hardware is absent. Callers fall back to simulation.
    #[error("Sensor unavailable: {0}")]
    Unavailable(String),

    /// Persisted state could not be read or written.
    #[error("Storage error: {0}")]
    Persistence(String),

    #[error("Tracker service channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;

impl TrackerError {
    pub fn is_persistence(&self) -> bool {
        matches!(self, TrackerError::Persistence(_))
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(err: std::io::Error) -> Self {
        TrackerError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::Persistence(err.to_string())
    }
}

/// Reject NaN and infinities with a validation error naming the field.
pub fn ensure_finite(name: &str, value: f64) -> TrackerResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TrackerError::Validation(format!("{name} must be finite, got {value}")))
    }
}

/// A state change that has been applied in memory.
///
/// `persist_error` is set when writing it to storage failed, meaning the
/// change holds for this session but will not survive a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct Persisted<T> {
    pub value: T,
    pub persist_error: Option<TrackerError>,
}

impl<T> Persisted<T> {
    pub fn new(value: T, write_result: TrackerResult<()>) -> Self {
        Self {
            value,
            persist_error: write_result.err(),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.persist_error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_finite() {
        assert_eq!(ensure_finite("pressure", 1013.25), Ok(1013.25));
        assert!(matches!(
            ensure_finite("pressure", f64::NAN),
            Err(TrackerError::Validation(_))
        ));
        assert!(ensure_finite("height", f64::INFINITY).is_err());
    }

    #[test]
    fn test_persisted_durability() {
        let ok = Persisted::new(1.0, Ok(()));
        assert!(ok.is_durable());

        let failed = Persisted::new(1.0, Err(TrackerError::Persistence("disk full".into())));
        assert!(!failed.is_durable());
        assert_eq!(failed.value, 1.0);
        assert!(failed.persist_error.unwrap().is_persistence());
    }
}
