use std::collections::VecDeque;

use crate::types::HistoryPoint;

pub const DEFAULT_HISTORY_CAPACITY: usize = 300;

/// Bounded history of fused estimates.
///
/// Holds at most `capacity` points; pushing onto a full buffer drops the oldest.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    points: VecDeque<HistoryPoint>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        HistoryBuffer {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, point: HistoryPoint) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    pub fn latest(&self) -> Option<&HistoryPoint> {
        self.points.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryPoint> {
        self.points.iter()
    }

    /// Oldest first
    pub fn to_vec(&self) -> Vec<HistoryPoint> {
        self.points.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(timestamp: i64) -> HistoryPoint {
        HistoryPoint {
            height: timestamp as f64,
            gps_height: None,
            fused_height: timestamp as f64,
            velocity: 0.0,
            timestamp,
            is_moving: false,
        }
    }

    #[test]
    fn test_drops_oldest_beyond_capacity() {
        let mut history = HistoryBuffer::default();
        for ts in 0..350 {
            history.push(point(ts));
        }
        assert_eq!(history.len(), 300);
        assert_eq!(history.iter().next().unwrap().timestamp, 50);
        assert_eq!(history.latest().unwrap().timestamp, 349);
    }

    #[test]
    fn test_small_buffer_order() {
        let mut history = HistoryBuffer::new(3);
        for ts in [1, 2, 3, 4] {
            history.push(point(ts));
        }
        let stamps: Vec<i64> = history.to_vec().iter().map(|p| p.timestamp).collect();
        assert_eq!(stamps, vec![2, 3, 4]);
    }
}
