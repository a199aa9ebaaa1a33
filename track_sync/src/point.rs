use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A 2-D coordinate in the timing feed's coordinate system, optionally stamped
/// with the date it was recorded at.
///
/// The unit of the feed is not documented; roughly `value / 3.61` meters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpatialPoint {
    pub x: f64,
    pub y: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl SpatialPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            timestamp: None,
        }
    }

    pub fn at(x: f64, y: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            x,
            y,
            timestamp: Some(timestamp),
        }
    }

    /// Sequencing metric: `|dx| + |dy|`.
    ///
    /// This is an L1 norm, not a squared Euclidean distance. The outlier
    /// thresholds used throughout the crate were tuned against it.
    pub fn sqr_dist(&self, other: &SpatialPoint) -> f64 {
        (other.x - self.x).abs() + (other.y - self.y).abs()
    }

    pub fn euclidean_dist(&self, other: &SpatialPoint) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }

    /// Coordinate equality, ignoring the timestamp.
    pub fn same_position(&self, other: &SpatialPoint) -> bool {
        self.x == other.x && self.y == other.y
    }
}
