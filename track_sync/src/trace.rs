use chrono::{DateTime, Duration, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::point::SpatialPoint;
use crate::SyncError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TrackStatus {
    OnTrack,
    OffTrack,
}

/// One row of a car's position feed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PositionSample {
    pub date: DateTime<Utc>,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub status: TrackStatus,
}

impl PositionSample {
    pub fn point(&self) -> SpatialPoint {
        SpatialPoint::at(self.x, self.y, self.date)
    }

    pub fn is_on_track(&self) -> bool {
        self.status == TrackStatus::OnTrack
    }
}

/// Position samples of a single driver ordered by date.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PositionTrace {
    samples: Vec<PositionSample>,
}

impl PositionTrace {
    /// Build a trace; samples are sorted by date (stable for equal dates).
    pub fn new(mut samples: Vec<PositionSample>) -> Self {
        samples.sort_by_key(|s| s.date);
        Self { samples }
    }

    pub fn samples(&self) -> &[PositionSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first_date(&self) -> Option<DateTime<Utc>> {
        self.samples.first().map(|s| s.date)
    }

    pub fn last_date(&self) -> Option<DateTime<Utc>> {
        self.samples.last().map(|s| s.date)
    }

    /// Whether `date` lies inside the recorded time span (inclusive).
    pub fn covers(&self, date: DateTime<Utc>) -> bool {
        match (self.first_date(), self.last_date()) {
            (Some(first), Some(last)) => first <= date && date <= last,
            _ => false,
        }
    }

    /// Samples with `start < date < end`.
    pub fn samples_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[PositionSample] {
        let lo = self.samples.partition_point(|s| s.date <= start);
        let hi = self.samples.partition_point(|s| s.date < end);
        if lo >= hi {
            &[]
        } else {
            &self.samples[lo..hi]
        }
    }

    /// Linear interpolation of the position at `date` between the two samples
    /// closest in time. Outside the recorded span this extrapolates from the
    /// two samples at that end.
    pub fn position_at_time(&self, date: DateTime<Utc>) -> Result<SpatialPoint, SyncError> {
        if self.samples.len() < 2 {
            return Err(SyncError::InsufficientData(format!(
                "position interpolation needs 2 samples, trace has {}",
                self.samples.len()
            )));
        }

        // The two nearest samples are always among the neighbours of the insertion point.
        let p = self.samples.partition_point(|s| s.date < date);
        let lo = p.saturating_sub(2);
        let hi = (p + 2).min(self.samples.len());
        let mut nearest: Vec<usize> = (lo..hi).collect();
        nearest.sort_by_key(|&i| {
            (
                OrderedFloat(seconds_between(self.samples[i].date, date).abs()),
                i,
            )
        });

        let a = &self.samples[nearest[0]];
        let b = &self.samples[nearest[1]];
        let span = seconds_between(a.date, b.date);
        if span == 0.0 {
            return Ok(SpatialPoint::at(a.x, a.y, date));
        }
        let frac = seconds_between(a.date, date) / span;
        Ok(SpatialPoint::at(
            a.x + (b.x - a.x) * frac,
            a.y + (b.y - a.y) * frac,
            date,
        ))
    }

    /// Date of the sample inside `(start, end)` that lies closest to `point`.
    pub fn time_near_point(
        &self,
        point: &SpatialPoint,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.samples_between(start, end)
            .iter()
            .enumerate()
            .min_by_key(|(i, s)| (OrderedFloat(point.sqr_dist(&s.point())), *i))
            .map(|(_, s)| s.date)
    }
}

pub(crate) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1000.0,
    }
}

pub(crate) fn offset_by_seconds(date: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
    date + Duration::microseconds((seconds * 1_000_000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn base() -> DateTime<Utc> {
        "2019-06-30T13:10:00Z".parse().unwrap()
    }

    fn sample(t: f64, x: f64, y: f64) -> PositionSample {
        PositionSample {
            date: offset_by_seconds(base(), t),
            x,
            y,
            z: 0.0,
            status: TrackStatus::OnTrack,
        }
    }

    fn straight_trace() -> PositionTrace {
        PositionTrace::new(vec![
            sample(0.0, 0.0, 0.0),
            sample(1.0, 10.0, 5.0),
            sample(2.0, 30.0, 5.0),
            sample(3.0, 40.0, -5.0),
        ])
    }

    #[test]
    fn test_new_sorts_by_date() {
        let trace = PositionTrace::new(vec![sample(2.0, 2.0, 0.0), sample(1.0, 1.0, 0.0)]);
        assert_eq!(trace.samples()[0].x, 1.0);
        assert_eq!(trace.first_date(), Some(offset_by_seconds(base(), 1.0)));
    }

    #[test]
    fn test_position_exact_at_samples() {
        let trace = straight_trace();
        for s in trace.samples() {
            let p = trace.position_at_time(s.date).unwrap();
            assert_relative_eq!(p.x, s.x);
            assert_relative_eq!(p.y, s.y);
        }
    }

    #[test]
    fn test_position_interpolates_between_samples() {
        let trace = straight_trace();
        let p = trace
            .position_at_time(offset_by_seconds(base(), 1.25))
            .unwrap();
        assert_relative_eq!(p.x, 15.0, epsilon = 1e-9);
        assert_relative_eq!(p.y, 5.0, epsilon = 1e-9);
        assert_eq!(p.timestamp, Some(offset_by_seconds(base(), 1.25)));
    }

    #[test]
    fn test_position_is_idempotent() {
        let trace = straight_trace();
        let t = offset_by_seconds(base(), 2.7);
        assert_eq!(
            trace.position_at_time(t).unwrap(),
            trace.position_at_time(t).unwrap()
        );
    }

    #[test]
    fn test_position_needs_two_samples() {
        let trace = PositionTrace::new(vec![sample(0.0, 1.0, 1.0)]);
        assert!(matches!(
            trace.position_at_time(base()),
            Err(SyncError::InsufficientData(_))
        ));
        assert!(PositionTrace::default().position_at_time(base()).is_err());
    }

    #[test]
    fn test_position_with_duplicate_dates() {
        let trace = PositionTrace::new(vec![sample(1.0, 3.0, 4.0), sample(1.0, 5.0, 6.0)]);
        let p = trace.position_at_time(base()).unwrap();
        assert_eq!((p.x, p.y), (3.0, 4.0));
    }

    #[test]
    fn test_samples_between_is_exclusive() {
        let trace = straight_trace();
        let window = trace.samples_between(base(), offset_by_seconds(base(), 3.0));
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].x, 10.0);
        assert!(trace
            .samples_between(offset_by_seconds(base(), 3.0), base())
            .is_empty());
    }

    #[test]
    fn test_covers() {
        let trace = straight_trace();
        assert!(trace.covers(base()));
        assert!(trace.covers(offset_by_seconds(base(), 3.0)));
        assert!(!trace.covers(offset_by_seconds(base(), 3.5)));
    }

    #[test]
    fn test_time_near_point() {
        let trace = straight_trace();
        let found = trace.time_near_point(
            &SpatialPoint::new(29.0, 4.0),
            offset_by_seconds(base(), -1.0),
            offset_by_seconds(base(), 10.0),
        );
        assert_eq!(found, Some(offset_by_seconds(base(), 2.0)));
        let none = trace.time_near_point(
            &SpatialPoint::new(29.0, 4.0),
            offset_by_seconds(base(), 5.0),
            offset_by_seconds(base(), 10.0),
        );
        assert!(none.is_none());
    }
}
