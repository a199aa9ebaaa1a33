//! Track map generation.
//!
//! A session holds well over a hundred thousand position samples, but only a
//! few thousand unique on-track coordinates, roughly one per meter of track.
//! They are not evenly spaced (slow corners are denser than straights). The
//! unique points are ordered into a closed loop and integrated into a lap
//! distance.
//!
//! Points that no car ever reported are simply missing, so a track map is only
//! valid for the data it was generated from. Do not reuse a qualifying map for
//! race data.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use ndarray::Array1;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::point::SpatialPoint;
use crate::sequencing::sequence;
use crate::trace::{PositionSample, PositionTrace};
use crate::{DriverId, SyncError, TrackParams};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    fn of(self, p: &SpatialPoint) -> f64 {
        match self {
            Axis::X => p.x,
            Axis::Y => p.y,
        }
    }
}

/// Collects unique on-track points and orders them into a [`Track`].
#[derive(Clone, Debug)]
pub struct TrackMapBuilder {
    params: TrackParams,
    unsorted: Vec<SpatialPoint>,
    seen: HashSet<(OrderedFloat<f64>, OrderedFloat<f64>)>,
}

impl TrackMapBuilder {
    pub fn new(params: TrackParams) -> Self {
        Self {
            params,
            unsorted: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Builder fed with every driver's samples, in driver order.
    pub fn from_traces(traces: &BTreeMap<DriverId, PositionTrace>, params: TrackParams) -> Self {
        let mut builder = Self::new(params);
        for trace in traces.values() {
            builder.add_samples(trace.samples());
        }
        builder
    }

    /// Add raw samples. Off-track samples and coordinates seen before are dropped.
    pub fn add_samples<'a, I>(&mut self, samples: I)
    where
        I: IntoIterator<Item = &'a PositionSample>,
    {
        for sample in samples {
            if !sample.is_on_track() {
                continue;
            }
            if self
                .seen
                .insert((OrderedFloat(sample.x), OrderedFloat(sample.y)))
            {
                self.unsorted.push(SpatialPoint::new(sample.x, sample.y));
            }
        }
    }

    pub fn unsorted_points(&self) -> &[SpatialPoint] {
        &self.unsorted
    }

    pub fn build(self) -> Result<Track, SyncError> {
        self.params.validate()?;
        if self.unsorted.len() < 2 {
            return Err(SyncError::InsufficientData(format!(
                "a track needs at least 2 unique points, got {}",
                self.unsorted.len()
            )));
        }

        let t_sort = Instant::now();
        let unique = self.unsorted.len();
        let sequenced = sequence(
            self.unsorted,
            self.params.outlier_threshold,
            self.params.engine,
        );
        debug!(
            "Sequenced {} points with {:?} engine in {:.1} ms",
            unique,
            self.params.engine,
            t_sort.elapsed().as_secs_f64() * 1000.0
        );

        if sequenced.sorted.len() < 2 {
            return Err(SyncError::DegenerateTrack(sequenced.sorted.len()));
        }
        let track = Track::with_excluded(sequenced.sorted, sequenced.excluded)?;
        info!(
            "Track generated: {} points, {} excluded, length {:.1}",
            track.len(),
            track.excluded().len(),
            track.loop_length()
        );
        Ok(track)
    }
}

/// Ordered closed loop of track points with the lap distance of every point.
///
/// The starting point and the direction of travel are whatever the sequencing
/// happened to produce.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Track {
    points: Vec<SpatialPoint>,
    distance: Array1<f64>,
    distance_normalized: Array1<f64>,
    excluded: Vec<SpatialPoint>,
}

impl Track {
    /// Track from points that are already in loop order.
    pub fn from_ordered_points(points: Vec<SpatialPoint>) -> Result<Self, SyncError> {
        Self::with_excluded(points, Vec::new())
    }

    fn with_excluded(
        points: Vec<SpatialPoint>,
        excluded: Vec<SpatialPoint>,
    ) -> Result<Self, SyncError> {
        if points.len() < 2 {
            return Err(SyncError::DegenerateTrack(points.len()));
        }
        let mut distance = Vec::with_capacity(points.len());
        let mut covered = 0.0;
        distance.push(0.0);
        for w in points.windows(2) {
            covered += w[0].euclidean_dist(&w[1]);
            distance.push(covered);
        }
        if covered <= 0.0 {
            return Err(SyncError::DegenerateTrack(1));
        }
        let distance = Array1::from_vec(distance);
        let distance_normalized = distance.mapv(|d| d / covered);
        Ok(Self {
            points,
            distance,
            distance_normalized,
            excluded,
        })
    }

    pub fn points(&self) -> &[SpatialPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Cumulative distance from the first point.
    pub fn distance(&self) -> &Array1<f64> {
        &self.distance
    }

    /// Cumulative distance scaled to `[0, 1]`.
    pub fn distance_normalized(&self) -> &Array1<f64> {
        &self.distance_normalized
    }

    pub fn excluded(&self) -> &[SpatialPoint] {
        &self.excluded
    }

    /// Length of the loop including the closing segment back to the first point.
    pub fn loop_length(&self) -> f64 {
        let last = self.distance[self.distance.len() - 1];
        last + self.points[self.points.len() - 1].euclidean_dist(&self.points[0])
    }

    pub fn index_of(&self, point: &SpatialPoint) -> Option<usize> {
        self.points.iter().position(|p| p.same_position(point))
    }

    /// Track point closest to `point`; the first one wins ties.
    pub fn closest_point(&self, point: &SpatialPoint) -> &SpatialPoint {
        &self.points[self.closest_index(point)]
    }

    fn closest_index(&self, point: &SpatialPoint) -> usize {
        let mut best = 0;
        let mut best_dist = f64::INFINITY;
        for (i, p) in self.points.iter().enumerate() {
            let d = p.sqr_dist(point);
            if d < best_dist {
                best = i;
                best_dist = d;
            }
        }
        best
    }

    /// Track points between two track points along the shorter (`short`) or
    /// longer arc of the loop, in traversal order.
    pub fn points_between(
        &self,
        a: &SpatialPoint,
        b: &SpatialPoint,
        short: bool,
        include_endpoints: bool,
    ) -> Result<Vec<SpatialPoint>, SyncError> {
        let i1 = self.require_index(a)?;
        let i2 = self.require_index(b)?;
        let (lo, hi) = (i1.min(i2), i1.max(i2));

        let inner_len = self.distance[hi] - self.distance[lo];
        let outer_len = self.loop_length() - inner_len;
        let use_inner = if short {
            inner_len <= outer_len
        } else {
            inner_len > outer_len
        };

        let mut out = Vec::new();
        if use_inner {
            if include_endpoints {
                out.push(self.points[lo]);
            }
            if hi > lo + 1 {
                out.extend_from_slice(&self.points[lo + 1..hi]);
            }
            if include_endpoints {
                out.push(self.points[hi]);
            }
        } else {
            if include_endpoints {
                out.push(self.points[hi]);
            }
            out.extend_from_slice(&self.points[hi + 1..]);
            out.extend_from_slice(&self.points[..lo]);
            if include_endpoints {
                out.push(self.points[lo]);
            }
        }
        Ok(out)
    }

    /// Point on the short arc between `a` and `b` whose `axis` coordinate
    /// equals `value`, interpolating the other coordinate between the two
    /// nearest track points. Only meaningful on roughly straight sections.
    pub fn second_coord(
        &self,
        value: f64,
        a: &SpatialPoint,
        b: &SpatialPoint,
        axis: Axis,
    ) -> Result<SpatialPoint, SyncError> {
        let range = self.points_between(a, b, true, true)?;
        if range.len() < 2 {
            return Err(SyncError::InsufficientData(
                "need two points to interpolate along the track".into(),
            ));
        }
        let offsets: Vec<f64> = range.iter().map(|p| (axis.of(p) - value).abs()).collect();
        let closest = offsets
            .iter()
            .enumerate()
            .min_by_key(|(i, d)| (OrderedFloat(**d), *i))
            .map(|(i, _)| i)
            .unwrap_or(0);
        // At either end of the arc the opposite end competes with the inner neighbour.
        let last = range.len() - 1;
        let neighbour = if closest == 0 {
            if offsets[1] < offsets[last] {
                1
            } else {
                last
            }
        } else if closest == last {
            if offsets[0] < offsets[last - 1] {
                0
            } else {
                last - 1
            }
        } else if offsets[closest + 1] < offsets[closest - 1] {
            closest + 1
        } else {
            closest - 1
        };

        let p_a = range[closest];
        let p_b = range[neighbour];
        let span = axis.of(&p_b) - axis.of(&p_a);
        if span == 0.0 {
            return Err(SyncError::InsufficientData(format!(
                "track segment is perpendicular to the {:?} axis",
                axis
            )));
        }
        let frac = (value - axis.of(&p_a)) / span;
        Ok(match axis {
            Axis::X => SpatialPoint::new(value, p_a.y + (p_b.y - p_a.y) * frac),
            Axis::Y => SpatialPoint::new(p_a.x + (p_b.x - p_a.x) * frac, value),
        })
    }

    /// Date at which the car of `trace` passed the track point closest to
    /// `point`. A car passes every point once per lap, so the search is limited
    /// to `(start, end)`.
    pub fn time_at_position(
        &self,
        trace: &PositionTrace,
        point: &SpatialPoint,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let closest = self.closest_point(point);
        trace.time_near_point(closest, start, end)
    }

    fn require_index(&self, point: &SpatialPoint) -> Result<usize, SyncError> {
        self.index_of(point).ok_or(SyncError::PointNotOnTrack {
            x: point.x,
            y: point.y,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TrackStatus;
    use crate::SequencingEngine;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use std::f64::consts::PI;

    fn base() -> DateTime<Utc> {
        "2019-06-30T13:10:00Z".parse().unwrap()
    }

    fn sample(t: i64, x: f64, y: f64, status: TrackStatus) -> PositionSample {
        PositionSample {
            date: base() + chrono::Duration::seconds(t),
            x,
            y,
            z: 0.0,
            status,
        }
    }

    fn build(points: &[SpatialPoint], engine: SequencingEngine) -> Result<Track, SyncError> {
        let samples: Vec<PositionSample> = points
            .iter()
            .enumerate()
            .map(|(i, p)| sample(i as i64, p.x, p.y, TrackStatus::OnTrack))
            .collect();
        let mut builder = TrackMapBuilder::new(TrackParams {
            engine,
            ..TrackParams::default()
        });
        builder.add_samples(&samples);
        builder.build()
    }

    fn circle(n: usize, radius: f64, rotation: f64) -> Vec<SpatialPoint> {
        (0..n)
            .map(|i| {
                let a = rotation + 2.0 * PI * i as f64 / n as f64;
                SpatialPoint::new(radius * a.cos(), radius * a.sin())
            })
            .collect()
    }

    fn square() -> Track {
        let points = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]
            .iter()
            .map(|&(x, y)| SpatialPoint::new(x, y))
            .collect::<Vec<_>>();
        build(&points, SequencingEngine::Grid).unwrap()
    }

    #[test]
    fn test_unit_square_distances() {
        let track = square();
        assert_eq!(track.len(), 4);
        assert!(track.excluded().is_empty());
        assert_eq!(track.distance().to_vec(), vec![0.0, 1.0, 2.0, 3.0]);
        let normalized = track.distance_normalized();
        assert_relative_eq!(normalized[1], 1.0 / 3.0);
        assert_relative_eq!(normalized[2], 2.0 / 3.0);
        assert_eq!(normalized[3], 1.0);
        assert_relative_eq!(track.loop_length(), 4.0);
    }

    #[test]
    fn test_builder_filters_off_track_and_duplicates() {
        let mut traces = BTreeMap::new();
        traces.insert(
            "44".to_string(),
            PositionTrace::new(vec![
                sample(0, 0.0, 0.0, TrackStatus::OnTrack),
                sample(1, 10.0, 0.0, TrackStatus::OnTrack),
                sample(2, 9000.0, 9000.0, TrackStatus::OffTrack),
            ]),
        );
        traces.insert(
            "77".to_string(),
            PositionTrace::new(vec![
                sample(0, 10.0, 0.0, TrackStatus::OnTrack),
                sample(1, 10.0, 10.0, TrackStatus::OnTrack),
                sample(2, 0.0, 0.0, TrackStatus::OnTrack),
            ]),
        );
        let builder = TrackMapBuilder::from_traces(&traces, TrackParams::default());
        let unsorted: Vec<(f64, f64)> = builder.unsorted_points().iter().map(|p| (p.x, p.y)).collect();
        assert_eq!(unsorted, vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)]);
        assert_eq!(builder.build().unwrap().len(), 3);
    }

    #[test]
    fn test_too_few_points() {
        let err = build(&[SpatialPoint::new(1.0, 1.0)], SequencingEngine::Grid).unwrap_err();
        assert!(matches!(err, SyncError::InsufficientData(_)));
    }

    #[test]
    fn test_scattered_points_are_degenerate() {
        let points = [
            SpatialPoint::new(0.0, 0.0),
            SpatialPoint::new(1000.0, 0.0),
            SpatialPoint::new(0.0, 1000.0),
        ];
        let err = build(&points, SequencingEngine::Exhaustive).unwrap_err();
        assert!(matches!(err, SyncError::DegenerateTrack(0)));
    }

    #[test]
    fn test_gap_excludes_one_point() {
        // 60 points on r=1000 are ~105 apart; removing one leaves a gap above 200.
        let mut points = circle(60, 1000.0, 0.0);
        points.remove(30);
        let track = build(&points, SequencingEngine::Grid).unwrap();
        assert_eq!(track.excluded().len(), 1);
        assert_eq!(track.len(), 58);

        // 120 points are ~52 apart; the gap left by one point stays below 200.
        let mut points = circle(120, 1000.0, 0.0);
        points.remove(60);
        let track = build(&points, SequencingEngine::Grid).unwrap();
        assert!(track.excluded().is_empty());
        assert_eq!(track.len(), 119);
    }

    #[test]
    fn test_closest_point_prefers_first_on_ties() {
        let track = square();
        let p = track.closest_point(&SpatialPoint::new(0.5, 0.0));
        assert_eq!((p.x, p.y), (0.0, 0.0));
        let p = track.closest_point(&SpatialPoint::new(0.9, 1.2));
        assert_eq!((p.x, p.y), (1.0, 1.0));
    }

    #[test]
    fn test_points_between_arcs() {
        let points: Vec<SpatialPoint> = (0..10).map(|i| SpatialPoint::new(i as f64 * 10.0, 0.0)).collect();
        // Closing segment is long, so the inner arc is always the short one here.
        let track = Track::from_ordered_points(points.clone()).unwrap();

        let short = track.points_between(&points[7], &points[2], true, true).unwrap();
        let xs: Vec<f64> = short.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![20.0, 30.0, 40.0, 50.0, 60.0, 70.0]);

        let inner = track.points_between(&points[2], &points[7], true, false).unwrap();
        assert_eq!(inner.len(), 4);

        let long = track.points_between(&points[2], &points[7], false, true).unwrap();
        let xs: Vec<f64> = long.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![70.0, 80.0, 90.0, 0.0, 10.0, 20.0]);
    }

    #[test]
    fn test_points_between_picks_shorter_arc_across_start() {
        let track = Track::from_ordered_points(circle(12, 100.0, 0.0)).unwrap();
        let a = track.points()[1];
        let b = track.points()[10];
        let short = track.points_between(&a, &b, true, true).unwrap();
        assert_eq!(short.len(), 4);
        assert!(short[0].same_position(&b));
        assert!(short[3].same_position(&a));
        let long = track.points_between(&a, &b, false, false).unwrap();
        assert_eq!(long.len(), 8);
    }

    #[test]
    fn test_points_between_requires_track_points() {
        let track = square();
        let err = track
            .points_between(&SpatialPoint::new(0.5, 0.5), &track.points()[0], true, true)
            .unwrap_err();
        assert!(matches!(err, SyncError::PointNotOnTrack { .. }));
    }

    #[test]
    fn test_second_coord_on_straight() {
        let mut points: Vec<SpatialPoint> = (0..6)
            .map(|i| SpatialPoint::new(i as f64 * 10.0, i as f64 * 5.0))
            .collect();
        points.push(SpatialPoint::new(50.0, 100.0));
        points.push(SpatialPoint::new(0.0, 100.0));
        let track = Track::from_ordered_points(points.clone()).unwrap();
        let p = track.second_coord(23.0, &points[0], &points[5], Axis::X).unwrap();
        assert_relative_eq!(p.x, 23.0);
        assert_relative_eq!(p.y, 11.5);
        let p = track.second_coord(7.5, &points[5], &points[0], Axis::Y).unwrap();
        assert_relative_eq!(p.x, 15.0);
    }

    #[test]
    fn test_second_coord_end_point_pairs_with_opposite_end() {
        let points = vec![
            SpatialPoint::new(0.0, 0.0),
            SpatialPoint::new(50.0, 40.0),
            SpatialPoint::new(5.0, 80.0),
            SpatialPoint::new(500.0, 80.0),
            SpatialPoint::new(500.0, 0.0),
        ];
        let track = Track::from_ordered_points(points.clone()).unwrap();
        // x = 2 is closest to the first point, and the last point of the arc
        // is closer along x than the second one.
        let p = track.second_coord(2.0, &points[0], &points[2], Axis::X).unwrap();
        assert_relative_eq!(p.x, 2.0);
        assert_relative_eq!(p.y, 32.0);
    }

    #[test]
    fn test_time_at_position() {
        let track = square();
        let trace = PositionTrace::new(vec![
            sample(0, 0.0, 0.0, TrackStatus::OnTrack),
            sample(1, 1.0, 0.0, TrackStatus::OnTrack),
            sample(2, 1.0, 1.0, TrackStatus::OnTrack),
            sample(3, 0.0, 0.0, TrackStatus::OnTrack),
            sample(4, 1.0, 0.0, TrackStatus::OnTrack),
        ]);
        let window_start = base() + chrono::Duration::milliseconds(2500);
        let window_end = base() + chrono::Duration::seconds(10);
        let found = track.time_at_position(
            &trace,
            &SpatialPoint::new(1.1, 0.1),
            window_start,
            window_end,
        );
        assert_eq!(found, Some(base() + chrono::Duration::seconds(4)));
    }

    proptest! {
        #[test]
        fn test_gapless_loop_keeps_every_point(
            points in (12usize..150, 0.0f64..6.28)
                .prop_flat_map(|(n, rot)| {
                    // Radius chosen so neighbouring points stay ~60 apart.
                    let radius = 30.0 / (PI / n as f64).sin();
                    Just(circle(n, radius, rot)).prop_shuffle()
                })
        ) {
            let n = points.len();
            let track = build(&points, SequencingEngine::Grid).unwrap();
            prop_assert_eq!(track.len(), n);
            prop_assert!(track.excluded().is_empty());
            let normalized = track.distance_normalized();
            prop_assert_eq!(normalized[0], 0.0);
            prop_assert_eq!(normalized[n - 1], 1.0);
            for w in normalized.to_vec().windows(2) {
                prop_assert!(w[0] <= w[1]);
            }
        }
    }
}
