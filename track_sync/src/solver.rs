//! Grid search for the start/finish line.
//!
//! Setup estimates where the line roughly is from the lap end times alone.
//! The sweep then walks candidate positions across that range and scores
//! each registered [`Condition`] at every candidate by the spread of the
//! points it derives.

use std::sync::Arc;
use std::time::Instant;

use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::condition::{Condition, ConditionInfo, ConditionOutput};
use crate::point::SpatialPoint;
use crate::pool::{SolverTask, WorkerPool};
use crate::session::SessionSnapshot;
use crate::stats;
use crate::{DriverId, SolverParams, SyncError};

/// Coarse segment the line is searched on: from the leftmost to the rightmost
/// estimated lap end position.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LineRange {
    /// `(x_min, x_max)`.
    pub x: (f64, f64),
    /// y of the points holding `x_min` and `x_max`.
    pub y: (f64, f64),
    /// Lap end positions kept after outlier rejection.
    pub samples: usize,
    pub rejected: usize,
    /// Drivers that contributed lap end positions.
    pub drivers: usize,
    /// Mean absolute deviation of the kept positions in x and y.
    pub spread: (f64, f64),
}

impl LineRange {
    /// Point on the segment at `x`.
    pub fn at(&self, x: f64) -> SpatialPoint {
        let (x0, x1) = self.x;
        let (y0, y1) = self.y;
        let y = if x1 == x0 {
            y0
        } else {
            y0 + (y1 - y0) * (x - x0) / (x1 - x0)
        };
        SpatialPoint::new(x, y)
    }

    /// Candidates from `trunc(x_min)` in steps of `step`, strictly below
    /// `trunc(x_max)`.
    pub fn candidates(&self, step: f64) -> Vec<SpatialPoint> {
        let start = self.x.0.trunc();
        let end = self.x.1.trunc();
        let mut out = Vec::new();
        let mut k = 0u32;
        loop {
            let x = start + f64::from(k) * step;
            if x >= end {
                break;
            }
            out.push(self.at(x));
            k += 1;
        }
        out
    }
}

/// Statistics of one condition at one candidate position.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AggregatedResult {
    pub condition: usize,
    pub test_x: f64,
    pub test_y: f64,
    pub samples: usize,
    pub mean_x: Option<f64>,
    pub mean_y: Option<f64>,
    pub mad_x: Option<f64>,
    pub mad_y: Option<f64>,
}

impl AggregatedResult {
    fn from_output(condition: usize, candidate: &SpatialPoint, output: Option<&ConditionOutput>) -> Self {
        let (xs, ys): (&[f64], &[f64]) = match output {
            Some(out) => (&out.xs, &out.ys),
            None => (&[], &[]),
        };
        Self {
            condition,
            test_x: candidate.x,
            test_y: candidate.y,
            samples: xs.len(),
            mean_x: stats::mean(xs),
            mean_y: stats::mean(ys),
            mad_x: stats::mean_abs_dev(xs),
            mad_y: stats::mean_abs_dev(ys),
        }
    }

    /// Combined spread, `None` without samples.
    pub fn spread(&self) -> Option<f64> {
        Some(self.mad_x? + self.mad_y?)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SweepResults {
    /// One row per sweep step and condition, in sweep order.
    pub rows: Vec<AggregatedResult>,
}

impl SweepResults {
    pub fn for_condition(&self, condition: usize) -> impl Iterator<Item = &AggregatedResult> + '_ {
        self.rows.iter().filter(move |r| r.condition == condition)
    }

    /// Candidate with the smallest spread for `condition`. The earliest row
    /// wins ties.
    pub fn best_fit(&self, condition: usize) -> Option<&AggregatedResult> {
        self.for_condition(condition)
            .filter_map(|row| row.spread().map(|s| (OrderedFloat(s), row)))
            .min_by_key(|(s, _)| *s)
            .map(|(_, row)| row)
    }
}

pub struct GridSearchSolver {
    session: Arc<SessionSnapshot>,
    params: SolverParams,
    conditions: Vec<Arc<dyn Condition>>,
    range: Option<LineRange>,
}

impl GridSearchSolver {
    /// An explicit `params.session_start` replaces the snapshot's.
    pub fn new(mut session: SessionSnapshot, params: SolverParams) -> Result<Self, SyncError> {
        params.validate()?;
        if let Some(start) = params.session_start {
            session.session_start = start;
        }
        Ok(Self {
            session: Arc::new(session),
            params,
            conditions: Vec::new(),
            range: None,
        })
    }

    pub fn session(&self) -> &SessionSnapshot {
        &self.session
    }

    /// Register a condition and return its index in the results.
    pub fn add_condition(&mut self, condition: Arc<dyn Condition>) -> usize {
        self.conditions.push(condition);
        self.conditions.len() - 1
    }

    pub fn conditions_info(&self) -> Vec<ConditionInfo> {
        self.conditions
            .iter()
            .enumerate()
            .map(|(index, c)| ConditionInfo {
                index,
                id: c.id().to_string(),
                name: c.name().to_string(),
                description: c.description().to_string(),
            })
            .collect()
    }

    pub fn line_range(&self) -> Option<&LineRange> {
        self.range.as_ref()
    }

    /// Estimate the line range from the positions at the reported lap ends.
    pub fn setup(&mut self) -> Result<&LineRange, SyncError> {
        let t_setup = Instant::now();
        let session = &*self.session;
        let per_driver: Vec<Vec<SpatialPoint>> = session
            .traces
            .par_iter()
            .map(|(driver, trace)| {
                session
                    .laps
                    .usable_laps(driver)
                    .into_iter()
                    .filter_map(|lap| trace.position_at_time(session.lap_end(&lap)).ok())
                    .collect()
            })
            .collect();
        let drivers = per_driver.iter().filter(|ends| !ends.is_empty()).count();
        let lap_ends: Vec<SpatialPoint> = per_driver.into_iter().flatten().collect();
        if lap_ends.is_empty() {
            return Err(SyncError::InsufficientData(
                "no usable lap end positions to estimate the line range".into(),
            ));
        }

        let xs: Vec<f64> = lap_ends.iter().map(|p| p.x).collect();
        let mask = stats::mad_inlier_mask(&xs, self.params.outlier_mad_multiplier);
        let kept: Vec<SpatialPoint> = lap_ends
            .iter()
            .zip(&mask)
            .filter(|(_, keep)| **keep)
            .map(|(p, _)| *p)
            .collect();

        let Some(&first) = kept.first() else {
            return Err(SyncError::InsufficientData(
                "every lap end position was rejected as an outlier".into(),
            ));
        };
        let mut lo = first;
        let mut hi = first;
        for p in &kept[1..] {
            if p.x < lo.x {
                lo = *p;
            }
            if p.x > hi.x {
                hi = *p;
            }
        }
        let kept_xs: Vec<f64> = kept.iter().map(|p| p.x).collect();
        let kept_ys: Vec<f64> = kept.iter().map(|p| p.y).collect();
        let range = LineRange {
            x: (lo.x, hi.x),
            y: (lo.y, hi.y),
            samples: kept.len(),
            rejected: lap_ends.len() - kept.len(),
            drivers,
            spread: (
                stats::mean_abs_dev(&kept_xs).unwrap_or(0.0),
                stats::mean_abs_dev(&kept_ys).unwrap_or(0.0),
            ),
        };
        info!(
            "Line range x {:.1}..{:.1}, y {:.1}..{:.1} from {} lap ends of {} drivers ({} rejected, mad x {:.1} y {:.1}) in {:.1} ms",
            range.x.0,
            range.x.1,
            range.y.0,
            range.y.1,
            range.samples,
            range.drivers,
            range.rejected,
            range.spread.0,
            range.spread.1,
            t_setup.elapsed().as_secs_f64() * 1000.0
        );
        Ok(&*self.range.insert(range))
    }

    /// Sweep the line range and aggregate every condition at every step.
    pub fn solve(&self) -> Result<SweepResults, SyncError> {
        let range = self.range.as_ref().ok_or(SyncError::NotSetUp)?;
        if self.conditions.is_empty() {
            return Err(SyncError::InvalidParameter("no conditions registered".into()));
        }
        let t_solve = Instant::now();
        let candidates = range.candidates(self.params.sweep_step);
        let drivers: Vec<DriverId> = self.session.drivers().cloned().collect();
        let conditions: Arc<[Arc<dyn Condition>]> = self.conditions.clone().into();
        let pool = WorkerPool::spawn(self.params.workers, Arc::clone(&self.session), conditions)?;

        let mut results = SweepResults::default();
        for (step, candidate) in candidates.iter().enumerate() {
            let mut tasks = Vec::with_capacity(self.conditions.len() * drivers.len());
            for condition in 0..self.conditions.len() {
                for driver in &drivers {
                    tasks.push(SolverTask {
                        condition,
                        driver: driver.clone(),
                        candidate: *candidate,
                    });
                }
            }
            let report = pool.run_step(tasks)?;
            for condition in 0..self.conditions.len() {
                results.rows.push(AggregatedResult::from_output(
                    condition,
                    candidate,
                    report.merged.get(&condition),
                ));
            }
            debug!(
                "Step {}/{} at ({:.1}, {:.1}): {} tasks",
                step + 1,
                candidates.len(),
                candidate.x,
                candidate.y,
                report.tasks
            );
        }
        pool.shutdown()?;

        info!(
            "Sweep done: {} steps x {} conditions in {:.1} ms",
            candidates.len(),
            self.conditions.len(),
            t_solve.elapsed().as_secs_f64() * 1000.0
        );
        Ok(results)
    }
}
