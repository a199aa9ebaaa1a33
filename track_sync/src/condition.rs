//! Scoring conditions evaluated by the grid search.
//!
//! A condition maps one driver and one hypothesised start/finish point to a set
//! of derived points. When the hypothesis is right, the derived points of all
//! laps and drivers coincide, so their spread is the score.

use chrono::{DateTime, Duration, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::laps::UsableLap;
use crate::point::SpatialPoint;
use crate::session::SessionSnapshot;
use crate::trace::{offset_by_seconds, seconds_between, PositionSample, PositionTrace};

/// Derived points as parallel coordinate lists.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ConditionOutput {
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
}

impl ConditionOutput {
    pub fn push(&mut self, point: &SpatialPoint) {
        self.xs.push(point.x);
        self.ys.push(point.y);
    }

    pub fn extend(&mut self, other: ConditionOutput) {
        self.xs.extend(other.xs);
        self.ys.extend(other.ys);
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConditionInfo {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub description: String,
}

/// Pluggable scoring function. Implementations must not keep per-call state;
/// the same instance is evaluated concurrently by every worker.
pub trait Condition: Send + Sync {
    fn id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn evaluate(
        &self,
        session: &SessionSnapshot,
        driver: &str,
        candidate: &SpatialPoint,
    ) -> ConditionOutput;
}

/// Infers each lap's start position by timing the crossing of the candidate
/// line and stepping back by the lap time.
///
/// Assumes the line is at a fixed position and that the previous lap start
/// plus the lap duration gives the current lap start.
#[derive(Clone, Debug)]
pub struct StartFinishCondition {
    window_s: f64,
}

impl StartFinishCondition {
    pub fn new(window_s: f64) -> Self {
        Self { window_s }
    }
}

impl Default for StartFinishCondition {
    fn default() -> Self {
        Self::new(10.0)
    }
}

impl Condition for StartFinishCondition {
    fn id(&self) -> &'static str {
        "sync.start_finish.lap_time.v1"
    }

    fn name(&self) -> &'static str {
        "Start/finish from lap time"
    }

    fn description(&self) -> &'static str {
        "Refined line crossing minus lap duration, interpolated to a lap start position."
    }

    fn evaluate(
        &self,
        session: &SessionSnapshot,
        driver: &str,
        candidate: &SpatialPoint,
    ) -> ConditionOutput {
        step_back_from_crossing(session, driver, candidate, self.window_s, |lap| {
            Some(lap.lap_time_s)
        })
    }
}

/// Like [`StartFinishCondition`], but steps back by the sector 3 time, which
/// yields the position of the sector 2/3 boundary for each lap.
#[derive(Clone, Debug)]
pub struct Sector3StartCondition {
    window_s: f64,
}

impl Sector3StartCondition {
    pub fn new(window_s: f64) -> Self {
        Self { window_s }
    }
}

impl Default for Sector3StartCondition {
    fn default() -> Self {
        Self::new(10.0)
    }
}

impl Condition for Sector3StartCondition {
    fn id(&self) -> &'static str {
        "sync.sector3_start.sector_time.v1"
    }

    fn name(&self) -> &'static str {
        "Sector 3 start from sector time"
    }

    fn description(&self) -> &'static str {
        "Refined line crossing minus sector 3 duration, interpolated to a sector start position."
    }

    fn evaluate(
        &self,
        session: &SessionSnapshot,
        driver: &str,
        candidate: &SpatialPoint,
    ) -> ConditionOutput {
        step_back_from_crossing(session, driver, candidate, self.window_s, |lap| {
            lap.sector3_time_s
        })
    }
}

fn step_back_from_crossing<F>(
    session: &SessionSnapshot,
    driver: &str,
    candidate: &SpatialPoint,
    window_s: f64,
    step_back_s: F,
) -> ConditionOutput
where
    F: Fn(&UsableLap) -> Option<f64>,
{
    let mut out = ConditionOutput::default();
    let trace = match session.trace(driver) {
        Ok(trace) => trace,
        Err(err) => {
            debug!("Skipping condition for driver {}: {}", driver, err);
            return out;
        }
    };

    for lap in session.laps.usable_laps(driver) {
        let Some(back_s) = step_back_s(&lap) else {
            continue;
        };
        let approx = session.lap_end(&lap);
        let Some(crossing) = refine_crossing(trace, approx, window_s, candidate) else {
            continue;
        };
        let start = offset_by_seconds(crossing, -back_s);
        // Outside the recorded span there is nothing to interpolate between.
        if !trace.covers(start) {
            continue;
        }
        if let Ok(point) = trace.position_at_time(start) {
            out.push(&point);
        }
    }
    out
}

/// Date at which the car's x coordinate equals `candidate.x`, interpolated
/// between the closest samples on either side of the candidate inside
/// `approx ± window_s`.
pub fn refine_crossing(
    trace: &PositionTrace,
    approx: DateTime<Utc>,
    window_s: f64,
    candidate: &SpatialPoint,
) -> Option<DateTime<Utc>> {
    let window = Duration::microseconds((window_s * 1_000_000.0).round() as i64);
    let samples = trace.samples_between(approx - window, approx + window);

    let before = closest_where(samples, candidate, |s| s.x < candidate.x)?;
    let after = closest_where(samples, candidate, |s| s.x >= candidate.x)?;

    // before.x < candidate.x <= after.x, so the span is never zero.
    let frac = (candidate.x - before.x) / (after.x - before.x);
    Some(offset_by_seconds(
        before.date,
        seconds_between(before.date, after.date) * frac,
    ))
}

fn closest_where<'a, P>(
    samples: &'a [PositionSample],
    candidate: &SpatialPoint,
    keep: P,
) -> Option<&'a PositionSample>
where
    P: Fn(&PositionSample) -> bool,
{
    samples
        .iter()
        .enumerate()
        .filter(|(_, s)| keep(*s))
        .min_by_key(|(i, s)| (OrderedFloat(candidate.sqr_dist(&s.point())), *i))
        .map(|(_, s)| s)
}
