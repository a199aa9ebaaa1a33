//! Track map reconstruction and start/finish line synchronization from
//! position telemetry.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod condition;
pub mod laps;
pub mod point;
pub mod pool;
pub mod sequencing;
pub mod session;
pub mod solver;
pub mod stats;
pub mod trace;
pub mod track;

pub use condition::{Condition, ConditionOutput, Sector3StartCondition, StartFinishCondition};
pub use laps::{LapRecord, LapTable};
pub use point::SpatialPoint;
pub use pool::{SolverTask, StepReport, WorkerPool};
pub use session::SessionSnapshot;
pub use solver::{AggregatedResult, GridSearchSolver, LineRange, SweepResults};
pub use trace::{PositionSample, PositionTrace, TrackStatus};
pub use track::{Axis, Track, TrackMapBuilder};

/// Identifier of a car/driver as used by the timing feed (racing number).
pub type DriverId = String;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("degenerate track: only {0} point(s) survived sequencing")]
    DegenerateTrack(usize),
    #[error("point ({x}, {y}) is not part of the track")]
    PointNotOnTrack { x: f64, y: f64 },
    #[error("unknown driver: {0}")]
    UnknownDriver(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("worker pool protocol violation: {0}")]
    PoolProtocol(String),
    #[error("worker {0} panicked")]
    WorkerPanicked(usize),
    #[error("solver used before setup")]
    NotSetUp,
    #[error("failed to load configuration: {0}")]
    Config(String),
}

/// Strategy used to find the next nearest point while sequencing the track.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SequencingEngine {
    /// Scan every remaining point on each step.
    Exhaustive,
    /// Bucket points into cells and search outward ring by ring.
    Grid,
}

impl Default for SequencingEngine {
    fn default() -> Self {
        SequencingEngine::Grid
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackParams {
    /// Maximum `sqr_dist` between consecutive track points. Typical spacing is ~100.
    pub outlier_threshold: f64,
    pub engine: SequencingEngine,
}

impl Default for TrackParams {
    fn default() -> Self {
        Self {
            outlier_threshold: 200.0,
            engine: SequencingEngine::Grid,
        }
    }
}

impl TrackParams {
    pub fn from_json_str(input: &str) -> Result<Self, SyncError> {
        let params: Self = parse_json(input)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, SyncError> {
        Self::from_json_str(&read_config(path)?)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if !(self.outlier_threshold.is_finite() && self.outlier_threshold > 0.0) {
            return Err(SyncError::InvalidParameter(format!(
                "outlier_threshold must be a positive number, got {}",
                self.outlier_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverParams {
    pub workers: usize,
    /// Distance between two candidate x positions in the sweep.
    pub sweep_step: f64,
    /// Half width of the search window around the reported lap end (seconds).
    pub lap_window_s: f64,
    /// Multiplier of the median absolute deviation used when estimating the line range.
    pub outlier_mad_multiplier: f64,
    /// Explicit session start; derived from the position data when absent.
    pub session_start: Option<DateTime<Utc>>,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            workers: 2,
            sweep_step: 15.0,
            lap_window_s: 10.0,
            outlier_mad_multiplier: 100.0,
            session_start: None,
        }
    }
}

impl SolverParams {
    pub fn from_json_str(input: &str) -> Result<Self, SyncError> {
        let params: Self = parse_json(input)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, SyncError> {
        Self::from_json_str(&read_config(path)?)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.workers == 0 {
            return Err(SyncError::InvalidParameter(
                "at least one worker is required".into(),
            ));
        }
        if !(self.sweep_step.is_finite() && self.sweep_step > 0.0) {
            return Err(SyncError::InvalidParameter(format!(
                "sweep_step must be a positive number, got {}",
                self.sweep_step
            )));
        }
        if !(self.lap_window_s.is_finite() && self.lap_window_s > 0.0) {
            return Err(SyncError::InvalidParameter(format!(
                "lap_window_s must be a positive number, got {}",
                self.lap_window_s
            )));
        }
        if self.outlier_mad_multiplier.is_nan() || self.outlier_mad_multiplier <= 0.0 {
            return Err(SyncError::InvalidParameter(format!(
                "outlier_mad_multiplier must be positive, got {}",
                self.outlier_mad_multiplier
            )));
        }
        Ok(())
    }
}

fn parse_json<T: DeserializeOwned>(input: &str) -> Result<T, SyncError> {
    serde_json::from_str(input).map_err(|e| SyncError::Config(e.to_string()))
}

fn read_config(path: &Path) -> Result<String, SyncError> {
    fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
}
