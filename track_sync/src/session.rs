use std::collections::BTreeMap;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

use crate::laps::{LapTable, UsableLap};
use crate::trace::{offset_by_seconds, PositionTrace};
use crate::track::Track;
use crate::{DriverId, SyncError};

/// Read-only session data shared by every condition and worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub track: Track,
    pub traces: BTreeMap<DriverId, PositionTrace>,
    pub laps: LapTable,
    pub session_start: DateTime<Utc>,
}

impl SessionSnapshot {
    /// Bundle the session data. Without an explicit `session_start` it is
    /// derived from the position data, see [`derive_session_start`].
    pub fn new(
        track: Track,
        traces: BTreeMap<DriverId, PositionTrace>,
        laps: LapTable,
        session_start: Option<DateTime<Utc>>,
    ) -> Result<Self, SyncError> {
        let session_start = match session_start {
            Some(start) => start,
            None => derive_session_start(&traces)?,
        };
        Ok(Self {
            track,
            traces,
            laps,
            session_start,
        })
    }

    pub fn drivers(&self) -> impl Iterator<Item = &DriverId> {
        self.traces.keys()
    }

    pub fn trace(&self, driver: &str) -> Result<&PositionTrace, SyncError> {
        self.traces
            .get(driver)
            .ok_or_else(|| SyncError::UnknownDriver(driver.to_string()))
    }

    /// Date at which the timing feed registered the end of `lap`.
    pub fn lap_end(&self, lap: &UsableLap) -> DateTime<Utc> {
        offset_by_seconds(self.session_start, lap.time_s)
    }
}

/// Sessions start on a full minute: the first sample of the first driver,
/// rounded to the nearest minute.
pub fn derive_session_start(
    traces: &BTreeMap<DriverId, PositionTrace>,
) -> Result<DateTime<Utc>, SyncError> {
    let first = traces
        .values()
        .next()
        .and_then(|trace| trace.first_date())
        .ok_or_else(|| {
            SyncError::InsufficientData("no position samples to derive the session start".into())
        })?;
    first
        .duration_round(Duration::minutes(1))
        .map_err(|e| SyncError::InvalidParameter(format!("session start rounding: {}", e)))
}
