use serde::{Deserialize, Serialize};

use crate::DriverId;

/// One row of the lap timing table. All times are in seconds; `time_s` is the
/// session time at which the lap was registered, i.e. roughly its end.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LapRecord {
    pub driver: DriverId,
    pub lap_number: Option<u32>,
    pub time_s: Option<f64>,
    /// Duration of the lap (the feed's "last lap time").
    pub lap_time_s: Option<f64>,
    pub sector3_time_s: Option<f64>,
    pub pit_in_time_s: Option<f64>,
    pub pit_out_time_s: Option<f64>,
}

/// A lap that can be trusted for synchronization.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UsableLap {
    pub lap_number: u32,
    pub time_s: f64,
    pub lap_time_s: f64,
    pub sector3_time_s: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LapTable {
    records: Vec<LapRecord>,
}

impl LapTable {
    pub fn new(records: Vec<LapRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[LapRecord] {
        &self.records
    }

    pub fn for_driver<'a>(&'a self, driver: &'a str) -> impl Iterator<Item = &'a LapRecord> + 'a {
        self.records.iter().filter(move |r| r.driver == driver)
    }

    /// Highest lap number recorded for `driver`.
    pub fn last_lap(&self, driver: &str) -> Option<u32> {
        self.for_driver(driver).filter_map(|r| r.lap_number).max()
    }

    /// Laps of `driver` in table order, skipping the first and last lap, in
    /// and out laps, and rows with missing lap number or timing.
    pub fn usable_laps(&self, driver: &str) -> Vec<UsableLap> {
        let last = self.last_lap(driver);
        self.for_driver(driver)
            .filter_map(|r| {
                let lap_number = r.lap_number?;
                if lap_number == 1 || Some(lap_number) == last {
                    return None;
                }
                if r.pit_in_time_s.is_some() || r.pit_out_time_s.is_some() {
                    return None;
                }
                Some(UsableLap {
                    lap_number,
                    time_s: r.time_s?,
                    lap_time_s: r.lap_time_s?,
                    sector3_time_s: r.sector3_time_s,
                })
            })
            .collect()
    }
}
