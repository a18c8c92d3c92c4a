//! Series catalogue and hourly series access
//!
//! Maps a logical series name ("sw_speed") to the source table and physical
//! column it is stored in. Raw acquisition lives elsewhere; the engine only
//! reads through [`SeriesSource`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{FeidError, Result};

pub const HOUR: i64 = 3600;

/// Epoch seconds to epoch hours, flooring for times before 1970 as well
pub fn hour_of(epoch_seconds: i64) -> i64 {
    epoch_seconds.div_euclid(HOUR)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// OMNI solar wind and IMF
    Omni,
    /// Global survey method anisotropy
    Gsm,
    /// Neutron monitor network
    Neutron,
}

impl DataSource {
    pub fn table(self) -> &'static str {
        match self {
            DataSource::Omni => "omni",
            DataSource::Gsm => "gsm_result",
            DataSource::Neutron => "neutron_counts",
        }
    }

    pub fn all() -> [DataSource; 3] {
        [DataSource::Omni, DataSource::Gsm, DataSource::Neutron]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesInfo {
    pub name: String,
    pub pretty_name: String,
    pub source: DataSource,
    pub db_column: String,
}

#[derive(Debug, Clone)]
pub struct SeriesCatalogue {
    series: Vec<SeriesInfo>,
}

impl SeriesCatalogue {
    pub fn new(series: Vec<SeriesInfo>) -> Self {
        Self { series }
    }

    pub fn feid() -> Self {
        use DataSource::*;

        let entries: &[(&str, &str, DataSource, &str)] = &[
            ("sw_speed", "V", Omni, "sw_speed"),
            ("sw_density", "D", Omni, "sw_density"),
            ("sw_temperature", "T", Omni, "sw_temperature"),
            ("plasma_beta", "beta", Omni, "plasma_beta"),
            ("imf_scalar", "B", Omni, "imf_scalar"),
            ("imf_x", "Bx", Omni, "imf_x"),
            ("imf_y", "By", Omni, "imf_y"),
            ("imf_z", "Bz", Omni, "imf_z"),
            ("dst_index", "Dst", Omni, "dst_index"),
            ("kp_index", "Kp", Omni, "kp_index"),
            ("ap_index", "Ap", Omni, "ap_index"),
            ("a0", "A0", Gsm, "a10"),
            ("a0m", "A0m", Gsm, "a10m"),
            ("axy", "Axy", Gsm, "axy"),
            ("az", "Az", Gsm, "az"),
            ("nm_oulu", "OULU", Neutron, "oulu"),
            ("nm_apty", "APTY", Neutron, "apty"),
        ];

        Self::new(
            entries
                .iter()
                .map(|(name, pretty, source, col)| SeriesInfo {
                    name: name.to_string(),
                    pretty_name: pretty.to_string(),
                    source: *source,
                    db_column: col.to_string(),
                })
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Result<&SeriesInfo> {
        self.series
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| FeidError::not_found("series", name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.series.iter().any(|s| s.name == name)
    }

    pub fn all(&self) -> &[SeriesInfo] {
        &self.series
    }

    pub fn columns_of(&self, source: DataSource) -> Vec<&str> {
        self.series
            .iter()
            .filter(|s| s.source == source)
            .map(|s| s.db_column.as_str())
            .collect()
    }
}

/// Hourly samples with strictly increasing hours.
///
/// Sources are expected to return one entry per hour with gaps as `None`,
/// but lookups go through binary search so elided hours are still gaps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HourlySeries {
    pub hours: Vec<i64>,
    pub values: Vec<Option<f64>>,
}

impl HourlySeries {
    pub fn new(points: Vec<(i64, Option<f64>)>) -> Self {
        let (hours, values) = points.into_iter().unzip();
        Self { hours, values }
    }

    /// Index range of samples whose hour lies in `[lo, hi]`
    pub fn span(&self, lo: i64, hi: i64) -> std::ops::Range<usize> {
        let start = self.hours.partition_point(|&h| h < lo);
        let end = self.hours.partition_point(|&h| h <= hi);
        start..end.max(start)
    }

    /// Dense samples for every hour in `[lo, hi]`, `None` where absent
    pub fn window(&self, lo: i64, hi: i64) -> Vec<Option<f64>> {
        if hi < lo {
            return Vec::new();
        }
        let mut out = vec![None; (hi - lo + 1) as usize];
        for i in self.span(lo, hi) {
            if let Some(v) = self.values[i].filter(|v| v.is_finite()) {
                out[(self.hours[i] - lo) as usize] = Some(v);
            }
        }
        out
    }

    pub fn at(&self, hour: i64) -> Option<f64> {
        self.window(hour, hour).into_iter().next().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.hours.is_empty()
    }
}

/// External collaborator that produces raw hourly series.
pub trait SeriesSource: Send + Sync {
    /// Samples of `series` for every hour in `[from_hour, to_hour]`.
    fn fetch_series(&self, series: &SeriesInfo, from_hour: i64, to_hour: i64) -> Result<HourlySeries>;
}

/// Series held in memory, keyed by logical name
#[derive(Debug, Default)]
pub struct MemorySeries {
    data: RwLock<HashMap<String, Vec<(i64, Option<f64>)>>>,
}

impl MemorySeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the samples of a series; `points` may be in any order.
    pub fn insert(&self, name: &str, mut points: Vec<(i64, Option<f64>)>) {
        points.sort_by_key(|(h, _)| *h);
        points.dedup_by_key(|(h, _)| *h);
        if let Ok(mut data) = self.data.write() {
            data.insert(name.to_string(), points);
        }
    }

    /// Convenience for consecutive hours starting at `start_hour`
    pub fn insert_hourly(&self, name: &str, start_hour: i64, values: &[Option<f64>]) {
        let points = values
            .iter()
            .enumerate()
            .map(|(i, v)| (start_hour + i as i64, *v))
            .collect();
        self.insert(name, points);
    }
}

impl SeriesSource for MemorySeries {
    fn fetch_series(&self, series: &SeriesInfo, from_hour: i64, to_hour: i64) -> Result<HourlySeries> {
        let data = self
            .data
            .read()
            .map_err(|_| FeidError::computation(&series.name, "series cache poisoned"))?;
        let points = data.get(&series.name).map(Vec::as_slice).unwrap_or(&[]);
        let stored = HourlySeries::new(points.to_vec());

        let dense = stored.window(from_hour, to_hour);
        let hours = (from_hour..=to_hour).collect();
        Ok(HourlySeries { hours, values: dense })
    }
}
