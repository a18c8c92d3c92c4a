//! Generic column computation
//!
//! A column is always computed for every event of its entity at once: the
//! timeline, related-entity mappings and series samples are loaded once and
//! then reduced per event in ascending time order.

pub mod ops;
pub mod window;

use std::collections::HashMap;

use tracing::debug;

use crate::config::Config;
use crate::db::Database;
use crate::entity::{EntityDef, EntityGraph};
use crate::error::{FeidError, Result};
use crate::generic::{ColumnRef, GenericColumn, Operation, ReferencePoint};
use crate::series::{hour_of, HourlySeries, SeriesCatalogue, SeriesSource};

pub use crate::db::ColumnData;
use window::{averaged_hours, inclusive, within_span, Timeline};

/// Values for every event of an entity, aligned with `ids`
#[derive(Debug, Clone, PartialEq)]
pub struct Computed {
    pub ids: Vec<i64>,
    pub data: ColumnData,
}

impl Computed {
    /// Keep only the entries for `id`
    pub fn restrict_to(self, id: i64) -> Self {
        let pos = self.ids.iter().position(|&x| x == id);
        let ids = pos.map(|_| vec![id]).unwrap_or_default();
        let data = match (self.data, pos) {
            (ColumnData::Real(v), Some(p)) => ColumnData::Real(vec![v[p]]),
            (ColumnData::Text(mut v), Some(p)) => ColumnData::Text(vec![v.swap_remove(p)]),
            (ColumnData::Real(_), None) => ColumnData::Real(Vec::new()),
            (ColumnData::Text(_), None) => ColumnData::Text(Vec::new()),
        };
        Self { ids, data }
    }
}

pub struct Computer<'a> {
    db: &'a Database,
    series: &'a dyn SeriesSource,
    graph: &'a EntityGraph,
    catalogue: &'a SeriesCatalogue,
    config: &'a Config,
}

impl<'a> Computer<'a> {
    pub fn new(
        db: &'a Database,
        series: &'a dyn SeriesSource,
        graph: &'a EntityGraph,
        catalogue: &'a SeriesCatalogue,
        config: &'a Config,
    ) -> Self {
        Self {
            db,
            series,
            graph,
            catalogue,
            config,
        }
    }

    pub fn compute(&self, column: &GenericColumn) -> Result<Computed> {
        let def = self.graph.entity(&column.entity)?;
        let timeline = self.timeline(def)?;
        let params = &column.params;

        let data = match params.operation {
            Operation::Clone => self.clone_column(column, &timeline)?,
            Operation::Diff | Operation::AbsDiff => ColumnData::Real(self.diff(column, &timeline)?),
            Operation::TimeOffset | Operation::TimeOffsetPercent => {
                ColumnData::Real(self.time_offset(column, &timeline)?)
            }
            Operation::Value | Operation::AvgValue => ColumnData::Real(self.point_value(column, &timeline)?),
            _ => ColumnData::Real(self.reduce(column, &timeline)?),
        };

        debug!(column = %column.name, events = timeline.len(), "computed");
        Ok(Computed {
            ids: timeline.ids,
            data,
        })
    }

    fn timeline(&self, def: &EntityDef) -> Result<Timeline> {
        let rows = self.db.event_rows(def)?;
        Ok(Timeline::build(
            &def.name,
            rows,
            def.has_duration,
            self.config.max_window_hours,
            self.config.max_span_hours,
        ))
    }

    // ========================================================================
    // Reference points
    // ========================================================================

    /// Hour of a reference point for every event of the timeline
    fn resolve_point(&self, timeline: &Timeline, point: &ReferencePoint) -> Result<Vec<Option<i64>>> {
        let hours: Vec<Option<i64>> = match point {
            ReferencePoint::Event {
                entity,
                end,
                event_offset,
                ..
            } => {
                if *entity == timeline.entity {
                    (0..timeline.len())
                        .map(|i| timeline.point(Some(i), *event_offset, *end))
                        .collect()
                } else {
                    let target = self.timeline(self.graph.entity(entity)?)?;
                    let path = self.graph.resolve_join_path(&timeline.entity, entity)?;
                    let related = self.db.related_ids(&timeline.entity, &path)?;
                    timeline
                        .ids
                        .iter()
                        .map(|id| {
                            let idx = related.get(id).copied().flatten().and_then(|r| target.index_of(r));
                            target.point(idx, *event_offset, *end)
                        })
                        .collect()
                }
            }
            ReferencePoint::Extremum { extremum, series, .. } => {
                let windows: Vec<Option<(i64, i64)>> = (0..timeline.len())
                    .map(|i| Some(self.extend(series, timeline.default_window(i), true)))
                    .collect();
                let data = self.fetch(series, &windows)?;
                let detrended = self.config.is_detrended(series);
                windows
                    .iter()
                    .map(|w| {
                        let (lo, hi) = (*w)?;
                        let mut samples = data.window(lo, hi);
                        if detrended {
                            samples = ops::detrend(&samples);
                        }
                        ops::extremum_index(&samples, *extremum).map(|i| lo + i as i64)
                    })
                    .collect()
            }
            ReferencePoint::Structure { structure, end, .. } => {
                let s = self.graph.structure(structure)?;
                let column = match (end, &s.end_column) {
                    (false, _) => &s.start_column,
                    (true, Some(c)) => c,
                    (true, None) => return Ok(vec![None; timeline.len()]),
                };
                let path = self.graph.resolve_join_path(&timeline.entity, &s.entity)?;
                let times = self.db.select_real(&timeline.entity, &path, column)?;
                timeline
                    .ids
                    .iter()
                    .map(|id| times.get(id).copied().flatten().map(|t| hour_of(t as i64)))
                    .collect()
            }
        };

        let offset = point.hours_offset();
        Ok(hours.into_iter().map(|h| h.map(|h| h + offset)).collect())
    }

    // ========================================================================
    // Series access
    // ========================================================================

    /// Reach back `detrend_extension_hours` before a de-trended window
    fn extend(&self, series: &str, (lo, hi): (i64, i64), applies: bool) -> (i64, i64) {
        if applies && self.config.is_detrended(series) {
            (lo - self.config.detrend_extension_hours, hi)
        } else {
            (lo, hi)
        }
    }

    /// Fetch every window, one request per cluster of windows less than
    /// `max_span_hours` apart. An outlying window gets its own small request
    /// instead of stretching one dense fetch across the gap.
    fn fetch(&self, series: &str, windows: &[Option<(i64, i64)>]) -> Result<HourlySeries> {
        let info = self.catalogue.get(series)?;
        let mut spans: Vec<(i64, i64)> = windows.iter().flatten().copied().collect();
        spans.sort_unstable();

        let mut clusters: Vec<(i64, i64)> = Vec::new();
        for (lo, hi) in spans {
            match clusters.last_mut() {
                Some(last) if lo <= last.1.saturating_add(self.config.max_span_hours) => last.1 = last.1.max(hi),
                _ => clusters.push((lo, hi)),
            }
        }

        let mut data = HourlySeries::default();
        for (lo, hi) in clusters {
            let part = self.series.fetch_series(info, lo, hi)?;
            data.hours.extend(part.hours);
            data.values.extend(part.values);
        }
        Ok(data)
    }

    fn series_name<'p>(&self, column: &'p GenericColumn) -> Result<&'p str> {
        column
            .params
            .series
            .as_deref()
            .ok_or_else(|| FeidError::computation(&column.name, "operation needs a series"))
    }

    // ========================================================================
    // Operations
    // ========================================================================

    fn reduce(&self, column: &GenericColumn, timeline: &Timeline) -> Result<Vec<Option<f64>>> {
        let params = &column.params;
        let op = params.operation;
        let series = self.series_name(column)?;
        let detrend = op != Operation::Coverage && self.config.is_detrended(series);

        let refs = self.resolve_point(timeline, &params.reference_or_default(&column.entity))?;
        let bounds = self.resolve_point(timeline, &params.boundary_or_default(&column.entity))?;
        let windows: Vec<Option<(i64, i64)>> = refs
            .iter()
            .zip(&bounds)
            .map(|(r, b)| {
                let window = within_span(inclusive((*r)?, (*b)?), self.config.max_span_hours);
                if window.is_none() {
                    debug!(column = %column.name, "window longer than max_span_hours skipped");
                }
                Some(self.extend(series, window?, detrend))
            })
            .collect();

        let data = self.fetch(series, &windows)?;
        let decimals = if op == Operation::Coverage { 1 } else { 2 };

        windows
            .iter()
            .map(|w| {
                let Some((lo, hi)) = *w else {
                    return Ok(None);
                };
                let mut samples = data.window(lo, hi);
                if detrend {
                    samples = ops::detrend(&samples);
                }
                let value = match op {
                    Operation::Min | Operation::Max | Operation::AbsMin | Operation::AbsMax => {
                        let ext = op
                            .as_extremum()
                            .ok_or_else(|| FeidError::computation(&column.name, "not an extremum"))?;
                        ops::extremum_value(&samples, ext)
                    }
                    Operation::Range => ops::range(&samples),
                    Operation::Mean => ops::mean(&samples),
                    Operation::Median => ops::median(&samples),
                    Operation::Coverage => ops::coverage(&samples),
                    other => {
                        return Err(FeidError::computation(
                            &column.name,
                            format!("{} is not a window reduction", other),
                        ))
                    }
                };
                Ok(ops::round_to(value, decimals))
            })
            .collect()
    }

    fn point_value(&self, column: &GenericColumn, timeline: &Timeline) -> Result<Vec<Option<f64>>> {
        let params = &column.params;
        let series = self.series_name(column)?;
        let detrend = self.config.is_detrended(series);

        let anchors = self.resolve_point(timeline, &params.reference_or_default(&column.entity))?;
        // sampled hours, and the span fetched for them
        let spans: Vec<Option<((i64, i64), (i64, i64))>> = anchors
            .iter()
            .map(|a| {
                let a = (*a)?;
                let sampled = match params.operation {
                    Operation::AvgValue => averaged_hours(a, params.shift),
                    _ => (a + params.shift, a + params.shift),
                };
                let fetched = self.extend(series, (a.min(sampled.0), sampled.1), detrend);
                Some((sampled, fetched))
            })
            .collect();

        let windows: Vec<Option<(i64, i64)>> = spans.iter().map(|s| s.map(|s| s.1)).collect();
        let data = self.fetch(series, &windows)?;
        let divisor = self.config.avg_missing_divisor;

        Ok(spans
            .iter()
            .map(|s| {
                let ((lo, hi), (flo, fhi)) = (*s)?;
                let mut samples = data.window(flo, fhi);
                if detrend {
                    samples = ops::detrend(&samples);
                }
                let from = (lo - flo) as usize;
                let to = (hi - flo) as usize;
                ops::round_to(ops::tolerant_mean(&samples[from..=to], divisor), 2)
            })
            .collect())
    }

    fn time_offset(&self, column: &GenericColumn, timeline: &Timeline) -> Result<Vec<Option<f64>>> {
        let params = &column.params;
        let refs = self.resolve_point(timeline, &params.reference_or_default(&column.entity))?;
        let bounds = self.resolve_point(timeline, &params.boundary_or_default(&column.entity))?;
        let percent = params.operation == Operation::TimeOffsetPercent;

        Ok(refs
            .iter()
            .zip(&bounds)
            .zip(&timeline.durations)
            .map(|((r, b), d)| {
                let offset = ((*b)? - (*r)?) as f64;
                let value = if percent {
                    let d = (*d).filter(|d| *d > 0.0)?;
                    100.0 * offset / d
                } else {
                    offset
                };
                ops::round_to(Some(value), 1)
            })
            .collect())
    }

    fn operand(&self, column: &GenericColumn, field: &str) -> Result<ColumnRef> {
        let operand = match field {
            "column" => column.params.column.clone(),
            _ => column.params.other_column.clone(),
        };
        operand.ok_or_else(|| FeidError::computation(&column.name, format!("{} missing", field)))
    }

    fn real_operand(&self, timeline: &Timeline, operand: &ColumnRef) -> Result<Vec<Option<f64>>> {
        let path = self.graph.resolve_join_path(&timeline.entity, &operand.entity)?;
        let values = self.db.select_real(&timeline.entity, &path, &operand.name)?;
        Ok(timeline.ids.iter().map(|id| values.get(id).copied().flatten()).collect())
    }

    fn clone_column(&self, column: &GenericColumn, timeline: &Timeline) -> Result<ColumnData> {
        let operand = self.operand(column, "column")?;
        let shift = column.params.shift;
        let source = |i: usize| timeline.shifted(Some(i), shift);

        if column.value_type.is_stored_numeric() {
            let values = self.real_operand(timeline, &operand)?;
            Ok(ColumnData::Real(
                (0..timeline.len()).map(|i| source(i).and_then(|j| values[j])).collect(),
            ))
        } else {
            let path = self.graph.resolve_join_path(&timeline.entity, &operand.entity)?;
            let values: HashMap<i64, Option<String>> =
                self.db.select_text(&timeline.entity, &path, &operand.name)?;
            Ok(ColumnData::Text(
                (0..timeline.len())
                    .map(|i| {
                        let j = source(i)?;
                        values.get(&timeline.ids[j]).cloned().flatten()
                    })
                    .collect(),
            ))
        }
    }

    fn diff(&self, column: &GenericColumn, timeline: &Timeline) -> Result<Vec<Option<f64>>> {
        let a = self.real_operand(timeline, &self.operand(column, "column")?)?;
        let b = self.real_operand(timeline, &self.operand(column, "other_column")?)?;
        let abs = column.params.operation == Operation::AbsDiff;
        Ok(a.iter()
            .zip(&b)
            .map(|(a, b)| {
                let d = (*a)? - (*b)?;
                ops::round_to(Some(if abs { d.abs() } else { d }), 2)
            })
            .collect())
    }
}
