//! Parameter record validation and display metadata
//!
//! Every rule is checked before anything touches storage, so a rejected
//! definition never leaves a half-created column behind.

use crate::config::Config;
use crate::entity::{EntityGraph, ValueType};
use crate::error::{FeidError, Result};
use crate::series::SeriesCatalogue;

use super::{ColumnRef, GenericColumn, GenericParams, Operation, ReferencePoint};

/// Display metadata resolved for a valid parameter record
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    pub pretty_name: String,
    pub description: String,
    pub value_type: ValueType,
}

pub struct Validator<'a> {
    graph: &'a EntityGraph,
    catalogue: &'a SeriesCatalogue,
    config: &'a Config,
    generics: &'a [GenericColumn],
}

impl<'a> Validator<'a> {
    pub fn new(
        graph: &'a EntityGraph,
        catalogue: &'a SeriesCatalogue,
        config: &'a Config,
        generics: &'a [GenericColumn],
    ) -> Self {
        Self {
            graph,
            catalogue,
            config,
            generics,
        }
    }

    pub fn validate(&self, entity: &str, params: &GenericParams) -> Result<ColumnMeta> {
        let def = self.graph.entity(entity)?;
        if !def.has_time {
            return Err(FeidError::validation("entity", format!("{} has no time column", entity)));
        }

        let op = params.operation;
        let value_type = if op.is_derived() {
            self.check_derived(entity, params)?
        } else {
            self.check_value_family(entity, params)?;
            ValueType::Real
        };

        Ok(ColumnMeta {
            name: params.physical_name(),
            pretty_name: self.pretty_name(entity, params),
            description: self.description(entity, params),
            value_type,
        })
    }

    /// Type of a static or generic operand column
    pub fn operand_type(&self, col: &ColumnRef) -> Result<ValueType> {
        if let Some(g) = self
            .generics
            .iter()
            .find(|g| g.entity == col.entity && g.name == col.name)
        {
            return Ok(g.value_type);
        }
        self.graph.static_column_type(&col.entity, &col.name)
    }

    fn check_derived(&self, entity: &str, params: &GenericParams) -> Result<ValueType> {
        if params.series.is_some() {
            return Err(forbidden("series", params.operation));
        }
        if params.reference.is_some() {
            return Err(forbidden("reference", params.operation));
        }
        if params.boundary.is_some() {
            return Err(forbidden("boundary", params.operation));
        }

        let column = params
            .column
            .as_ref()
            .ok_or_else(|| FeidError::validation("column", "required"))?;
        let column_type = self.check_operand(entity, "column", column)?;

        match params.operation {
            Operation::Clone => {
                if params.other_column.is_some() {
                    return Err(forbidden("other_column", params.operation));
                }
                let max = self.config.max_event_offset as i64;
                if params.shift == 0 || params.shift.abs() > max {
                    return Err(FeidError::validation(
                        "shift",
                        format!("event offset must be nonzero and within ±{}", max),
                    ));
                }
                Ok(column_type.exposed())
            }
            _ => {
                if params.shift != 0 {
                    return Err(forbidden("shift", params.operation));
                }
                let other = params
                    .other_column
                    .as_ref()
                    .ok_or_else(|| FeidError::validation("other_column", "required"))?;
                let other_type = self.check_operand(entity, "other_column", other)?;
                if !column_type.is_numeric() {
                    return Err(FeidError::validation("column", format!("{} is {}, not numeric", column, column_type)));
                }
                if !other_type.is_numeric() {
                    return Err(FeidError::validation(
                        "other_column",
                        format!("{} is {}, not numeric", other, other_type),
                    ));
                }
                Ok(ValueType::Real)
            }
        }
    }

    fn check_operand(&self, entity: &str, field: &str, col: &ColumnRef) -> Result<ValueType> {
        let value_type = self.operand_type(col).map_err(|_| {
            FeidError::validation(field, format!("unknown column {}", col))
        })?;
        self.graph
            .resolve_join_path(entity, &col.entity)
            .map_err(|e| FeidError::validation(field, e.to_string()))?;
        Ok(value_type)
    }

    fn check_value_family(&self, entity: &str, params: &GenericParams) -> Result<()> {
        let op = params.operation;
        if params.column.is_some() {
            return Err(forbidden("column", op));
        }
        if params.other_column.is_some() {
            return Err(forbidden("other_column", op));
        }

        match (&params.series, op.needs_series()) {
            (None, true) => return Err(FeidError::validation("series", "required")),
            (Some(_), false) => return Err(forbidden("series", op)),
            (Some(s), true) if !self.catalogue.contains(s) => {
                return Err(FeidError::validation("series", format!("unknown series '{}'", s)))
            }
            _ => {}
        }

        if op == Operation::TimeOffsetPercent && !self.graph.entity(entity)?.has_duration {
            return Err(FeidError::validation(
                "operation",
                format!("{} has no duration for time_offset_percent", entity),
            ));
        }

        if op.is_point_value() {
            if params.boundary.is_some() {
                return Err(forbidden("boundary", op));
            }
            self.check_hours("shift", params.shift)?;
        } else if params.shift != 0 {
            return Err(forbidden("shift", op));
        }

        if let Some(r) = &params.reference {
            self.check_point(entity, "reference", r)?;
        }
        if let Some(b) = &params.boundary {
            self.check_point(entity, "boundary", b)?;
        }
        Ok(())
    }

    fn check_point(&self, entity: &str, field: &str, point: &ReferencePoint) -> Result<()> {
        self.check_hours(field, point.hours_offset())?;
        match point {
            ReferencePoint::Event {
                entity: target,
                event_offset,
                ..
            } => {
                let def = self
                    .graph
                    .entity(target)
                    .map_err(|_| FeidError::validation(field, format!("unknown entity '{}'", target)))?;
                if !def.has_time {
                    return Err(FeidError::validation(field, format!("{} has no time column", target)));
                }
                let max = self.config.max_event_offset;
                if event_offset.abs() > max {
                    return Err(FeidError::validation(
                        field,
                        format!("event offset {} outside ±{}", event_offset, max),
                    ));
                }
                self.graph
                    .resolve_join_path(entity, target)
                    .map_err(|e| FeidError::validation(field, e.to_string()))?;
            }
            ReferencePoint::Extremum { series, .. } => {
                if !self.catalogue.contains(series) {
                    return Err(FeidError::validation(field, format!("unknown series '{}'", series)));
                }
            }
            ReferencePoint::Structure { structure, .. } => {
                let s = self
                    .graph
                    .structure(structure)
                    .map_err(|_| FeidError::validation(field, format!("unknown structure '{}'", structure)))?;
                self.graph
                    .resolve_join_path(entity, &s.entity)
                    .map_err(|e| FeidError::validation(field, e.to_string()))?;
            }
        }
        Ok(())
    }

    fn check_hours(&self, field: &str, hours: i64) -> Result<()> {
        let max = self.config.max_hour_offset;
        if hours.abs() > max {
            return Err(FeidError::validation(
                field,
                format!("hour offset {} outside ±{}h", hours, max),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Display metadata
    // ========================================================================

    fn series_label(&self, series: &Option<String>) -> String {
        series
            .as_deref()
            .map(|s| {
                self.catalogue
                    .get(s)
                    .map(|i| i.pretty_name.clone())
                    .unwrap_or_else(|_| s.to_string())
            })
            .unwrap_or_default()
    }

    fn column_label(&self, col: &ColumnRef) -> String {
        if let Some(g) = self
            .generics
            .iter()
            .find(|g| g.entity == col.entity && g.name == col.name)
        {
            return g.pretty_name.clone();
        }
        let entity = self.graph.entity(&col.entity).ok();
        let column = entity
            .and_then(|e| e.column(&col.name))
            .map(|c| c.pretty_name.clone())
            .unwrap_or_else(|| col.name.clone());
        match entity {
            Some(e) => format!("{} {}", e.pretty_name, column),
            None => column,
        }
    }

    fn point_label(&self, point: &ReferencePoint) -> String {
        let (mut label, hours) = match point {
            ReferencePoint::Event {
                entity,
                end,
                event_offset,
                hours_offset,
            } => {
                let name = self
                    .graph
                    .entity(entity)
                    .map(|e| e.pretty_name.clone())
                    .unwrap_or_else(|_| entity.clone());
                let mut s = format!("{} {}", name, if *end { "end" } else { "start" });
                if *event_offset != 0 {
                    s.push_str(&format!(" [{:+}]", event_offset));
                }
                (s, *hours_offset)
            }
            ReferencePoint::Extremum {
                extremum,
                series,
                hours_offset,
            } => (
                format!("{} {}", extremum.as_str(), self.series_label(&Some(series.clone()))),
                *hours_offset,
            ),
            ReferencePoint::Structure {
                structure,
                end,
                hours_offset,
            } => {
                let name = self
                    .graph
                    .structure(structure)
                    .map(|s| s.pretty_name.clone())
                    .unwrap_or_else(|_| structure.clone());
                (format!("{} {}", name, if *end { "end" } else { "start" }), *hours_offset)
            }
        };
        if hours != 0 {
            label.push_str(&format!(" {:+}h", hours));
        }
        label
    }

    pub fn pretty_name(&self, entity: &str, params: &GenericParams) -> String {
        let series = self.series_label(&params.series);
        let window = match (&params.reference, &params.boundary) {
            (None, None) => String::new(),
            _ => format!(
                " [{} to {}]",
                self.point_label(&params.reference_or_default(entity)),
                self.point_label(&params.boundary_or_default(entity))
            ),
        };

        match params.operation {
            Operation::Value | Operation::AvgValue => {
                let mut s = format!("{} at {}", series, self.point_label(&params.reference_or_default(entity)));
                if params.shift != 0 {
                    let kind = if params.operation == Operation::AvgValue { "avg" } else { "" };
                    s.push_str(&format!(" {}{:+}h", kind, params.shift));
                }
                s
            }
            Operation::TimeOffset | Operation::TimeOffsetPercent => {
                let unit = if params.operation == Operation::TimeOffset { "h" } else { "%" };
                format!(
                    "offset {} ({}){}",
                    self.point_label(&params.boundary_or_default(entity)),
                    unit,
                    match &params.reference {
                        Some(r) => format!(" from {}", self.point_label(r)),
                        None => String::new(),
                    }
                )
            }
            Operation::Clone => {
                let col = params.column.as_ref().map(|c| self.column_label(c)).unwrap_or_default();
                format!("{} [{:+}]", col, params.shift)
            }
            Operation::Diff | Operation::AbsDiff => {
                let a = params.column.as_ref().map(|c| self.column_label(c)).unwrap_or_default();
                let b = params
                    .other_column
                    .as_ref()
                    .map(|c| self.column_label(c))
                    .unwrap_or_default();
                if params.operation == Operation::AbsDiff {
                    format!("|{} - {}|", a, b)
                } else {
                    format!("{} - {}", a, b)
                }
            }
            op => format!("{} {}{}", op.as_str().replace('_', " "), series, window),
        }
    }

    pub fn description(&self, entity: &str, params: &GenericParams) -> String {
        let series = self.series_label(&params.series);
        let from = self.point_label(&params.reference_or_default(entity));
        let to = self.point_label(&params.boundary_or_default(entity));

        match params.operation {
            Operation::Value => format!("Value of {} at {}, shifted by {} h", series, from, params.shift),
            Operation::AvgValue => format!(
                "Average of {} over {} h from {}",
                series,
                params.shift.abs().max(1),
                from
            ),
            Operation::Range => format!("Max minus min of {} between {} and {}", series, from, to),
            Operation::Coverage => format!("Percent of hours with {} data between {} and {}", series, from, to),
            Operation::TimeOffset => format!("Hours from {} to {}", from, to),
            Operation::TimeOffsetPercent => {
                format!("Hours from {} to {} as percent of event duration", from, to)
            }
            Operation::Clone => format!(
                "{} of the event {:+} relative to this one",
                params.column.as_ref().map(|c| self.column_label(c)).unwrap_or_default(),
                params.shift
            ),
            Operation::Diff | Operation::AbsDiff => format!(
                "{}difference of {} and {}",
                if params.operation == Operation::AbsDiff { "Absolute " } else { "" },
                params.column.as_ref().map(|c| self.column_label(c)).unwrap_or_default(),
                params
                    .other_column
                    .as_ref()
                    .map(|c| self.column_label(c))
                    .unwrap_or_default()
            ),
            op => format!("{} of {} between {} and {}", op.as_str(), series, from, to),
        }
    }
}

fn forbidden(field: &str, op: Operation) -> FeidError {
    FeidError::validation(field, format!("not allowed for {}", op))
}
