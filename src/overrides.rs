//! Manual edits and the changelog
//!
//! Computed values are written to storage with any binding manual edit
//! already applied, so reads never have to consult the changelog. A binding
//! edit is the most recent changelog entry for an (event, column) pair whose
//! value is not `"auto"`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::db::{now, Cell, ColumnData, Database, NewChangelogEntry};
use crate::entity::{EntityGraph, ValueType};
use crate::error::{FeidError, Result};
use crate::generic::GenericColumn;

/// Value that releases a manual edit back to the computed value
pub const AUTO: &str = "auto";

/// Replace values of events carrying a binding edit.
///
/// `latest` holds the most recent changelog value per event. The result
/// depends only on the inputs, so applying it twice is the same as once.
pub fn apply_overrides(
    column: &str,
    value_type: ValueType,
    ids: &[i64],
    values: ColumnData,
    latest: &[(i64, Option<String>)],
) -> Result<ColumnData> {
    let positions: HashMap<i64, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let binding: Vec<(usize, Option<&str>)> = latest
        .iter()
        .filter(|(_, v)| v.as_deref() != Some(AUTO))
        .filter_map(|(id, v)| positions.get(id).map(|&i| (i, v.as_deref())))
        .collect();
    if binding.is_empty() {
        return Ok(values);
    }

    match values {
        ColumnData::Real(mut out) => {
            for (i, v) in binding {
                out[i] = match v {
                    Some(text) => parse_number(text, value_type)
                        .map_err(|e| FeidError::computation(column, format!("bad override: {}", e)))?,
                    None => None,
                };
            }
            Ok(ColumnData::Real(out))
        }
        ColumnData::Text(mut out) => {
            for (i, v) in binding {
                out[i] = v.map(str::to_string);
            }
            Ok(ColumnData::Text(out))
        }
    }
}

fn parse_number(text: &str, value_type: ValueType) -> std::result::Result<Option<f64>, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let v: f64 = text.parse().map_err(|_| format!("'{}' is not a number", text))?;
    if !v.is_finite() {
        return Err(format!("'{}' is not finite", text));
    }
    if matches!(value_type, ValueType::Integer | ValueType::Time) && v.fract() != 0.0 {
        return Err(format!("'{}' is not an integer", text));
    }
    Ok(Some(v))
}

/// Parse operator input into a storable cell
pub fn parse_cell(text: Option<&str>, value_type: ValueType, enum_values: &[String]) -> std::result::Result<Cell, String> {
    let Some(text) = text else {
        return Ok(Cell::Null);
    };
    match value_type {
        ValueType::Real => Ok(parse_number(text, value_type)?.map(Cell::Real).unwrap_or(Cell::Null)),
        ValueType::Integer | ValueType::Time => Ok(parse_number(text, value_type)?
            .map(|v| Cell::Integer(v as i64))
            .unwrap_or(Cell::Null)),
        ValueType::Text => Ok(Cell::Text(text.to_string())),
        ValueType::Enum => {
            if enum_values.iter().any(|e| e == text) {
                Ok(Cell::Text(text.to_string()))
            } else {
                Err(format!("'{}' is not one of {:?}", text, enum_values))
            }
        }
    }
}

fn cell_text(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Null => None,
        Cell::Real(v) => Some(v.to_string()),
        Cell::Integer(v) => Some(v.to_string()),
        Cell::Text(s) => Some(s.clone()),
    }
}

fn same_value(old: Option<&str>, new: &Cell) -> bool {
    match (old, new) {
        (None, Cell::Null) => true,
        (Some(o), Cell::Real(n)) => o.parse::<f64>().map(|o| o == *n).unwrap_or(false),
        (Some(o), Cell::Integer(n)) => o.parse::<f64>().map(|o| o == *n as f64).unwrap_or(false),
        (Some(o), Cell::Text(n)) => o == n,
        _ => false,
    }
}

/// A manual edit of one cell
#[derive(Debug, Clone, Deserialize)]
pub struct ManualEdit {
    pub author: i32,
    pub entity: String,
    pub event_id: i64,
    pub column: String,
    /// New value as text; `None` clears the cell, `"auto"` releases an edit
    pub value: Option<String>,
    /// Bulk imports skip the changelog; an `"auto"` release is always recorded
    #[serde(default)]
    pub silent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EditOutcome {
    /// The value was stored
    Stored { old: Option<String>, new: Option<String> },
    /// A generic column edit was released; the row needs recomputing
    Released { column_id: i32 },
}

/// Apply an operator's edit to storage and record it
pub fn set_value(
    db: &Database,
    graph: &EntityGraph,
    generics: &[GenericColumn],
    edit: &ManualEdit,
) -> Result<EditOutcome> {
    let entity = graph.entity(&edit.entity)?;
    let generic = generics
        .iter()
        .find(|g| g.entity == edit.entity && g.name == edit.column);

    let (value_type, enum_values) = match generic {
        Some(g) => {
            if !g.is_editable() {
                return Err(FeidError::validation(
                    "column",
                    format!("{} is derived by {} and cannot be edited", g.name, g.params.operation),
                ));
            }
            (g.value_type, Vec::new())
        }
        None => match entity.column(&edit.column) {
            Some(c) => (c.value_type, c.enum_values.clone()),
            None if edit.column == "time" && entity.has_time => (ValueType::Time, Vec::new()),
            None if edit.column == "duration" && entity.has_duration => (ValueType::Real, Vec::new()),
            None => return Err(FeidError::not_found("column", format!("{}.{}", edit.entity, edit.column))),
        },
    };

    let old = db
        .cell_text(&entity.name, &edit.column, edit.event_id)?
        .ok_or_else(|| FeidError::not_found("event", format!("{} #{}", edit.entity, edit.event_id)))?;

    if edit.value.as_deref() == Some(AUTO) {
        let Some(g) = generic else {
            return Err(FeidError::validation("value", "only generic columns can be reset to auto"));
        };
        let latest = db.latest_changes(&g.entity, &g.name)?;
        let current = latest.iter().find(|(id, _)| *id == edit.event_id).map(|(_, v)| v.as_deref());
        if matches!(current, None | Some(Some(AUTO))) {
            return Err(FeidError::validation("value", "no manual value to release"));
        }
        // the release only exists as a changelog entry, so it is recorded
        // even for silent edits
        record(db, edit, old.as_deref(), Some(AUTO))?;
        tracing::info!(column = %g.name, event = edit.event_id, "manual value released");
        return Ok(EditOutcome::Released { column_id: g.id });
    }

    let cell = parse_cell(edit.value.as_deref(), value_type, &enum_values)
        .map_err(|message| FeidError::validation("value", message))?;
    if same_value(old.as_deref(), &cell) {
        return Err(FeidError::validation("value", "unchanged"));
    }

    let new = cell_text(&cell);
    db.set_cell(&entity.name, &edit.column, edit.event_id, cell)?;
    if !edit.silent {
        record(db, edit, old.as_deref(), new.as_deref())?;
    }
    tracing::info!(
        entity = %edit.entity,
        column = %edit.column,
        event = edit.event_id,
        author = edit.author,
        silent = edit.silent,
        "value set"
    );
    Ok(EditOutcome::Stored { old, new })
}

fn record(db: &Database, edit: &ManualEdit, old: Option<&str>, new: Option<&str>) -> Result<()> {
    let at = now();
    db.append_changelog(&NewChangelogEntry {
        author: edit.author,
        changed_at: &at,
        entity: &edit.entity,
        event_id: edit.event_id,
        column_name: &edit.column,
        old_value: old,
        new_value: new,
    })?;
    Ok(())
}
