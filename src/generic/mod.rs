//! Generic (derived) column model
//!
//! A generic column is fully described by its entity and [`GenericParams`].
//! The physical column name is derived from the parameter record, so two
//! identical records always land on the same storage column.

pub mod validate;

use serde::{Deserialize, Serialize};

use crate::entity::ValueType;

pub use validate::{ColumnMeta, Validator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Value,
    AvgValue,
    Min,
    Max,
    AbsMin,
    AbsMax,
    Range,
    Mean,
    Median,
    Coverage,
    TimeOffset,
    TimeOffsetPercent,
    Clone,
    Diff,
    AbsDiff,
}

impl Operation {
    pub const ALL: [Operation; 15] = [
        Operation::Value,
        Operation::AvgValue,
        Operation::Min,
        Operation::Max,
        Operation::AbsMin,
        Operation::AbsMax,
        Operation::Range,
        Operation::Mean,
        Operation::Median,
        Operation::Coverage,
        Operation::TimeOffset,
        Operation::TimeOffsetPercent,
        Operation::Clone,
        Operation::Diff,
        Operation::AbsDiff,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Value => "value",
            Operation::AvgValue => "avg_value",
            Operation::Min => "min",
            Operation::Max => "max",
            Operation::AbsMin => "abs_min",
            Operation::AbsMax => "abs_max",
            Operation::Range => "range",
            Operation::Mean => "mean",
            Operation::Median => "median",
            Operation::Coverage => "coverage",
            Operation::TimeOffset => "time_offset",
            Operation::TimeOffsetPercent => "time_offset_percent",
            Operation::Clone => "clone",
            Operation::Diff => "diff",
            Operation::AbsDiff => "abs_diff",
        }
    }

    /// Computed from other columns rather than from a series; never editable
    pub fn is_derived(self) -> bool {
        matches!(self, Operation::Clone | Operation::Diff | Operation::AbsDiff)
    }

    pub fn is_time_offset(self) -> bool {
        matches!(self, Operation::TimeOffset | Operation::TimeOffsetPercent)
    }

    pub fn needs_series(self) -> bool {
        !self.is_derived() && !self.is_time_offset()
    }

    /// Reads a single anchored hour rather than a window
    pub fn is_point_value(self) -> bool {
        matches!(self, Operation::Value | Operation::AvgValue)
    }

    pub fn as_extremum(self) -> Option<Extremum> {
        match self {
            Operation::Min => Some(Extremum::Min),
            Operation::Max => Some(Extremum::Max),
            Operation::AbsMin => Some(Extremum::AbsMin),
            Operation::AbsMax => Some(Extremum::AbsMax),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extremum {
    Min,
    Max,
    AbsMin,
    AbsMax,
}

impl Extremum {
    pub fn as_str(self) -> &'static str {
        match self {
            Extremum::Min => "min",
            Extremum::Max => "max",
            Extremum::AbsMin => "abs_min",
            Extremum::AbsMax => "abs_max",
        }
    }
}

/// An anchor in time bounding a computation window
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReferencePoint {
    /// Start or end of this or a related entity's event
    Event {
        entity: String,
        #[serde(default)]
        end: bool,
        #[serde(default)]
        event_offset: i32,
        #[serde(default)]
        hours_offset: i64,
    },
    /// Hour at which a series reaches an extremum in the default window
    Extremum {
        extremum: Extremum,
        series: String,
        #[serde(default)]
        hours_offset: i64,
    },
    /// Start or end of a named solar-wind structure
    Structure {
        structure: String,
        #[serde(default)]
        end: bool,
        #[serde(default)]
        hours_offset: i64,
    },
}

impl ReferencePoint {
    pub fn event_start(entity: &str) -> Self {
        ReferencePoint::Event {
            entity: entity.to_string(),
            end: false,
            event_offset: 0,
            hours_offset: 0,
        }
    }

    pub fn event_end(entity: &str) -> Self {
        ReferencePoint::Event {
            entity: entity.to_string(),
            end: true,
            event_offset: 0,
            hours_offset: 0,
        }
    }

    pub fn hours_offset(&self) -> i64 {
        match self {
            ReferencePoint::Event { hours_offset, .. }
            | ReferencePoint::Extremum { hours_offset, .. }
            | ReferencePoint::Structure { hours_offset, .. } => *hours_offset,
        }
    }

    fn name_part(&self) -> String {
        let (mut s, hours) = match self {
            ReferencePoint::Event {
                entity,
                end,
                event_offset,
                hours_offset,
            } => {
                let mut s = format!("{}_{}", entity, if *end { "end" } else { "start" });
                if *event_offset != 0 {
                    s.push_str(&format!("_e{}", signed(*event_offset as i64)));
                }
                (s, *hours_offset)
            }
            ReferencePoint::Extremum {
                extremum,
                series,
                hours_offset,
            } => (format!("{}_{}", extremum.as_str(), series), *hours_offset),
            ReferencePoint::Structure {
                structure,
                end,
                hours_offset,
            } => (
                format!("st_{}_{}", structure, if *end { "end" } else { "start" }),
                *hours_offset,
            ),
        };
        if hours != 0 {
            s.push_str(&format!("_h{}", signed(hours)));
        }
        s
    }
}

/// Longest physical name kept verbatim
const MAX_READABLE_NAME: usize = 63;
const HASHED_PREFIX: usize = 46;

/// Names of derived-from-derived columns nest their operands' names, so long
/// ones keep a readable prefix and end in a hash of the full name.
fn bounded_name(name: String) -> String {
    if name.len() <= MAX_READABLE_NAME {
        return name;
    }
    let prefix = name[..HASHED_PREFIX].trim_end_matches('_');
    format!("{}_x{:016x}", prefix, fnv1a64(name.as_bytes()))
}

fn fnv1a64(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    data.iter()
        .fold(FNV_OFFSET, |hash, b| (hash ^ *b as u64).wrapping_mul(FNV_PRIME))
}

/// `p3` / `m3`, keeping names valid SQL identifiers
fn signed(v: i64) -> String {
    if v < 0 {
        format!("m{}", -v)
    } else {
        format!("p{}", v)
    }
}

/// Column operand: a static column name or a generic column's physical name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub entity: String,
    pub name: String,
}

impl ColumnRef {
    pub fn new(entity: &str, name: &str) -> Self {
        Self {
            entity: entity.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.entity, self.name)
    }
}

/// Parameter record of a generic column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenericParams {
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ReferencePoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundary: Option<ReferencePoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<ColumnRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_column: Option<ColumnRef>,
    /// Hours for value/avg_value, events for clone
    #[serde(default)]
    pub shift: i64,
}

impl GenericParams {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            series: None,
            reference: None,
            boundary: None,
            column: None,
            other_column: None,
            shift: 0,
        }
    }

    pub fn with_series(mut self, series: &str) -> Self {
        self.series = Some(series.to_string());
        self
    }

    pub fn with_reference(mut self, point: ReferencePoint) -> Self {
        self.reference = Some(point);
        self
    }

    pub fn with_boundary(mut self, point: ReferencePoint) -> Self {
        self.boundary = Some(point);
        self
    }

    pub fn with_column(mut self, column: ColumnRef) -> Self {
        self.column = Some(column);
        self
    }

    pub fn with_other_column(mut self, column: ColumnRef) -> Self {
        self.other_column = Some(column);
        self
    }

    pub fn with_shift(mut self, shift: i64) -> Self {
        self.shift = shift;
        self
    }

    /// Drop explicit reference points equal to the defaults so that spelling
    /// a default out does not create a second column.
    pub fn normalized(mut self, entity: &str) -> Self {
        if self.reference.as_ref() == Some(&ReferencePoint::event_start(entity)) {
            self.reference = None;
        }
        if self.boundary.as_ref() == Some(&ReferencePoint::event_end(entity)) {
            self.boundary = None;
        }
        self
    }

    pub fn reference_or_default(&self, entity: &str) -> ReferencePoint {
        self.reference
            .clone()
            .unwrap_or_else(|| ReferencePoint::event_start(entity))
    }

    pub fn boundary_or_default(&self, entity: &str) -> ReferencePoint {
        self.boundary
            .clone()
            .unwrap_or_else(|| ReferencePoint::event_end(entity))
    }

    /// Deterministic physical column name
    pub fn physical_name(&self) -> String {
        let mut parts = vec![format!("g_{}", self.operation.as_str())];
        if let Some(s) = &self.series {
            parts.push(s.clone());
        }
        if let Some(r) = &self.reference {
            parts.push(format!("r_{}", r.name_part()));
        }
        if let Some(b) = &self.boundary {
            parts.push(format!("b_{}", b.name_part()));
        }
        if let Some(c) = &self.column {
            parts.push(format!("c_{}_{}", c.entity, c.name));
        }
        if let Some(c) = &self.other_column {
            parts.push(format!("o_{}_{}", c.entity, c.name));
        }
        if self.shift != 0 {
            parts.push(format!("s{}", signed(self.shift)));
        }
        bounded_name(parts.join("__"))
    }

    /// Column operands read by this definition
    pub fn operands(&self) -> Vec<&ColumnRef> {
        self.column.iter().chain(self.other_column.iter()).collect()
    }
}

/// A stored generic column definition
#[derive(Debug, Clone, Serialize)]
pub struct GenericColumn {
    pub id: i32,
    pub entity: String,
    pub name: String,
    pub pretty_name: String,
    pub description: String,
    pub value_type: ValueType,
    pub params: GenericParams,
    pub is_public: bool,
    pub owners: Vec<i32>,
    pub created_at: String,
    pub last_computed: Option<String>,
}

impl GenericColumn {
    pub fn column_ref(&self) -> ColumnRef {
        ColumnRef::new(&self.entity, &self.name)
    }

    pub fn is_owned_by(&self, user: i32) -> bool {
        self.owners.contains(&user)
    }

    pub fn is_editable(&self) -> bool {
        !self.params.operation.is_derived()
    }
}
