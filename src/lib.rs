//! feid - derived columns for a catalogue of Forbush effects
//!
//! Operators define *generic columns*: numeric or text attributes of every
//! event of an entity, computed from hourly geophysical series (solar wind,
//! IMF, cosmic-ray anisotropy, neutron monitors) or from other columns of
//! related events. Definitions come from a closed vocabulary of operations
//! and are stored next to the events as physical SQLite columns.
//!
//! # Quick Start
//!
//! ```no_run
//! use feid::{Config, Engine};
//! use feid::generic::{GenericParams, Operation};
//!
//! let engine = Engine::open(Config::default())?;
//! let params = GenericParams::new(Operation::Max).with_series("sw_speed");
//! let defined = engine.define_column(1, "forbush_effects", params, true)?;
//! println!("{} -> {}", defined.column.name, defined.column.pretty_name);
//! # Ok::<(), feid::FeidError>(())
//! ```
//!
//! # Operations
//!
//! | Family | Operations | Reads |
//! |--------|------------|-------|
//! | Point | `value`, `avg_value` | series at a reference point |
//! | Window | `min`, `max`, `abs_min`, `abs_max`, `range`, `mean`, `median`, `coverage` | series between reference and boundary |
//! | Timing | `time_offset`, `time_offset_percent` | reference points only |
//! | Derived | `clone`, `diff`, `abs_diff` | other columns |
//!
//! # Modules
//!
//! - [`entity`]: Entity graph and join-path resolution
//! - [`generic`]: Parameter records, validation and naming
//! - [`compute`]: Windowing and reductions over whole event batches
//! - [`overrides`]: Manual edits and the changelog
//! - [`scheduler`]: Job registry and the parallel column runner
//! - [`engine`]: The facade used by the CLI and [`serve`]

pub mod compute;
pub mod config;
pub mod db;
pub mod engine;
pub mod entity;
pub mod error;
pub mod generic;
pub mod overrides;
pub mod scheduler;
pub mod schema;
pub mod serve;
pub mod series;

pub use config::Config;
pub use db::{Database, DbError};
pub use engine::Engine;
pub use entity::{EntityGraph, JoinDirection, JoinStep, ValueType};
pub use error::{FeidError, Result};
pub use generic::{GenericColumn, GenericParams, Operation, ReferencePoint};
pub use series::{MemorySeries, SeriesCatalogue, SeriesSource};
