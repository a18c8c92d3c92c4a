//! The engine facade used by the CLI and the HTTP API
//!
//! Everything an outer layer may do goes through [`Engine`]: define and
//! delete generic columns, trigger recomputation, edit values and read
//! events with their resolved columns.

use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::compute::{Computed, Computer};
use crate::config::Config;
use crate::db::{now, ChangelogEntry, ColumnData, Database, NewEvent, NewGenericColumn};
use crate::entity::{EntityGraph, JoinStep, ValueType};
use crate::error::{FeidError, Result};
use crate::generic::{ColumnRef, GenericColumn, GenericParams, Validator};
use crate::overrides::{self, EditOutcome, ManualEdit};
use crate::scheduler::{column_slot, Claim, ColumnTask, JobStatus, RecomputeReport, Scheduler};
use crate::series::{DataSource, SeriesCatalogue, SeriesSource};

pub const RECOMPUTE_ALL: &str = "recompute_all";

/// Result of [`Engine::define_column`]
#[derive(Debug, Clone, Serialize)]
pub struct Defined {
    pub column: GenericColumn,
    /// False when an identical definition already existed
    pub created: bool,
    /// Initial computation of a newly created column
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial: Option<RecomputeReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Deleted {
    /// The column and its storage are gone
    Dropped,
    /// Only the caller's ownership was removed
    Unowned,
}

/// A generic column as seen by one user
#[derive(Debug, Clone, Serialize)]
pub struct ColumnListing {
    #[serde(flatten)]
    pub column: GenericColumn,
    pub is_own: bool,
}

/// Events of one entity with the requested columns resolved
#[derive(Debug, Clone, Serialize)]
pub struct EventTable {
    pub entity: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

pub struct Engine {
    db: Database,
    series: Arc<dyn SeriesSource>,
    graph: EntityGraph,
    catalogue: SeriesCatalogue,
    config: Config,
    scheduler: Scheduler,
}

impl Engine {
    /// Open the configured database and read series from it
    pub fn open(config: Config) -> Result<Self> {
        let graph = EntityGraph::feid();
        let catalogue = SeriesCatalogue::feid();
        let db = Database::open_with(&config.db_path, &graph, &catalogue)?;
        let series: Arc<dyn SeriesSource> = Arc::new(db.clone());
        Self::new(db, series, graph, catalogue, config)
    }

    pub fn new(
        db: Database,
        series: Arc<dyn SeriesSource>,
        graph: EntityGraph,
        catalogue: SeriesCatalogue,
        config: Config,
    ) -> Result<Self> {
        let scheduler = Scheduler::new(config.workers)
            .map_err(|e| FeidError::computation("scheduler", e.to_string()))?;
        Ok(Self {
            db,
            series,
            graph,
            catalogue,
            config,
            scheduler,
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    pub fn catalogue(&self) -> &SeriesCatalogue {
        &self.catalogue
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn generics(&self) -> Result<Vec<GenericColumn>> {
        Ok(self.db.load_generics()?)
    }

    fn generic_by_id(&self, id: i32) -> Result<GenericColumn> {
        self.generics()?
            .into_iter()
            .find(|g| g.id == id)
            .ok_or_else(|| FeidError::not_found("column", id.to_string()))
    }

    // ========================================================================
    // Column lifecycle
    // ========================================================================

    /// Validate and create a generic column, or join an identical one.
    pub fn define_column(&self, owner: i32, entity: &str, params: GenericParams, is_public: bool) -> Result<Defined> {
        let params = params.normalized(entity);
        let generics = self.generics()?;
        let meta = Validator::new(&self.graph, &self.catalogue, &self.config, &generics).validate(entity, &params)?;

        if let Some(existing) = generics.iter().find(|g| g.entity == entity && g.params == params) {
            self.db.add_owner(existing.id, owner)?;
            info!(column = %existing.name, owner, "joined existing column");
            return Ok(Defined {
                column: self.generic_by_id(existing.id)?,
                created: false,
                initial: None,
            });
        }

        let schema_error = |e: crate::db::DbError| FeidError::Schema {
            entity: entity.to_string(),
            column: meta.name.clone(),
            message: e.to_string(),
        };
        let added = self
            .db
            .add_column(entity, &meta.name, meta.value_type)
            .map_err(schema_error)?;

        let params_json =
            serde_json::to_string(&params).map_err(|e| FeidError::validation("params", e.to_string()))?;
        let created_at = now();
        let value_type = meta.value_type.to_string();
        let inserted = self.db.insert_generic(
            &NewGenericColumn {
                entity,
                name: &meta.name,
                pretty_name: &meta.pretty_name,
                description: &meta.description,
                value_type: &value_type,
                params_json: &params_json,
                is_public,
                created_at: &created_at,
            },
            owner,
        );
        let id = match inserted {
            Ok(id) => id,
            Err(e) => {
                // an identical definition committed since the dedup check
                if let Some(existing) = self
                    .generics()?
                    .into_iter()
                    .find(|g| g.entity == entity && g.params == params)
                {
                    self.db.add_owner(existing.id, owner)?;
                    info!(column = %existing.name, owner, "joined concurrently created column");
                    return Ok(Defined {
                        column: self.generic_by_id(existing.id)?,
                        created: false,
                        initial: None,
                    });
                }
                // the physical column may belong to another definition
                if added {
                    if let Err(drop) = self.db.drop_column(entity, &meta.name) {
                        error!(column = %meta.name, error = %drop, "could not roll back physical column");
                    }
                }
                return Err(e.into());
            }
        };
        info!(column = %meta.name, entity, owner, "column created");

        let column = self.generic_by_id(id)?;
        let report = self.scheduler.run_batch(self, std::slice::from_ref(&column), None);
        Ok(Defined {
            column: self.generic_by_id(id)?,
            created: true,
            initial: Some(report),
        })
    }

    /// Give up ownership of a column; the last owner (or anyone allowed to
    /// delete a public column) drops it entirely.
    pub fn delete_column(&self, user: i32, column_id: i32, is_admin: bool) -> Result<Deleted> {
        let generics = self.generics()?;
        let column = generics
            .iter()
            .find(|g| g.id == column_id)
            .ok_or_else(|| FeidError::not_found("column", column_id.to_string()))?;
        let owner = column.is_owned_by(user);

        let drop_all = if column.is_public && (owner || is_admin) {
            true
        } else if owner {
            column.owners.iter().all(|&o| o == user)
        } else {
            return Err(FeidError::validation("user", format!("user {} does not own {}", user, column.name)));
        };
        if !drop_all {
            self.db.remove_owner(column.id, user)?;
            info!(column = %column.name, user, "ownership removed");
            return Ok(Deleted::Unowned);
        }

        let target = column.column_ref();
        if let Some(dependent) = generics
            .iter()
            .find(|g| g.id != column.id && g.params.operands().contains(&&target))
        {
            return Err(FeidError::validation(
                "column",
                format!("{} is read by {}", column.name, dependent.name),
            ));
        }

        self.db
            .drop_column(&column.entity, &column.name)
            .map_err(|e| FeidError::Schema {
                entity: column.entity.clone(),
                column: column.name.clone(),
                message: e.to_string(),
            })?;
        self.db.delete_generic(column.id, &column.entity, &column.name)?;
        info!(column = %column.name, user, "column dropped");
        Ok(Deleted::Dropped)
    }

    /// Public columns and the user's own
    pub fn list_columns(&self, user: i32) -> Result<Vec<ColumnListing>> {
        Ok(self
            .generics()?
            .into_iter()
            .filter(|g| g.is_public || g.is_owned_by(user))
            .map(|g| ColumnListing {
                is_own: g.is_owned_by(user),
                column: g,
            })
            .collect())
    }

    pub fn resolve_join_path(&self, src: &str, dst: &str) -> Result<Vec<JoinStep>> {
        self.graph.resolve_join_path(src, dst)
    }

    // ========================================================================
    // Recomputation
    // ========================================================================

    /// Recompute every column with this physical name, blocking until done
    pub fn recompute_column(&self, name: &str) -> Result<JobStatus> {
        let columns: Vec<GenericColumn> = self.generics()?.into_iter().filter(|g| g.name == name).collect();
        if columns.is_empty() {
            return Err(FeidError::not_found("column", name));
        }
        let job = format!("column {}", name);
        match self.scheduler.registry().claim(&job) {
            Claim::Existing(status) => Ok(status),
            Claim::Started => {
                let report = self.scheduler.run_batch(self, &columns, None);
                self.scheduler.registry().finish(&job, report);
                Ok(self.scheduler.registry().poll(&job))
            }
        }
    }

    /// Recompute one event's generic columns, waiting at most the row timeout
    pub fn recompute_row(self: &Arc<Self>, entity: &str, event_id: i64) -> Result<JobStatus> {
        let def = self.graph.entity(entity)?;
        if !self.db.event_rows(def)?.iter().any(|r| r.0 == event_id) {
            return Err(FeidError::not_found("event", format!("{} #{}", entity, event_id)));
        }

        let job = format!("row {} {}", entity, event_id);
        if let Claim::Existing(status) = self.scheduler.registry().claim(&job) {
            return Ok(status);
        }
        let entity = entity.to_string();
        self.spawn_batch(job.clone(), Some(event_id), move |g| g.entity == entity);
        Ok(self.scheduler.registry().wait(&job, self.config.row_timeout()))
    }

    /// Start recomputing every generic column in the background
    pub fn recompute_all(self: &Arc<Self>) -> JobStatus {
        match self.scheduler.registry().claim(RECOMPUTE_ALL) {
            Claim::Existing(status) => status,
            Claim::Started => {
                self.spawn_batch(RECOMPUTE_ALL.to_string(), None, |_| true);
                self.scheduler.registry().peek(RECOMPUTE_ALL)
            }
        }
    }

    /// Poll a job, consuming its report if it finished
    pub fn job_status(&self, job: &str) -> JobStatus {
        self.scheduler.registry().poll(job)
    }

    /// Whether a job is still running, without consuming anything
    pub fn is_running(&self, job: &str) -> bool {
        matches!(self.scheduler.registry().peek(job), JobStatus::Busy { .. })
    }

    /// Run a batch on its own thread; the job slot must already be claimed.
    fn spawn_batch<F>(self: &Arc<Self>, job: String, only: Option<i64>, select: F)
    where
        F: Fn(&GenericColumn) -> bool + Send + 'static,
    {
        let engine = Arc::clone(self);
        std::thread::spawn(move || {
            let report = match engine.generics() {
                Ok(all) => {
                    let columns: Vec<GenericColumn> = all.into_iter().filter(|g| select(g)).collect();
                    engine.scheduler.run_batch(engine.as_ref(), &columns, only)
                }
                Err(e) => {
                    warn!(job = %job, error = %e, "could not load column definitions");
                    RecomputeReport {
                        done: true,
                        error: Some(e.to_string()),
                        ..Default::default()
                    }
                }
            };
            engine.scheduler.registry().finish(&job, report);
        });
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Apply a manual edit; releasing a generic value recomputes that cell
    pub fn set_value(&self, edit: &ManualEdit) -> Result<EditOutcome> {
        let generics = self.generics()?;
        let outcome = overrides::set_value(&self.db, &self.graph, &generics, edit)?;
        if let EditOutcome::Released { column_id } = outcome {
            if let Some(column) = generics.iter().find(|g| g.id == column_id) {
                self.recompute_released(column, edit.event_id)?;
            }
        }
        Ok(outcome)
    }

    /// Recompute a released cell. A batch already computing the column may
    /// have read the changelog before the release, so wait for it first.
    fn recompute_released(&self, column: &GenericColumn, event_id: i64) -> Result<()> {
        let columns = std::slice::from_ref(column);
        let mut report = self.scheduler.run_batch(self, columns, Some(event_id));
        if !report.busy.is_empty() {
            self.scheduler
                .registry()
                .wait(&column_slot(column), self.config.row_timeout());
            report = self.scheduler.run_batch(self, columns, Some(event_id));
        }
        if !report.busy.is_empty() {
            warn!(column = %column.name, event = event_id, "column still busy; released value follows the running batch");
        }
        match report.error {
            Some(e) => Err(FeidError::computation(&column.name, e)),
            None => Ok(()),
        }
    }

    pub fn changelog(&self, entity: &str, event_id: i64) -> Result<Vec<ChangelogEntry>> {
        self.graph.entity(entity)?;
        Ok(self.db.changelog_for(entity, event_id)?)
    }

    /// Read events with columns of the entity itself or of related entities.
    ///
    /// With no columns given, every static and visible generic column of the
    /// entity is returned.
    pub fn read_events(&self, user: i32, entity: &str, columns: &[ColumnRef]) -> Result<EventTable> {
        let def = self.graph.entity(entity)?;
        let generics = self.generics()?;

        let columns: Vec<ColumnRef> = if columns.is_empty() {
            let mut all = Vec::new();
            if def.has_time {
                all.push(ColumnRef::new(entity, "time"));
            }
            if def.has_duration {
                all.push(ColumnRef::new(entity, "duration"));
            }
            all.extend(def.columns.iter().map(|c| ColumnRef::new(entity, &c.name)));
            all.extend(
                generics
                    .iter()
                    .filter(|g| g.entity == entity && (g.is_public || g.is_owned_by(user)))
                    .map(GenericColumn::column_ref),
            );
            all
        } else {
            columns.to_vec()
        };

        let validator = Validator::new(&self.graph, &self.catalogue, &self.config, &generics);
        let ids: Vec<i64> = self.db.event_rows(def)?.into_iter().map(|r| r.0).collect();
        let mut table_columns = vec!["id".to_string()];
        let mut resolved: Vec<Vec<serde_json::Value>> = Vec::with_capacity(columns.len());

        for col in &columns {
            let value_type = validator.operand_type(col)?;
            let path = self.graph.resolve_join_path(entity, &col.entity)?;
            let values: Vec<serde_json::Value> = if value_type.is_stored_numeric() {
                let found = self.db.select_real(entity, &path, &col.name)?;
                ids.iter()
                    .map(|id| match found.get(id).copied().flatten() {
                        Some(v) if value_type != ValueType::Real => serde_json::json!(v as i64),
                        Some(v) => serde_json::json!(v),
                        None => serde_json::Value::Null,
                    })
                    .collect()
            } else {
                let found = self.db.select_text(entity, &path, &col.name)?;
                ids.iter()
                    .map(|id| match found.get(id).cloned().flatten() {
                        Some(s) => serde_json::Value::String(s),
                        None => serde_json::Value::Null,
                    })
                    .collect()
            };
            table_columns.push(if col.entity == entity { col.name.clone() } else { col.to_string() });
            resolved.push(values);
        }

        let rows = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut row = vec![serde_json::json!(id)];
                row.extend(resolved.iter().map(|c| c[i].clone()));
                row
            })
            .collect();
        Ok(EventTable {
            entity: entity.to_string(),
            columns: table_columns,
            rows,
        })
    }

    // ========================================================================
    // Import
    // ========================================================================

    /// Import events from JSON lines; returns the new ids
    pub fn import_events<R: BufRead>(&self, entity: &str, reader: R) -> Result<Vec<i64>> {
        let def = self.graph.entity(entity)?;
        let mut ids = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| FeidError::validation("input", e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: NewEvent = serde_json::from_str(&line)
                .map_err(|e| FeidError::validation("input", format!("line {}: {}", n + 1, e)))?;
            ids.push(self.db.insert_event(def, &event)?);
        }
        info!(entity, count = ids.len(), "events imported");
        Ok(ids)
    }

    /// Import hourly samples from JSON lines of `{"time": <s>, "<series>": v}`
    pub fn import_series<R: BufRead>(&self, reader: R) -> Result<usize> {
        let mut by_column: BTreeMap<(DataSource, String), Vec<(i64, Option<f64>)>> = BTreeMap::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| FeidError::validation("input", e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: HashMap<String, serde_json::Value> = serde_json::from_str(&line)
                .map_err(|e| FeidError::validation("input", format!("line {}: {}", n + 1, e)))?;
            let time = record
                .get("time")
                .and_then(serde_json::Value::as_i64)
                .ok_or_else(|| FeidError::validation("time", format!("line {}: missing epoch seconds", n + 1)))?;
            for (name, value) in &record {
                if name == "time" {
                    continue;
                }
                let info = self.catalogue.get(name)?;
                by_column
                    .entry((info.source, info.db_column.clone()))
                    .or_default()
                    .push((time, value.as_f64()));
            }
        }

        let mut written = 0;
        for ((source, column), points) in &by_column {
            written += self.db.upsert_series(*source, column, points)?;
        }
        info!(samples = written, "series imported");
        Ok(written)
    }

    fn computer(&self) -> Computer<'_> {
        Computer::new(&self.db, self.series.as_ref(), &self.graph, &self.catalogue, &self.config)
    }
}

impl ColumnTask for Engine {
    fn run_column(&self, column: &GenericColumn, only: Option<i64>) -> Result<usize> {
        let mut computed: Computed = self.computer().compute(column)?;
        if let Some(id) = only {
            computed = computed.restrict_to(id);
        }
        let latest = self.db.latest_changes(&column.entity, &column.name)?;
        let data: ColumnData =
            overrides::apply_overrides(&column.name, column.value_type, &computed.ids, computed.data, &latest)?;
        let written = self.db.write_column(&column.entity, &column.name, &computed.ids, &data)?;
        if only.is_none() {
            self.db.touch_computed(column.id, &now())?;
        }
        Ok(written)
    }
}
