//! SQLite database with Diesel ORM
//!
//! Stores event tables, generic column definitions with their owners, the
//! changelog of manual edits, and the hourly series tables. Event and series
//! tables are created from the entity graph and series catalogue at open
//! time; each generic column gets its own physical column on its entity's
//! table.

use crate::entity::{EntityDef, EntityGraph, JoinStep, ValueType, is_safe_identifier};
use crate::generic::{GenericColumn, GenericParams};
use crate::schema::*;
use crate::series::{hour_of, DataSource, HourlySeries, SeriesCatalogue, SeriesInfo, SeriesSource, HOUR};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sql_types::{BigInt, Double, Nullable, Text};
use diesel::sqlite::{Sqlite, SqliteConnection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

// ============================================================================
// Diesel Models
// ============================================================================

/// Insertable generic column definition
#[derive(Insertable)]
#[diesel(table_name = generic_columns)]
pub struct NewGenericColumn<'a> {
    pub entity: &'a str,
    pub name: &'a str,
    pub pretty_name: &'a str,
    pub description: &'a str,
    pub value_type: &'a str,
    pub params_json: &'a str,
    pub is_public: bool,
    pub created_at: &'a str,
}

/// Queryable generic column definition
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = generic_columns)]
pub struct GenericColumnRow {
    pub id: i32,
    pub entity: String,
    pub name: String,
    pub pretty_name: String,
    pub description: String,
    pub value_type: String,
    pub params_json: String,
    pub is_public: bool,
    pub created_at: String,
    pub last_computed: Option<String>,
}

#[derive(Insertable)]
#[diesel(table_name = generic_column_owners)]
struct NewOwner {
    column_id: i32,
    user_id: i32,
}

/// Insertable changelog entry
#[derive(Insertable)]
#[diesel(table_name = changelog)]
pub struct NewChangelogEntry<'a> {
    pub author: i32,
    pub changed_at: &'a str,
    pub entity: &'a str,
    pub event_id: i64,
    pub column_name: &'a str,
    pub old_value: Option<&'a str>,
    pub new_value: Option<&'a str>,
}

/// Queryable changelog entry
#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = changelog)]
pub struct ChangelogEntry {
    pub id: i32,
    pub author: i32,
    pub changed_at: String,
    pub entity: String,
    pub event_id: i64,
    pub column_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

#[derive(QueryableByName)]
struct TableInfo {
    #[diesel(sql_type = Text)]
    name: String,
}

#[derive(QueryableByName)]
struct EventRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = BigInt)]
    time: i64,
    #[diesel(sql_type = Nullable<Double>)]
    duration: Option<f64>,
}

#[derive(QueryableByName)]
struct IdReal {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Nullable<Double>)]
    value: Option<f64>,
}

#[derive(QueryableByName)]
struct IdText {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Nullable<Text>)]
    value: Option<String>,
}

#[derive(QueryableByName)]
struct IdRef {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Nullable<BigInt>)]
    value: Option<i64>,
}

#[derive(QueryableByName)]
struct TimeValue {
    #[diesel(sql_type = BigInt)]
    time: i64,
    #[diesel(sql_type = Nullable<Double>)]
    value: Option<f64>,
}

#[derive(QueryableByName)]
struct LatestChange {
    #[diesel(sql_type = BigInt)]
    event_id: i64,
    #[diesel(sql_type = Nullable<Text>)]
    new_value: Option<String>,
}

#[derive(QueryableByName)]
struct CellText {
    #[diesel(sql_type = Nullable<Text>)]
    value: Option<String>,
}

/// A new event row, as imported by the outer layer
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewEvent {
    /// Epoch seconds
    pub time: i64,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(flatten)]
    pub values: BTreeMap<String, serde_json::Value>,
}

/// A typed cell value bound into a statement
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Real(f64),
    Integer(i64),
    Text(String),
}

/// One column's values for a batch of events, aligned with an id list
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Real(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Real(v) => v.len(),
            ColumnData::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection pragmas so worker threads can write concurrently
#[derive(Debug)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 10000;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Database connection wrapper with connection pool
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

/// Error type for database operations
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("Unsafe identifier: {0}")]
    Identifier(String),
    #[error("Bad value for {column}: {message}")]
    Value { column: String, message: String },
}

pub type Result<T> = std::result::Result<T, DbError>;

fn ident(name: &str) -> Result<&str> {
    if is_safe_identifier(name) {
        Ok(name)
    } else {
        Err(DbError::Identifier(name.to_string()))
    }
}

pub fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Database {
    /// Open database at specified path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(8)
            .connection_customizer(Box::new(ConnectionOptions))
            .build(manager)
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    /// Open and declare every event and series table
    pub fn open_with<P: AsRef<Path>>(path: P, graph: &EntityGraph, catalogue: &SeriesCatalogue) -> Result<Self> {
        let db = Self::open_at(path)?;
        db.ensure_entity_tables(graph)?;
        db.ensure_series_tables(catalogue)?;
        Ok(db)
    }

    fn get_conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| DbError::Connection(e.to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS generic_columns (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                entity TEXT NOT NULL,
                name TEXT NOT NULL,
                pretty_name TEXT NOT NULL,
                description TEXT NOT NULL,
                value_type TEXT NOT NULL,
                params_json TEXT NOT NULL,
                is_public BOOLEAN NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_computed TEXT,
                UNIQUE(entity, name)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS generic_column_owners (
                column_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                PRIMARY KEY (column_id, user_id),
                FOREIGN KEY (column_id) REFERENCES generic_columns(id)
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS changelog (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                author INTEGER NOT NULL,
                changed_at TEXT NOT NULL,
                entity TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                column_name TEXT NOT NULL,
                old_value TEXT,
                new_value TEXT
            )
        "#).execute(&mut conn)?;

        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_changelog_target ON changelog(entity, column_name, event_id)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_generic_entity ON generic_columns(entity)").execute(&mut conn)?;
        Ok(())
    }

    /// Create event tables and add any static column missing from an older file
    pub fn ensure_entity_tables(&self, graph: &EntityGraph) -> Result<()> {
        for entity in graph.entities() {
            let table = ident(&entity.name)?;
            let mut defs = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL".to_string()];
            if entity.has_time {
                defs.push("time INTEGER NOT NULL".to_string());
            }
            if entity.has_duration {
                defs.push("duration REAL".to_string());
            }
            if let Some(parent) = &entity.parent {
                defs.push(format!("{} INTEGER", ident(&parent.fk_column)?));
            }
            for col in &entity.columns {
                defs.push(format!("{} {}", ident(&col.name)?, col.value_type.sql_type()));
            }

            let mut conn = self.get_conn()?;
            diesel::sql_query(format!("CREATE TABLE IF NOT EXISTS {} ({})", table, defs.join(", ")))
                .execute(&mut conn)?;
            if entity.has_time {
                diesel::sql_query(format!("CREATE INDEX IF NOT EXISTS idx_{0}_time ON {0}(time)", table))
                    .execute(&mut conn)?;
            }
            if let Some(parent) = &entity.parent {
                diesel::sql_query(format!(
                    "CREATE INDEX IF NOT EXISTS idx_{0}_{1} ON {0}({1})",
                    table, parent.fk_column
                ))
                .execute(&mut conn)?;
            }
            drop(conn);

            for col in &entity.columns {
                self.add_column(table, &col.name, col.value_type)?;
            }
        }
        Ok(())
    }

    pub fn ensure_series_tables(&self, catalogue: &SeriesCatalogue) -> Result<()> {
        for source in DataSource::all() {
            let columns = catalogue.columns_of(source);
            if columns.is_empty() {
                continue;
            }
            let mut defs = vec!["time INTEGER PRIMARY KEY NOT NULL".to_string()];
            for c in &columns {
                defs.push(format!("{} REAL", ident(c)?));
            }
            let mut conn = self.get_conn()?;
            diesel::sql_query(format!("CREATE TABLE IF NOT EXISTS {} ({})", source.table(), defs.join(", ")))
                .execute(&mut conn)?;
            drop(conn);
            for c in columns {
                self.add_column(source.table(), c, ValueType::Real)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Schema Mutation
    // ========================================================================

    pub fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let mut conn = self.get_conn()?;
        let rows = diesel::sql_query(format!("PRAGMA table_info({})", ident(table)?))
            .load::<TableInfo>(&mut conn)?;
        Ok(rows.into_iter().map(|r| r.name).collect())
    }

    /// Add a nullable column unless it already exists. Returns whether it was added.
    pub fn add_column(&self, table: &str, column: &str, value_type: ValueType) -> Result<bool> {
        if self.table_columns(table)?.iter().any(|c| c == column) {
            return Ok(false);
        }
        let mut conn = self.get_conn()?;
        let altered = diesel::sql_query(format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            ident(table)?,
            ident(column)?,
            value_type.sql_type()
        ))
        .execute(&mut conn);
        match altered {
            Ok(_) => Ok(true),
            // another writer added it between the check and the ALTER
            Err(_) if self.table_columns(table)?.iter().any(|c| c == column) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop a column if present. Returns whether it was dropped.
    pub fn drop_column(&self, table: &str, column: &str) -> Result<bool> {
        if !self.table_columns(table)?.iter().any(|c| c == column) {
            return Ok(false);
        }
        let mut conn = self.get_conn()?;
        diesel::sql_query(format!("ALTER TABLE {} DROP COLUMN {}", ident(table)?, ident(column)?))
            .execute(&mut conn)?;
        Ok(true)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// `(id, epoch seconds, duration hours)` for every event of an entity
    pub fn event_rows(&self, entity: &EntityDef) -> Result<Vec<(i64, i64, Option<f64>)>> {
        let mut conn = self.get_conn()?;
        let duration = if entity.has_duration { "duration" } else { "NULL" };
        let rows = diesel::sql_query(format!(
            "SELECT id, time, {} AS duration FROM {} ORDER BY time, id",
            duration,
            ident(&entity.name)?
        ))
        .load::<EventRow>(&mut conn)?;
        Ok(rows.into_iter().map(|r| (r.id, r.time, r.duration)).collect())
    }

    pub fn insert_event(&self, entity: &EntityDef, event: &NewEvent) -> Result<i64> {
        let mut names: Vec<&str> = vec!["time"];
        let mut cells = vec![Cell::Integer(event.time)];
        if entity.has_duration {
            names.push("duration");
            cells.push(event.duration.map(Cell::Real).unwrap_or(Cell::Null));
        }
        if let Some(parent) = &entity.parent {
            names.push(ident(&parent.fk_column)?);
            cells.push(event.parent_id.map(Cell::Integer).unwrap_or(Cell::Null));
        }
        for (name, value) in &event.values {
            let col = entity.column(name).ok_or_else(|| DbError::Value {
                column: name.clone(),
                message: format!("no such column on {}", entity.name),
            })?;
            let cell = json_to_cell(col.value_type, &col.enum_values, value).map_err(|message| DbError::Value {
                column: name.clone(),
                message,
            })?;
            names.push(ident(&col.name)?);
            cells.push(cell);
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            ident(&entity.name)?,
            names.join(", "),
            vec!["?"; names.len()].join(", ")
        );
        let query = cells
            .into_iter()
            .fold(diesel::sql_query(sql).into_boxed::<Sqlite>(), bind_cell);

        let mut conn = self.get_conn()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            query.execute(conn)?;
            diesel::select(diesel::dsl::sql::<BigInt>("last_insert_rowid()")).get_result::<i64>(conn)
        })
        .map_err(DbError::from)
    }

    /// First value of `target.column` reached from each `src` event through `path`.
    ///
    /// Parent-to-child joins may match several rows; the earliest target
    /// event wins.
    pub fn select_real(&self, src: &str, path: &[JoinStep], column: &str) -> Result<HashMap<i64, Option<f64>>> {
        let sql = self.joined_select(src, path, column)?;
        let mut conn = self.get_conn()?;
        let rows = diesel::sql_query(sql).load::<IdReal>(&mut conn)?;
        let mut out = HashMap::with_capacity(rows.len());
        for r in rows {
            out.entry(r.id).or_insert(r.value.filter(|v| v.is_finite()));
        }
        Ok(out)
    }

    pub fn select_text(&self, src: &str, path: &[JoinStep], column: &str) -> Result<HashMap<i64, Option<String>>> {
        let sql = self.joined_select(src, path, column)?;
        let mut conn = self.get_conn()?;
        let rows = diesel::sql_query(sql).load::<IdText>(&mut conn)?;
        let mut out = HashMap::with_capacity(rows.len());
        for r in rows {
            out.entry(r.id).or_insert(r.value);
        }
        Ok(out)
    }

    /// Id of the related event reached from each `src` event
    pub fn related_ids(&self, src: &str, path: &[JoinStep]) -> Result<HashMap<i64, Option<i64>>> {
        let sql = self.joined_select(src, path, "id")?;
        let mut conn = self.get_conn()?;
        let rows = diesel::sql_query(sql).load::<IdRef>(&mut conn)?;
        let mut out = HashMap::with_capacity(rows.len());
        for r in rows {
            out.entry(r.id).or_insert(r.value);
        }
        Ok(out)
    }

    /// Any cell rendered as text; `None` when the event does not exist
    pub fn cell_text(&self, table: &str, column: &str, id: i64) -> Result<Option<Option<String>>> {
        let mut conn = self.get_conn()?;
        let row = diesel::sql_query(format!(
            "SELECT CAST({} AS TEXT) AS value FROM {} WHERE id = ?",
            ident(column)?,
            ident(table)?
        ))
        .bind::<BigInt, _>(id)
        .get_result::<CellText>(&mut conn)
        .optional()?;
        Ok(row.map(|r| r.value))
    }

    pub fn set_cell(&self, table: &str, column: &str, id: i64, cell: Cell) -> Result<usize> {
        let sql = format!("UPDATE {} SET {} = ? WHERE id = ?", ident(table)?, ident(column)?);
        let query = bind_cell(diesel::sql_query(sql).into_boxed::<Sqlite>(), cell).bind::<BigInt, _>(id);
        let mut conn = self.get_conn()?;
        Ok(query.execute(&mut conn)?)
    }

    /// Write one column for a batch of events in a single transaction
    pub fn write_column(&self, table: &str, column: &str, ids: &[i64], data: &ColumnData) -> Result<usize> {
        if ids.len() != data.len() {
            return Err(DbError::Value {
                column: column.to_string(),
                message: format!("{} ids for {} values", ids.len(), data.len()),
            });
        }
        let sql = format!("UPDATE {} SET {} = ? WHERE id = ?", ident(table)?, ident(column)?);
        let mut conn = self.get_conn()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let mut written = 0;
            for (i, id) in ids.iter().enumerate() {
                let query = diesel::sql_query(sql.as_str());
                written += match data {
                    ColumnData::Real(v) => query
                        .bind::<Nullable<Double>, _>(v[i].filter(|x| x.is_finite()))
                        .bind::<BigInt, _>(*id)
                        .execute(conn)?,
                    ColumnData::Text(v) => query
                        .bind::<Nullable<Text>, _>(v[i].as_deref())
                        .bind::<BigInt, _>(*id)
                        .execute(conn)?,
                };
            }
            Ok(written)
        })
        .map_err(DbError::from)
    }

    /// Select `target.column` for every `src` row; when a parent-to-child
    /// join fans out, rows come ordered so the earliest target is first.
    fn joined_select(&self, src: &str, path: &[JoinStep], column: &str) -> Result<String> {
        let target = path.last().map(|s| s.to.as_str()).unwrap_or(src);
        let joins: Vec<String> = path.iter().map(JoinStep::sql).collect();
        let order = if path.is_empty() {
            String::new()
        } else if self.table_columns(target)?.iter().any(|c| c == "time") {
            format!(", {t}.time, {t}.id", t = target)
        } else {
            format!(", {}.id", target)
        };
        Ok(format!(
            "SELECT {src}.id AS id, {target}.{col} AS value FROM {src} {joins} ORDER BY {src}.id{order}",
            src = ident(src)?,
            target = ident(target)?,
            col = ident(column)?,
            joins = joins.join(" "),
            order = order
        ))
    }

    // ========================================================================
    // Changelog
    // ========================================================================

    pub fn append_changelog(&self, entry: &NewChangelogEntry) -> Result<i32> {
        let mut conn = self.get_conn()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            diesel::insert_into(changelog::table).values(entry).execute(conn)?;
            diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("last_insert_rowid()")).first(conn)
        })
        .map_err(DbError::from)
    }

    /// Most recent entry per event for one column, `"auto"` entries included
    pub fn latest_changes(&self, entity: &str, column: &str) -> Result<Vec<(i64, Option<String>)>> {
        let mut conn = self.get_conn()?;
        let rows = diesel::sql_query(
            r#"
            SELECT c.event_id AS event_id, c.new_value AS new_value
            FROM changelog c
            WHERE c.entity = ? AND c.column_name = ?
              AND c.id = (
                SELECT MAX(c2.id) FROM changelog c2
                WHERE c2.entity = c.entity
                  AND c2.column_name = c.column_name
                  AND c2.event_id = c.event_id
              )
            ORDER BY c.event_id
            "#,
        )
        .bind::<Text, _>(entity)
        .bind::<Text, _>(column)
        .load::<LatestChange>(&mut conn)?;
        Ok(rows.into_iter().map(|r| (r.event_id, r.new_value)).collect())
    }

    pub fn changelog_for(&self, entity: &str, event_id: i64) -> Result<Vec<ChangelogEntry>> {
        let mut conn = self.get_conn()?;
        let entries = changelog::table
            .filter(changelog::entity.eq(entity))
            .filter(changelog::event_id.eq(event_id))
            .order(changelog::id.asc())
            .select(ChangelogEntry::as_select())
            .load(&mut conn)?;
        Ok(entries)
    }

    // ========================================================================
    // Generic Column Definitions
    // ========================================================================

    /// Insert a definition together with its first owner
    pub fn insert_generic(&self, new: &NewGenericColumn, owner: i32) -> Result<i32> {
        let mut conn = self.get_conn()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            diesel::insert_into(generic_columns::table).values(new).execute(conn)?;
            let id: i32 = diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("last_insert_rowid()"))
                .first(conn)?;
            diesel::insert_into(generic_column_owners::table)
                .values(&NewOwner { column_id: id, user_id: owner })
                .execute(conn)?;
            Ok(id)
        })
        .map_err(DbError::from)
    }

    pub fn load_generics(&self) -> Result<Vec<GenericColumn>> {
        let mut conn = self.get_conn()?;
        let rows = generic_columns::table
            .order(generic_columns::id.asc())
            .select(GenericColumnRow::as_select())
            .load(&mut conn)?;
        let owners: Vec<(i32, i32)> = generic_column_owners::table
            .select((generic_column_owners::column_id, generic_column_owners::user_id))
            .order(generic_column_owners::user_id.asc())
            .load(&mut conn)?;

        let mut by_column: HashMap<i32, Vec<i32>> = HashMap::new();
        for (column_id, user_id) in owners {
            by_column.entry(column_id).or_default().push(user_id);
        }

        rows.into_iter()
            .map(|row| {
                let params: GenericParams = serde_json::from_str(&row.params_json)
                    .map_err(|e| DbError::Corrupt(format!("generic column {}: {}", row.id, e)))?;
                let value_type: ValueType = serde_json::from_value(serde_json::Value::String(row.value_type.clone()))
                    .map_err(|e| DbError::Corrupt(format!("generic column {}: {}", row.id, e)))?;
                Ok(GenericColumn {
                    id: row.id,
                    owners: by_column.remove(&row.id).unwrap_or_default(),
                    entity: row.entity,
                    name: row.name,
                    pretty_name: row.pretty_name,
                    description: row.description,
                    value_type,
                    params,
                    is_public: row.is_public,
                    created_at: row.created_at,
                    last_computed: row.last_computed,
                })
            })
            .collect()
    }

    pub fn add_owner(&self, column_id: i32, user_id: i32) -> Result<()> {
        let mut conn = self.get_conn()?;
        diesel::insert_or_ignore_into(generic_column_owners::table)
            .values(&NewOwner { column_id, user_id })
            .execute(&mut conn)?;
        Ok(())
    }

    /// Remove an owner and return how many owners remain
    pub fn remove_owner(&self, column_id: i32, user_id: i32) -> Result<i64> {
        let mut conn = self.get_conn()?;
        diesel::delete(
            generic_column_owners::table
                .filter(generic_column_owners::column_id.eq(column_id))
                .filter(generic_column_owners::user_id.eq(user_id)),
        )
        .execute(&mut conn)?;
        let remaining = generic_column_owners::table
            .filter(generic_column_owners::column_id.eq(column_id))
            .count()
            .get_result(&mut conn)?;
        Ok(remaining)
    }

    /// Remove a definition, its owners and its changelog history
    pub fn delete_generic(&self, column_id: i32, entity: &str, name: &str) -> Result<()> {
        let mut conn = self.get_conn()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            diesel::delete(generic_column_owners::table.filter(generic_column_owners::column_id.eq(column_id)))
                .execute(conn)?;
            diesel::delete(generic_columns::table.filter(generic_columns::id.eq(column_id))).execute(conn)?;
            diesel::delete(
                changelog::table
                    .filter(changelog::entity.eq(entity))
                    .filter(changelog::column_name.eq(name)),
            )
            .execute(conn)?;
            Ok(())
        })
        .map_err(DbError::from)
    }

    pub fn touch_computed(&self, column_id: i32, at: &str) -> Result<()> {
        let mut conn = self.get_conn()?;
        diesel::update(generic_columns::table.filter(generic_columns::id.eq(column_id)))
            .set(generic_columns::last_computed.eq(Some(at)))
            .execute(&mut conn)?;
        Ok(())
    }

    // ========================================================================
    // Series
    // ========================================================================

    /// Insert or replace samples of one series column, times in epoch seconds
    pub fn upsert_series(&self, source: DataSource, column: &str, points: &[(i64, Option<f64>)]) -> Result<usize> {
        let sql = format!(
            "INSERT INTO {t} (time, {c}) VALUES (?, ?) ON CONFLICT(time) DO UPDATE SET {c} = excluded.{c}",
            t = source.table(),
            c = ident(column)?
        );
        let mut conn = self.get_conn()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let mut n = 0;
            for (time, value) in points {
                n += diesel::sql_query(sql.as_str())
                    .bind::<BigInt, _>(*time)
                    .bind::<Nullable<Double>, _>(value.filter(|v| v.is_finite()))
                    .execute(conn)?;
            }
            Ok(n)
        })
        .map_err(DbError::from)
    }
}

impl SeriesSource for Database {
    fn fetch_series(&self, series: &SeriesInfo, from_hour: i64, to_hour: i64) -> crate::error::Result<HourlySeries> {
        let sql = format!(
            "SELECT time, {} AS value FROM {} WHERE time >= ? AND time < ? ORDER BY time",
            ident(&series.db_column)?,
            series.source.table()
        );
        let mut conn = self.get_conn()?;
        let rows = diesel::sql_query(sql)
            .bind::<BigInt, _>(from_hour * HOUR)
            .bind::<BigInt, _>((to_hour + 1) * HOUR)
            .load::<TimeValue>(&mut conn)
            .map_err(DbError::from)?;

        let mut points: Vec<(i64, Option<f64>)> = Vec::with_capacity(rows.len());
        for r in rows {
            let h = hour_of(r.time);
            if points.last().map(|p| p.0) != Some(h) {
                points.push((h, r.value));
            }
        }
        let stored = HourlySeries::new(points);
        Ok(HourlySeries {
            hours: (from_hour..=to_hour).collect(),
            values: stored.window(from_hour, to_hour),
        })
    }
}

fn bind_cell<'f>(
    query: diesel::query_builder::BoxedSqlQuery<'f, Sqlite, diesel::query_builder::SqlQuery>,
    cell: Cell,
) -> diesel::query_builder::BoxedSqlQuery<'f, Sqlite, diesel::query_builder::SqlQuery> {
    match cell {
        Cell::Null => query.bind::<Nullable<Text>, _>(None::<String>),
        Cell::Real(v) => query.bind::<Double, _>(v),
        Cell::Integer(v) => query.bind::<BigInt, _>(v),
        Cell::Text(s) => query.bind::<Text, _>(s),
    }
}

/// Convert an imported JSON value to a cell of the column's type
pub fn json_to_cell(
    value_type: ValueType,
    enum_values: &[String],
    value: &serde_json::Value,
) -> std::result::Result<Cell, String> {
    use serde_json::Value;
    match (value_type, value) {
        (_, Value::Null) => Ok(Cell::Null),
        (ValueType::Real, Value::Number(n)) => n.as_f64().map(Cell::Real).ok_or_else(|| "not a number".to_string()),
        (ValueType::Integer | ValueType::Time, Value::Number(n)) => n
            .as_i64()
            .map(Cell::Integer)
            .ok_or_else(|| "not an integer".to_string()),
        (ValueType::Text, Value::String(s)) => Ok(Cell::Text(s.clone())),
        (ValueType::Enum, Value::String(s)) => {
            if enum_values.iter().any(|e| e == s) {
                Ok(Cell::Text(s.clone()))
            } else {
                Err(format!("'{}' is not one of {:?}", s, enum_values))
            }
        }
        (t, v) => Err(format!("{} does not fit a {} column", v, t)),
    }
}
