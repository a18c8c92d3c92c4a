use clap::{Parser, Subcommand};
use feid::config::{Config, ConfigError};
use feid::engine::{Engine, RECOMPUTE_ALL};
use feid::generic::{ColumnRef, GenericParams};
use feid::overrides::ManualEdit;
use feid::scheduler::JobStatus;
use feid::FeidError;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "feid")]
#[command(author, version, about = "Derived columns for the Forbush effects catalogue")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config and FEID_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Number of parallel workers
    #[arg(short, long, global = true)]
    jobs: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generic column definitions
    Columns {
        #[command(subcommand)]
        action: ColumnsAction,
    },

    /// Recompute generic columns
    Recompute {
        #[command(subcommand)]
        action: RecomputeAction,
    },

    /// Set a value by hand (use "auto" to release a generic column value)
    Set {
        /// Author user id
        #[arg(short, long)]
        user: i32,

        entity: String,

        /// Event id
        id: i64,

        column: String,

        /// New value; omit to clear
        value: Option<String>,

        /// Skip the changelog (bulk corrections)
        #[arg(long)]
        silent: bool,
    },

    /// Show the changelog of one event
    Changelog {
        entity: String,
        id: i64,
    },

    /// Show the join path between two entities
    JoinPath {
        from: String,
        to: String,
    },

    /// Event tables
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },

    /// Hourly series
    Series {
        #[command(subcommand)]
        action: SeriesAction,
    },

    /// Start the JSON API
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3001")]
        port: u16,
    },
}

#[derive(Subcommand, Debug)]
enum ColumnsAction {
    /// List public columns and the user's own
    List {
        #[arg(short, long, default_value = "0")]
        user: i32,
    },

    /// Define a generic column from a JSON parameter record
    Create {
        #[arg(short, long)]
        user: i32,

        entity: String,

        /// e.g. '{"operation":"max","series":"sw_speed"}'
        params: String,

        /// Visible to every user
        #[arg(long)]
        public: bool,
    },

    /// Give up (or drop) a column
    Delete {
        #[arg(short, long)]
        user: i32,

        id: i32,

        #[arg(long)]
        admin: bool,
    },
}

#[derive(Subcommand, Debug)]
enum RecomputeAction {
    /// Every generic column
    All,

    /// One column by physical name
    Column { name: String },

    /// One event's generic columns
    Row { entity: String, id: i64 },
}

#[derive(Subcommand, Debug)]
enum EventsAction {
    /// Print events with resolved columns
    List {
        entity: String,

        #[arg(short, long, default_value = "0")]
        user: i32,

        /// Comma-separated entity.column list
        #[arg(long)]
        columns: Option<String>,
    },

    /// Import JSON lines ("-" for stdin)
    Import { entity: String, file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum SeriesAction {
    /// Import JSON lines of {"time": <epoch s>, "<series>": value} ("-" for stdin)
    Import { file: PathBuf },

    /// List catalogued series
    List,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Engine(#[from] FeidError),
    #[error("{0}")]
    Input(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("\x1b[31mError:\x1b[0m {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), CliError> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.db_path = db;
    }
    if let Some(jobs) = args.jobs {
        config.workers = jobs;
    }
    let engine = Arc::new(Engine::open(config)?);

    match args.command {
        Command::Columns { action } => match action {
            ColumnsAction::List { user } => print_json(&engine.list_columns(user)?),
            ColumnsAction::Create {
                user,
                entity,
                params,
                public,
            } => {
                let params: GenericParams =
                    serde_json::from_str(&params).map_err(|e| CliError::Input(format!("bad parameter record: {}", e)))?;
                let defined = engine.define_column(user, &entity, params, public)?;
                if !defined.created {
                    eprintln!("Identical column exists; added user {} as owner", user);
                }
                print_json(&defined)
            }
            ColumnsAction::Delete { user, id, admin } => print_json(&engine.delete_column(user, id, admin)?),
        },

        Command::Recompute { action } => match action {
            RecomputeAction::All => {
                match engine.recompute_all() {
                    JobStatus::Busy { .. } => print_json(&wait_with_spinner(&engine, RECOMPUTE_ALL)),
                    status => print_json(&status),
                }
            }
            RecomputeAction::Column { name } => print_json(&engine.recompute_column(&name)?),
            RecomputeAction::Row { entity, id } => print_json(&engine.recompute_row(&entity, id)?),
        },

        Command::Set {
            user,
            entity,
            id,
            column,
            value,
            silent,
        } => {
            let edit = ManualEdit {
                author: user,
                entity,
                event_id: id,
                column,
                value,
                silent,
            };
            print_json(&engine.set_value(&edit)?)
        }

        Command::Changelog { entity, id } => print_json(&engine.changelog(&entity, id)?),

        Command::JoinPath { from, to } => {
            let path = engine.resolve_join_path(&from, &to)?;
            if path.is_empty() {
                eprintln!("{} and {} are the same entity", from, to);
            }
            for step in &path {
                println!("{}", step.sql());
            }
            Ok(())
        }

        Command::Events { action } => match action {
            EventsAction::List { entity, user, columns } => {
                let columns = parse_columns(columns.as_deref())?;
                print_json(&engine.read_events(user, &entity, &columns)?)
            }
            EventsAction::Import { entity, file } => {
                let ids = engine.import_events(&entity, open_input(&file)?)?;
                eprintln!("Imported {} event(s) into {}", ids.len(), entity);
                Ok(())
            }
        },

        Command::Series { action } => match action {
            SeriesAction::Import { file } => {
                let written = engine.import_series(open_input(&file)?)?;
                eprintln!("Imported {} sample(s)", written);
                Ok(())
            }
            SeriesAction::List => print_json(&engine.catalogue().all()),
        },

        Command::Serve { port } => {
            eprintln!("\n\x1b[1;32mfeid\x1b[0m http://127.0.0.1:{}/api/", port);
            feid::serve::start(port, engine)?;
            Ok(())
        }
    }
}

/// Spin until a background job finishes, then hand back its report
fn wait_with_spinner(engine: &Engine, job: &str) -> JobStatus {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(format!("{} running", job));
    pb.enable_steady_tick(Duration::from_millis(100));

    while engine.is_running(job) {
        std::thread::sleep(Duration::from_millis(200));
    }
    pb.finish_and_clear();
    engine.job_status(job)
}

fn open_input(path: &PathBuf) -> Result<Box<dyn BufRead>, CliError> {
    if path.as_os_str() == "-" {
        Ok(Box::new(BufReader::new(io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }
}

fn parse_columns(list: Option<&str>) -> Result<Vec<ColumnRef>, CliError> {
    let Some(list) = list else {
        return Ok(Vec::new());
    };
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|item| {
            item.trim()
                .split_once('.')
                .map(|(entity, name)| ColumnRef::new(entity, name))
                .ok_or_else(|| CliError::Input(format!("'{}' is not entity.column", item)))
        })
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| CliError::Input(e.to_string()))?;
    println!("{}", json);
    Ok(())
}
