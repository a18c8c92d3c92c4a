//! HTTP JSON API
//!
//! `feid serve` exposes the engine operations under `/api/`. Every response
//! is an [`ApiResponse`] envelope.

use crate::engine::Engine;
use crate::error::FeidError;
use crate::generic::{ColumnRef, GenericParams};
use crate::overrides::ManualEdit;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{info, warn};

#[derive(Serialize)]
struct ApiResponse<T> {
    ok: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self { ok: true, data: Some(data), error: None }
    }
}

impl ApiResponse<()> {
    fn failure(error: String) -> Self {
        Self { ok: false, data: None, error: Some(error) }
    }
}

#[derive(Deserialize, Debug)]
struct UserQuery {
    #[serde(default)]
    user: i32,
    #[serde(default)]
    admin: bool,
}

#[derive(Deserialize, Debug)]
struct DefineBody {
    user: i32,
    entity: String,
    params: GenericParams,
    #[serde(default)]
    is_public: bool,
}

#[derive(Deserialize, Debug)]
struct NameQuery {
    name: String,
}

#[derive(Deserialize, Debug)]
struct RowQuery {
    entity: String,
    id: i64,
}

#[derive(Deserialize, Debug)]
struct JobQuery {
    job: String,
}

#[derive(Deserialize, Debug)]
struct EventsQuery {
    entity: String,
    #[serde(default)]
    user: i32,
    /// Comma-separated `entity.column` list
    #[serde(default)]
    columns: Option<String>,
}

#[derive(Deserialize, Debug)]
struct PathQuery {
    from: String,
    to: String,
}

/// Error raised while handling one request
enum ApiError {
    Engine(FeidError),
    BadRequest(String),
}

impl From<FeidError> for ApiError {
    fn from(e: FeidError) -> Self {
        ApiError::Engine(e)
    }
}

impl ApiError {
    fn status(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::Engine(FeidError::Validation { .. }) => 400,
            ApiError::Engine(FeidError::NotFound { .. }) => 404,
            ApiError::Engine(_) => 500,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(m) => m.clone(),
            ApiError::Engine(e) => e.to_string(),
        }
    }
}

type Reply = Result<serde_json::Value, ApiError>;

fn to_value<T: Serialize>(data: T) -> Reply {
    serde_json::to_value(data).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Serve the API until the process is stopped
pub fn start(port: u16, engine: Arc<Engine>) -> std::io::Result<()> {
    let addr = format!("127.0.0.1:{}", port);
    let server = Server::http(&addr).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    info!(%addr, "serving");

    for request in server.incoming_requests() {
        if let Err(e) = handle_request(request, &engine) {
            warn!(error = %e, "failed to respond");
        }
    }
    Ok(())
}

fn handle_request(mut request: Request, engine: &Arc<Engine>) -> std::io::Result<()> {
    let url = request.url().to_string();
    let path = url.split('?').next().unwrap_or("/").to_string();
    let query = url.split('?').nth(1).unwrap_or("").to_string();
    let method = request.method().clone();

    let reply = route(&mut request, engine, &method, &path, &query);
    let (status, json) = match reply {
        Ok(data) => (200, serde_json::to_string(&ApiResponse::success(data))?),
        Err(e) => {
            let status = e.status();
            if status >= 500 {
                warn!(%path, error = %e.message(), "request failed");
            }
            (status, serde_json::to_string(&ApiResponse::failure(e.message()))?)
        }
    };

    let response = Response::from_string(json)
        .with_status_code(status)
        .with_header(json_header());
    request.respond(response)
}

fn json_header() -> Header {
    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).expect("static header is valid")
}

fn route(request: &mut Request, engine: &Arc<Engine>, method: &Method, path: &str, query: &str) -> Reply {
    match (method, path) {
        (&Method::Get, "/api/columns") => {
            let q: UserQuery = parse_query(query)?;
            to_value(engine.list_columns(q.user)?)
        }
        (&Method::Post, "/api/columns") => {
            let body: DefineBody = parse_body(request)?;
            to_value(engine.define_column(body.user, &body.entity, body.params, body.is_public)?)
        }
        (&Method::Delete, p) if p.starts_with("/api/columns/") => {
            let id: i32 = p["/api/columns/".len()..]
                .parse()
                .map_err(|_| ApiError::BadRequest("column id must be an integer".to_string()))?;
            let q: UserQuery = parse_query(query)?;
            to_value(engine.delete_column(q.user, id, q.admin)?)
        }
        (&Method::Post, "/api/recompute/all") => to_value(engine.recompute_all()),
        (&Method::Post, "/api/recompute/column") => {
            let q: NameQuery = parse_query(query)?;
            to_value(engine.recompute_column(&q.name)?)
        }
        (&Method::Post, "/api/recompute/row") => {
            let q: RowQuery = parse_query(query)?;
            to_value(engine.recompute_row(&q.entity, q.id)?)
        }
        (&Method::Get, "/api/jobs") => {
            let q: JobQuery = parse_query(query)?;
            to_value(engine.job_status(&q.job))
        }
        (&Method::Post, "/api/values") => {
            let edit: ManualEdit = parse_body(request)?;
            to_value(engine.set_value(&edit)?)
        }
        (&Method::Get, "/api/changelog") => {
            let q: RowQuery = parse_query(query)?;
            to_value(engine.changelog(&q.entity, q.id)?)
        }
        (&Method::Get, "/api/events") => {
            let q: EventsQuery = parse_query(query)?;
            let columns = parse_columns(q.columns.as_deref())?;
            to_value(engine.read_events(q.user, &q.entity, &columns)?)
        }
        (&Method::Get, "/api/join-path") => {
            let q: PathQuery = parse_query(query)?;
            to_value(engine.resolve_join_path(&q.from, &q.to)?)
        }
        (&Method::Get, "/api/entities") => to_value(engine.graph().entities()),
        (&Method::Get, "/api/series") => to_value(engine.catalogue().all()),
        _ => Err(ApiError::Engine(FeidError::not_found("route", path))),
    }
}

fn parse_query<T: for<'de> Deserialize<'de>>(query: &str) -> Result<T, ApiError> {
    serde_urlencoded::from_str(query).map_err(|e| ApiError::BadRequest(format!("bad query: {}", e)))
}

fn parse_body<T: for<'de> Deserialize<'de>>(request: &mut Request) -> Result<T, ApiError> {
    let mut body = String::new();
    request
        .as_reader()
        .read_to_string(&mut body)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    serde_json::from_str(&body).map_err(|e| ApiError::BadRequest(format!("bad body: {}", e)))
}

/// `fe.magnitude,sources_erupt.cme_speed` into column references
fn parse_columns(list: Option<&str>) -> Result<Vec<ColumnRef>, ApiError> {
    let Some(list) = list.filter(|l| !l.trim().is_empty()) else {
        return Ok(Vec::new());
    };
    list.split(',')
        .map(|item| {
            let (entity, name) = item
                .trim()
                .split_once('.')
                .ok_or_else(|| ApiError::BadRequest(format!("'{}' is not entity.column", item)))?;
            Ok(ColumnRef::new(entity, name))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_columns() {
        let cols = parse_columns(Some("forbush_effects.magnitude, sources_erupt.cme_speed")).ok().unwrap();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[1], ColumnRef::new("sources_erupt", "cme_speed"));
        assert!(parse_columns(None).ok().unwrap().is_empty());
        assert!(parse_columns(Some("magnitude")).is_err());
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(ApiError::from(FeidError::validation("shift", "bad")).status(), 400);
        assert_eq!(ApiError::from(FeidError::not_found("column", "x")).status(), 404);
        assert_eq!(ApiError::from(FeidError::computation("x", "y")).status(), 500);
    }

    #[test]
    fn test_query_parsing() {
        let q: RowQuery = parse_query("entity=forbush_effects&id=12").ok().unwrap();
        assert_eq!(q.entity, "forbush_effects");
        assert_eq!(q.id, 12);
        assert!(parse_query::<RowQuery>("entity=x").is_err());
    }
}
