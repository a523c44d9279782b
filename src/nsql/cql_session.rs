//! Cassandra sessions
//!
//! The compiler talks to Cassandra through the synchronous `CqlSession` trait.
//! `ScyllaSession` drives the async scylla driver on a private tokio runtime;
//! `ScriptedSession` replays canned results for tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use scylla::frame::response::result::{ColumnType, CqlValue};
use scylla::frame::value::{Counter, CqlTimestamp};
use scylla::statement::Consistency;
use scylla::transport::retry_policy::{QueryInfo, RetryDecision, RetryPolicy, RetrySession};
use scylla::{ExecutionProfile, Session, SessionBuilder};
use tokio::runtime::Runtime;
use tracing::debug;

use super::Source;
use crate::error::NsqlError;
use crate::value::{self, Value};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const RETRIES: usize = 5;
const PAGE_SIZE: i32 = 500;

/// Name and internal type of a result column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub internal_type: String,
}

/// Rows returned by a statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<BTreeMap<String, Value>>,
}

impl QueryRows {
    /// Internal type of a result column, `string` when unknown
    pub fn column_type(&self, name: &str) -> &str {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.internal_type.as_str())
            .unwrap_or(value::STRING)
    }
}

/// A connection able to run CQL
pub trait CqlSession: Send {
    /// Run `cql` with positional `args`; `scan` collects every result row
    fn execute(&mut self, cql: &str, args: &[Value], scan: bool) -> Result<QueryRows, NsqlError>;

    fn close(&mut self);
}

/// Opens sessions for a data source
pub trait SessionFactory: Send + Sync {
    fn open(&self, source: &Source) -> Result<Box<dyn CqlSession>, NsqlError>;
}

/// Retries a request on the same node a fixed number of times
#[derive(Debug, Clone, Copy)]
struct FixedRetryPolicy(usize);

struct FixedRetrySession {
    max: usize,
    attempts: usize,
}

impl RetryPolicy for FixedRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(FixedRetrySession {
            max: self.0,
            attempts: 0,
        })
    }

    fn clone_boxed(&self) -> Box<dyn RetryPolicy> {
        Box::new(*self)
    }
}

impl RetrySession for FixedRetrySession {
    fn decide_should_retry(&mut self, _query_info: QueryInfo) -> RetryDecision {
        if self.attempts >= self.max {
            return RetryDecision::DontRetry;
        }
        self.attempts += 1;
        RetryDecision::RetrySameNode(None)
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Opens `ScyllaSession`s
#[derive(Debug)]
pub struct ScyllaSessionFactory {
    driver_threads: usize,
}

impl ScyllaSessionFactory {
    /// Sessions run their driver on `driver_threads` runtime workers, at least one
    pub fn new(driver_threads: usize) -> Self {
        ScyllaSessionFactory {
            driver_threads: driver_threads.max(1),
        }
    }

    pub fn driver_threads(&self) -> usize {
        self.driver_threads
    }
}

impl Default for ScyllaSessionFactory {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SessionFactory for ScyllaSessionFactory {
    fn open(&self, source: &Source) -> Result<Box<dyn CqlSession>, NsqlError> {
        Ok(Box::new(ScyllaSession::connect(source, self.driver_threads)?))
    }
}

/// Session backed by the scylla driver
pub struct ScyllaSession {
    runtime: Runtime,
    session: Option<Session>,
}

impl ScyllaSession {
    pub fn connect(source: &Source, driver_threads: usize) -> Result<Self, NsqlError> {
        let port: u16 = source
            .port
            .parse()
            .map_err(|_| NsqlError::cassandra(format!("invalid port: {}", source.port)))?;
        let nodes: Vec<String> = source
            .host
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|h| format!("{}:{}", h, port))
            .collect();
        if nodes.is_empty() {
            return Err(NsqlError::cassandra("host list is empty"));
        }
        if !source.version.is_empty() {
            debug!(version = %source.version, "CQL version requested");
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(driver_threads.max(1))
            .thread_name("cql-driver")
            .enable_all()
            .build()
            .map_err(|e| NsqlError::cassandra(format!("unable to get session: {}", e)))?;

        let profile = ExecutionProfile::builder()
            .consistency(Consistency::LocalQuorum)
            .request_timeout(Some(REQUEST_TIMEOUT))
            .retry_policy(Box::new(FixedRetryPolicy(RETRIES)))
            .build();

        let mut builder = SessionBuilder::new()
            .known_nodes(&nodes)
            .default_execution_profile_handle(profile.into_handle());
        if !source.username.is_empty() {
            builder = builder.user(&source.username, &source.password);
        }

        let session = runtime
            .block_on(builder.build())
            .map_err(|e| NsqlError::cassandra(format!("unable to get session: {}", e)))?;
        debug!(?nodes, "cassandra session established");

        Ok(ScyllaSession {
            runtime,
            session: Some(session),
        })
    }
}

impl CqlSession for ScyllaSession {
    fn execute(&mut self, cql: &str, args: &[Value], scan: bool) -> Result<QueryRows, NsqlError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| NsqlError::cassandra("session closed"))?;
        debug!(cql, args = args.len(), "executing CQL");

        self.runtime.block_on(async {
            let mut prepared = session
                .prepare(cql)
                .await
                .map_err(|e| NsqlError::cassandra(e.to_string()))?;
            prepared.set_page_size(PAGE_SIZE);

            let specs = prepared.get_variable_col_specs();
            if specs.len() != args.len() {
                return Err(NsqlError::cassandra(format!(
                    "expected {} bound values, got {}",
                    specs.len(),
                    args.len()
                )));
            }
            let mut bound = Vec::with_capacity(args.len());
            for (arg, spec) in args.iter().zip(specs.iter()) {
                bound.push(to_cql(arg, &spec.typ)?);
            }

            if !scan {
                session
                    .execute(&prepared, bound)
                    .await
                    .map_err(|e| NsqlError::cassandra(e.to_string()))?;
                return Ok(QueryRows::default());
            }

            let mut iter = session
                .execute_iter(prepared, bound)
                .await
                .map_err(|e| NsqlError::cassandra(e.to_string()))?;
            let columns: Vec<ColumnMeta> = iter
                .get_column_specs()
                .iter()
                .map(|spec| ColumnMeta {
                    name: spec.name.clone(),
                    internal_type: internal_type(&spec.typ),
                })
                .collect();

            let mut rows = Vec::new();
            while let Some(row) = iter.next().await {
                let row = row.map_err(|e| NsqlError::cassandra(e.to_string()))?;
                let mut out = BTreeMap::new();
                for (meta, cell) in columns.iter().zip(row.columns.into_iter()) {
                    out.insert(meta.name.clone(), cell.map(from_cql).unwrap_or(Value::Null));
                }
                rows.push(out);
            }
            Ok(QueryRows { columns, rows })
        })
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            // The driver tears its connections down on drop, inside the runtime
            let _guard = self.runtime.enter();
            drop(session);
        }
    }
}

impl Drop for ScyllaSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Internal type name for a CQL column type
pub fn internal_type(typ: &ColumnType) -> String {
    match typ {
        ColumnType::Boolean => value::BOOLEAN.to_string(),
        ColumnType::Int
        | ColumnType::BigInt
        | ColumnType::SmallInt
        | ColumnType::TinyInt
        | ColumnType::Counter
        | ColumnType::Varint => value::INTEGER.to_string(),
        ColumnType::Double | ColumnType::Float | ColumnType::Decimal => value::DOUBLE.to_string(),
        ColumnType::Blob => value::BLOB.to_string(),
        ColumnType::Timestamp => value::TIME.to_string(),
        ColumnType::List(inner) | ColumnType::Set(inner) => {
            format!("{}{}]", value::ARRAY, internal_type(inner))
        }
        ColumnType::Map(key, val) => {
            format!("{}{}]{}", value::MAP, internal_type(key), internal_type(val))
        }
        _ => value::STRING.to_string(),
    }
}

fn coercion_error(value: &Value, typ: &ColumnType) -> NsqlError {
    NsqlError::cassandra(format!("cannot bind {} to column of type {:?}", value, typ))
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&t));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| Utc.from_utc_datetime(&t))
}

/// Coerce a value to the type of the column it is bound to
fn to_cql(value: &Value, typ: &ColumnType) -> Result<Option<CqlValue>, NsqlError> {
    if value.is_null() {
        return Ok(None);
    }
    let err = || coercion_error(value, typ);

    let integer = || -> Result<i64, NsqlError> {
        match value {
            Value::Int(i) => Ok(*i),
            Value::Float(f) => Ok(*f as i64),
            Value::String(s) => s.trim().parse().map_err(|_| err()),
            _ => Err(err()),
        }
    };
    let double = || -> Result<f64, NsqlError> {
        match value {
            Value::String(s) => s.trim().parse().map_err(|_| err()),
            other => other.as_f64().ok_or_else(err),
        }
    };

    let cql = match typ {
        ColumnType::Ascii => CqlValue::Ascii(value::data_to_string(value, &value.internal_type())),
        ColumnType::Text => CqlValue::Text(value::data_to_string(value, &value.internal_type())),
        ColumnType::Boolean => match value {
            Value::Bool(b) => CqlValue::Boolean(*b),
            Value::String(s) => CqlValue::Boolean(s.eq_ignore_ascii_case("true")),
            _ => return Err(err()),
        },
        ColumnType::Int => CqlValue::Int(i32::try_from(integer()?).map_err(|_| err())?),
        ColumnType::BigInt => CqlValue::BigInt(integer()?),
        ColumnType::SmallInt => CqlValue::SmallInt(i16::try_from(integer()?).map_err(|_| err())?),
        ColumnType::TinyInt => CqlValue::TinyInt(i8::try_from(integer()?).map_err(|_| err())?),
        ColumnType::Counter => CqlValue::Counter(Counter(integer()?)),
        ColumnType::Double => CqlValue::Double(double()?),
        ColumnType::Float => CqlValue::Float(double()? as f32),
        ColumnType::Timestamp => {
            let millis = match value {
                Value::Timestamp(t) => t.timestamp_millis(),
                Value::Int(i) => *i,
                Value::String(s) => parse_timestamp(s.trim()).ok_or_else(err)?.timestamp_millis(),
                _ => return Err(err()),
            };
            CqlValue::Timestamp(CqlTimestamp(millis))
        }
        ColumnType::Blob => match value {
            Value::Bytes(b) => CqlValue::Blob(b.clone()),
            Value::String(s) => {
                let digits = s.strip_prefix("0x").unwrap_or(s);
                CqlValue::Blob(hex::decode(digits).map_err(|_| err())?)
            }
            _ => return Err(err()),
        },
        ColumnType::Uuid | ColumnType::Timeuuid => {
            let text = value.as_str().ok_or_else(err)?;
            let id = uuid::Uuid::parse_str(text).map_err(|_| err())?;
            if matches!(typ, ColumnType::Uuid) {
                CqlValue::Uuid(id)
            } else {
                CqlValue::Timeuuid(id.into())
            }
        }
        ColumnType::List(inner) | ColumnType::Set(inner) => {
            let items = match value {
                Value::List(items) => items,
                _ => return Err(err()),
            };
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if let Some(v) = to_cql(item, inner)? {
                    out.push(v);
                }
            }
            if matches!(typ, ColumnType::List(_)) {
                CqlValue::List(out)
            } else {
                CqlValue::Set(out)
            }
        }
        ColumnType::Map(key_type, value_type) => {
            let entries = match value {
                Value::Map(entries) => entries,
                _ => return Err(err()),
            };
            let mut out = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                let key = to_cql(&Value::String(k.clone()), key_type)?;
                if let (Some(key), Some(v)) = (key, to_cql(v, value_type)?) {
                    out.push((key, v));
                }
            }
            CqlValue::Map(out)
        }
        _ => return Err(err()),
    };
    Ok(Some(cql))
}

fn from_cql(cell: CqlValue) -> Value {
    match cell {
        CqlValue::Ascii(s) | CqlValue::Text(s) => Value::String(s),
        CqlValue::Boolean(b) => Value::Bool(b),
        CqlValue::Int(i) => Value::Int(i64::from(i)),
        CqlValue::BigInt(i) => Value::Int(i),
        CqlValue::SmallInt(i) => Value::Int(i64::from(i)),
        CqlValue::TinyInt(i) => Value::Int(i64::from(i)),
        CqlValue::Counter(c) => Value::Int(c.0),
        CqlValue::Double(f) => Value::Float(f),
        CqlValue::Float(f) => Value::Float(f64::from(f)),
        CqlValue::Blob(b) => Value::Bytes(b),
        CqlValue::Timestamp(t) => Utc
            .timestamp_millis_opt(t.0)
            .single()
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        CqlValue::Uuid(u) => Value::String(u.to_string()),
        CqlValue::Inet(ip) => Value::String(ip.to_string()),
        CqlValue::List(items) | CqlValue::Set(items) => {
            Value::List(items.into_iter().map(from_cql).collect())
        }
        CqlValue::Map(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (from_cql(k).to_string(), from_cql(v)))
                .collect(),
        ),
        CqlValue::Empty => Value::Null,
        other => Value::String(format!("{:?}", other)),
    }
}

/// One statement seen by a `ScriptedSession`
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub cql: String,
    pub args: Vec<Value>,
    pub scan: bool,
}

/// Shared script and log behind `ScriptedSession`s
#[derive(Default)]
struct Script {
    responses: VecDeque<Result<QueryRows, NsqlError>>,
    executed: Vec<ExecutedStatement>,
    opened: usize,
    closed: usize,
}

/// In-memory session factory replaying queued results
#[derive(Clone, Default)]
pub struct ScriptedSessions {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next executed statement
    pub fn push(&self, response: Result<QueryRows, NsqlError>) {
        self.script.lock().responses.push_back(response);
    }

    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.script.lock().executed.clone()
    }

    /// Sessions opened and closed so far
    pub fn lifecycle(&self) -> (usize, usize) {
        let script = self.script.lock();
        (script.opened, script.closed)
    }
}

impl SessionFactory for ScriptedSessions {
    fn open(&self, _source: &Source) -> Result<Box<dyn CqlSession>, NsqlError> {
        self.script.lock().opened += 1;
        Ok(Box::new(ScriptedSession {
            script: Arc::clone(&self.script),
            closed: false,
        }))
    }
}

struct ScriptedSession {
    script: Arc<Mutex<Script>>,
    closed: bool,
}

impl CqlSession for ScriptedSession {
    fn execute(&mut self, cql: &str, args: &[Value], scan: bool) -> Result<QueryRows, NsqlError> {
        let mut script = self.script.lock();
        script.executed.push(ExecutedStatement {
            cql: cql.to_string(),
            args: args.to_vec(),
            scan,
        });
        script.responses.pop_front().unwrap_or_else(|| Ok(QueryRows::default()))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.script.lock().closed += 1;
        }
    }
}
