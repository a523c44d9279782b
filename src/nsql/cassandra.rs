//! Cassandra backend
//!
//! Statements are lowered straight to parameterised CQL. Selects build one
//! `Transformer` per output column; after the query runs every row is passed
//! through the transformers to produce the `{columns, types, rows}` result.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::ast::*;
use super::cql_session::{CqlSession, QueryRows, SessionFactory};
use super::lexer::{Collection, Element};
use super::{parse, Compiler, Options, Source};
use crate::error::NsqlError;
use crate::value::{self, data_to_string, Value};

type CResult<T> = Result<T, NsqlError>;

fn error(msg: impl Into<String>) -> NsqlError {
    NsqlError::cassandra(msg)
}

/// Compiles nsQL to CQL and runs it on one Cassandra cluster
pub struct CassandraCompiler {
    source: Source,
    sessions: Arc<dyn SessionFactory>,
    session: Option<Box<dyn CqlSession>>,
}

impl CassandraCompiler {
    pub fn new(source: Source, sessions: Arc<dyn SessionFactory>) -> Self {
        CassandraCompiler {
            source,
            sessions,
            session: None,
        }
    }

    /// Open a session kept until `disconnect`
    pub fn connect(&mut self) -> CResult<()> {
        if self.session.is_none() {
            self.session = Some(self.sessions.open(&self.source)?);
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for CassandraCompiler {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Compiler for CassandraCompiler {
    fn run(&mut self, query: &str, options: &Options) -> CResult<Value> {
        let statement = parse(query)?;

        if let Some(session) = self.session.as_mut() {
            return execute_statement(session.as_mut(), &statement, options);
        }

        // Standalone use: one session per call
        let mut session = self.sessions.open(&self.source)?;
        let result = execute_statement(session.as_mut(), &statement, options);
        session.close();
        result
    }
}

fn execute_statement(
    session: &mut dyn CqlSession,
    statement: &Statement,
    options: &Options,
) -> CResult<Value> {
    match statement {
        Statement::DropTable(drop) => {
            let table = keyspace_table(&drop.table)?;
            session.execute(&format!("DROP TABLE {}", table), &[], false)?;
            Ok(Value::Null)
        }
        Statement::CreateTable(create) => {
            session.execute(&create_table_cql(create)?, &[], false)?;
            Ok(Value::Null)
        }
        Statement::Insert(insert) => {
            let table = keyspace_table(&insert.table)?;
            let columns: Vec<&str> = insert.columns.iter().map(|c| c.name.as_str()).collect();
            let mut args = Vec::with_capacity(insert.values.len());
            for value in &insert.values {
                match value.as_literal() {
                    Some(lit) => args.push(literal_value(lit)),
                    None => return Err(error("unknown literal")),
                }
            }
            let stubs = vec!["?"; args.len()].join(",");
            let cql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(","),
                stubs
            );
            session.execute(&cql, &args, false)?;
            Ok(Value::Null)
        }
        Statement::Delete(delete) => {
            let table = keyspace_table(&delete.table)?;
            let mut args = Vec::new();
            let filter = match &delete.where_clause {
                Some(cond) => lower_where(cond, &mut args)?,
                None => return Err(error("missing WHERE clause in DELETE statement")),
            };
            session.execute(&format!("DELETE FROM {} WHERE {}", table, filter), &args, false)?;
            Ok(Value::Null)
        }
        Statement::Update(update) => {
            let table = keyspace_table(&update.table)?;
            let mut args = Vec::new();
            let mut sets = Vec::with_capacity(update.assignments.len());
            for assignment in &update.assignments {
                match assignment.value.as_literal() {
                    Some(lit) => {
                        sets.push(format!("{} = ?", assignment.column.name));
                        args.push(literal_value(lit));
                    }
                    None => return Err(error("invalid expression in SET")),
                }
            }
            let filter = match &update.where_clause {
                Some(cond) => lower_where(cond, &mut args)?,
                None => return Err(error("missing WHERE clause in UPDATE statement")),
            };
            let cql = format!("UPDATE {} SET {} WHERE {}", table, sets.join(","), filter);
            session.execute(&cql, &args, false)?;
            Ok(Value::Null)
        }
        Statement::Query(Query::Select(select)) => run_select(session, select, options),
        Statement::Query(Query::Compound { .. }) => Err(error("set operations are not supported")),
    }
}

fn keyspace_table(id: &Identifier) -> CResult<String> {
    match &id.owner {
        Some(keyspace) => Ok(format!("{}.{}", keyspace, id.name)),
        None => Err(error("invalid table name")),
    }
}

fn create_table_cql(create: &CreateTable) -> CResult<String> {
    let table = keyspace_table(&create.table)?;
    let fields: Vec<String> = create
        .fields
        .iter()
        .map(|f| format!("{} {}", f.name, f.field_type))
        .collect();

    let mut primary_key = format!(
        "PRIMARY KEY(({})",
        create.primary_key.partitioning.join(", ")
    );
    if !create.primary_key.clustering.is_empty() {
        primary_key.push_str(", ");
        primary_key.push_str(&create.primary_key.clustering.join(", "));
    }
    primary_key.push(')');

    let mut directives = Vec::new();
    if !create.clustering_order.is_empty() {
        let order: Vec<String> = create
            .clustering_order
            .iter()
            .map(|o| format!("{} {}", o.column, if o.descending { "DESC" } else { "ASC" }))
            .collect();
        directives.push(format!("CLUSTERING ORDER BY ({})", order.join(", ")));
    }
    if create.compact_storage {
        directives.push("COMPACT STORAGE".to_string());
    }

    let mut cql = format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, {})",
        table,
        fields.join(", "),
        primary_key
    );
    if !directives.is_empty() {
        cql.push_str(" WITH ");
        cql.push_str(&directives.join(" AND "));
    }
    Ok(cql)
}

/// Bind value for a literal
pub fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Integer(n) => n
            .parse::<i64>()
            .map(Value::Int)
            .or_else(|_| n.parse::<f64>().map(Value::Float))
            .unwrap_or_else(|_| Value::String(n.clone())),
        Literal::Float(n) => n
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::String(n.clone())),
        Literal::Boolean(b) => Value::Bool(*b),
        Literal::Binary(bytes) => Value::Bytes(bytes.clone()),
        Literal::Null => Value::Null,
        Literal::Collection(Collection::Set(items)) => {
            Value::List(items.iter().map(element_value).collect())
        }
        Literal::Collection(Collection::Map(entries)) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (element_text(k), element_value(v)))
                .collect(),
        ),
        other => Value::String(other.text()),
    }
}

fn element_text(element: &Element) -> String {
    match element {
        Element::Number(n) | Element::Quoted(n) => n.clone(),
    }
}

fn element_value(element: &Element) -> Value {
    match element {
        Element::Number(n) => literal_value(&Literal::Integer(n.clone())),
        Element::Quoted(s) => Value::String(s.clone()),
    }
}

/// Lower a condition to a CQL fragment, collecting bound values
fn lower_where(expr: &Expr, args: &mut Vec<Value>) -> CResult<String> {
    match &expr.kind {
        ExprKind::Identifier(id) => Ok(id.name.clone()),
        ExprKind::Literal(lit) => {
            args.push(literal_value(lit));
            Ok("?".to_string())
        }
        ExprKind::Binary { op, left, right } => {
            let left = lower_where(left, args)?;
            let right = lower_where(right, args)?;
            let op = match op {
                BinaryOp::And => "AND",
                BinaryOp::Or => "OR",
                other => other.symbol(),
            };
            Ok(format!("{} {} {}", left, op, right))
        }
        _ => Err(error("unsupported expression in WHERE")),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Transform {
    Identity,
    JsonFetch { field: String },
    MapBlobJsonFetch { field: String, sub_field: String },
    SubtractTimestamps,
    Aggregate,
    TableCount,
}

/// How one output column is computed from a result row
#[derive(Debug, Clone, PartialEq)]
struct Transformer {
    /// Result columns fed to the transform
    columns: Vec<String>,
    /// Output column name
    alias: String,
    transform: Transform,
}

#[derive(PartialEq)]
enum Projection {
    Unset,
    Wildcard,
    Columns,
}

/// Select list to CQL columns plus transformers
fn select_columns(items: &[SelectItem]) -> CResult<(String, Vec<Transformer>)> {
    let mut columns = Vec::new();
    let mut transformers = Vec::new();
    let mut mode = Projection::Unset;

    for item in items {
        let (expr, alias) = match item {
            SelectItem::Wildcard => {
                if mode == Projection::Columns {
                    return Err(error("invalid column mix"));
                }
                mode = Projection::Wildcard;
                columns.push("*".to_string());
                transformers.push(Transformer {
                    columns: vec!["*".to_string()],
                    alias: "*".to_string(),
                    transform: Transform::Identity,
                });
                continue;
            }
            SelectItem::Expr { expr, alias } => (expr, alias.as_ref().map(|a| a.to_lowercase())),
        };

        let table_count = matches!(
            &expr.kind,
            ExprKind::Function { name: FunctionName::TCount, .. }
        );
        if !table_count {
            if mode == Projection::Wildcard {
                return Err(error("invalid column mix"));
            }
            mode = Projection::Columns;
        }

        match &expr.kind {
            ExprKind::Identifier(id) => {
                let name = match alias {
                    Some(alias) => {
                        columns.push(format!("{} AS {}", id.name, alias));
                        alias
                    }
                    None => {
                        columns.push(id.name.clone());
                        id.name.clone()
                    }
                };
                transformers.push(Transformer {
                    columns: vec![name.to_lowercase()],
                    alias: name,
                    transform: Transform::Identity,
                });
            }
            ExprKind::Function { name, params } => {
                let transformer = function_column(*name, params, alias, &mut columns)?;
                transformers.push(transformer);
            }
            _ => return Err(error("invalid column name")),
        }
    }

    Ok((columns.join(","), transformers))
}

fn param_column(params: &[Expr], index: usize) -> CResult<&Identifier> {
    params
        .get(index)
        .and_then(Expr::as_identifier)
        .ok_or_else(|| error("invalid column name"))
}

fn param_text(params: &[Expr], index: usize) -> CResult<String> {
    match params.get(index).and_then(Expr::as_literal) {
        Some(lit) => Ok(lit.text()),
        None => Err(error("invalid function parameter")),
    }
}

fn function_column(
    name: FunctionName,
    params: &[Expr],
    alias: Option<String>,
    columns: &mut Vec<String>,
) -> CResult<Transformer> {
    match name {
        FunctionName::JsonFetch | FunctionName::MapBlobJsonFetch => {
            let column = param_column(params, 0)?;
            let field = param_text(params, 1)?;
            let (source, default_alias, transform) = if name == FunctionName::JsonFetch {
                (
                    column.name.clone(),
                    format!("{}({})", name.name(), field),
                    Transform::JsonFetch { field },
                )
            } else {
                let sub_field = param_text(params, 2)?;
                (
                    column.name.clone(),
                    format!("{}({},{})", name.name(), field, sub_field),
                    Transform::MapBlobJsonFetch { field, sub_field },
                )
            };
            let (column_key, alias) = match alias {
                Some(alias) => {
                    columns.push(format!("{} AS {}", source, alias));
                    (alias.clone(), alias)
                }
                None => {
                    columns.push(source.clone());
                    (source.to_lowercase(), default_alias)
                }
            };
            Ok(Transformer {
                columns: vec![column_key],
                alias,
                transform,
            })
        }
        FunctionName::SubtractTimestamps => {
            let first = param_column(params, 0)?;
            let second = param_column(params, 1)?;
            let (keys, alias) = match alias {
                Some(alias) => {
                    let alias1 = format!("{}1", alias);
                    let alias2 = format!("{}2", alias);
                    columns.push(format!("{} AS {}", first.name, alias1));
                    columns.push(format!("{} AS {}", second.name, alias2));
                    (vec![alias1, alias2], alias)
                }
                None => {
                    columns.push(first.name.clone());
                    columns.push(second.name.clone());
                    (
                        vec![first.name.to_lowercase(), second.name.to_lowercase()],
                        format!("{}({},{})", name.name(), first.name, second.name),
                    )
                }
            };
            Ok(Transformer {
                columns: keys,
                alias,
                transform: Transform::SubtractTimestamps,
            })
        }
        FunctionName::Count
        | FunctionName::Sum
        | FunctionName::Mean
        | FunctionName::Variance
        | FunctionName::Stdev
        | FunctionName::Min
        | FunctionName::Max
        | FunctionName::First
        | FunctionName::Last => {
            let column = param_column(params, 0)?;
            let function = if name == FunctionName::Mean { "avg" } else { name.name() };
            let call = format!("{}({})", function, column.name);
            let key = match alias {
                Some(alias) => {
                    columns.push(format!("{} AS {}", call, alias));
                    alias
                }
                None => {
                    columns.push(call);
                    format!("system.{}({})", function, column.name.to_lowercase())
                }
            };
            Ok(Transformer {
                columns: vec![key.clone()],
                alias: key,
                transform: Transform::Aggregate,
            })
        }
        FunctionName::TCount => {
            columns.push("count(*)".to_string());
            Ok(Transformer {
                columns: vec!["count".to_string()],
                alias: "count".to_string(),
                transform: Transform::TableCount,
            })
        }
        FunctionName::TCorr | FunctionName::TCov => Err(error("unknown table aggregator")),
        _ => Err(error("unknown function")),
    }
}

fn run_select(session: &mut dyn CqlSession, select: &Select, options: &Options) -> CResult<Value> {
    if !select.joins.is_empty() {
        return Err(error("invalid FROM in SELECT"));
    }
    if select.group_by.is_some() || !select.order_by.is_empty() {
        return Err(error("GROUP BY or ORDER BY not supported in SELECT"));
    }
    let table = match select.from.table() {
        Some(id) => keyspace_table(id)?,
        None => return Err(error("invalid table name")),
    };

    let (columns, mut transformers) = select_columns(&select.items)?;

    let mut args = Vec::new();
    let mut cql = format!("SELECT {} FROM {}", columns, table);
    if let Some(cond) = &select.where_clause {
        cql.push_str(" WHERE ");
        cql.push_str(&lower_where(cond, &mut args)?);
    }
    if let Some(limit) = select.limit {
        cql.push_str(&format!(" LIMIT {}", limit));
    }
    if options.allow_filtering {
        cql.push_str(" allow filtering");
    }

    let result = session.execute(&cql, &args, true)?;
    debug!(rows = result.rows.len(), "cassandra select finished");

    if transformers.first().map(|t| t.columns[0] == "*").unwrap_or(false) {
        transformers = result
            .columns
            .iter()
            .map(|c| Transformer {
                columns: vec![c.name.clone()],
                alias: c.name.clone(),
                transform: Transform::Identity,
            })
            .collect();
    }

    materialize(&result, &transformers, options)
}

fn materialize(result: &QueryRows, transformers: &[Transformer], options: &Options) -> CResult<Value> {
    let mut types: Vec<Value> = Vec::new();
    let mut rows = Vec::with_capacity(result.rows.len());

    for (index, row) in result.rows.iter().enumerate() {
        let mut out = Vec::with_capacity(transformers.len());
        for transformer in transformers {
            let inputs: Vec<&Value> = transformer
                .columns
                .iter()
                .map(|c| row.get(c).unwrap_or(&Value::Null))
                .collect();
            let column_types: Vec<&str> = transformer
                .columns
                .iter()
                .map(|c| result.column_type(c))
                .collect();
            let value = apply(&transformer.transform, &inputs, &column_types)?;

            if transformer.transform == Transform::TableCount {
                let mut count = BTreeMap::new();
                count.insert("type".to_string(), Value::from(value::INTEGER));
                count.insert("value".to_string(), Value::String(data_to_string(&value, value::INTEGER)));
                return Ok(Value::Map(count));
            }

            let internal_type = value.internal_type();
            if index == 0 {
                types.push(Value::String(internal_type.clone()));
            }
            if options.return_typed {
                out.push(value);
            } else {
                out.push(Value::String(data_to_string(&value, &internal_type)));
            }
        }
        rows.push(Value::List(out));
    }

    let mut output = BTreeMap::new();
    output.insert(
        "columns".to_string(),
        Value::List(transformers.iter().map(|t| Value::String(t.alias.clone())).collect()),
    );
    output.insert("types".to_string(), Value::List(types));
    output.insert("rows".to_string(), Value::List(rows));
    Ok(Value::Map(output))
}

fn nanos(value: &Value) -> Option<i64> {
    match value {
        Value::Timestamp(t) => Some(t.timestamp_nanos_opt().unwrap_or(0)),
        _ => None,
    }
}

fn apply(transform: &Transform, inputs: &[&Value], column_types: &[&str]) -> CResult<Value> {
    match transform {
        Transform::Identity => {
            let value = inputs[0];
            if column_types[0] == value::TIME {
                return match value {
                    Value::Null => Ok(Value::Null),
                    other => nanos(other)
                        .map(|n| Value::Int(n.max(0)))
                        .ok_or_else(|| error("invalid column type")),
                };
            }
            Ok(value.clone())
        }
        Transform::Aggregate | Transform::TableCount => Ok(inputs[0].clone()),
        Transform::JsonFetch { field } => {
            let text = inputs[0]
                .as_str()
                .ok_or_else(|| error("invalid first argument in JSON_FETCH, string required"))?;
            let document: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(text).map_err(|_| error("malformed records received"))?;
            Ok(document
                .get(field)
                .cloned()
                .map(Value::from)
                .unwrap_or_else(|| Value::from("")))
        }
        Transform::MapBlobJsonFetch { field, sub_field } => {
            let entries = match inputs[0] {
                Value::Map(entries) => entries,
                _ => {
                    return Err(error(
                        "invalid first argument in MAP_BLOB_JSON_FETCH, map[string]blob required",
                    ))
                }
            };
            let blob = match entries.get(field) {
                Some(Value::Bytes(bytes)) => bytes,
                Some(_) => return Err(error("malformed records received")),
                None => return Ok(Value::from("")),
            };
            let document: serde_json::Value =
                serde_json::from_slice(blob).map_err(|_| error("malformed records received"))?;
            match document {
                serde_json::Value::Object(map) => Ok(map
                    .get(sub_field)
                    .cloned()
                    .map(Value::from)
                    .unwrap_or_else(|| Value::from(""))),
                other => Ok(Value::from(other)),
            }
        }
        Transform::SubtractTimestamps => {
            let first = nanos(inputs[0]).ok_or_else(|| {
                error("invalid first argument in SUBTRACT_TIMESTAMPS, timestamp required")
            })?;
            let second = nanos(inputs[1]).ok_or_else(|| {
                error("invalid second argument in SUBTRACT_TIMESTAMPS, timestamp required")
            })?;
            if first <= 0 || second <= 0 {
                return Ok(Value::Int(0));
            }
            Ok(Value::Int(first - second))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nsql::cql_session::{ColumnMeta, ScriptedSessions};
    use chrono::{TimeZone, Utc};

    fn compiler(sessions: &ScriptedSessions) -> CassandraCompiler {
        CassandraCompiler::new(Source::default(), Arc::new(sessions.clone()))
    }

    #[test]
    fn test_statement_cql() {
        let cases = vec![
            (
                "SELECT * FROM ks.tbl WHERE battery_level > 0;",
                "SELECT * FROM ks.tbl WHERE battery_level > ?",
                vec![Value::Int(0)],
            ),
            (
                "insert into ks.tbl (a, b) values ('x', 2.5);",
                "INSERT INTO ks.tbl (a,b) VALUES (?,?)",
                vec![Value::from("x"), Value::Float(2.5)],
            ),
            (
                "update ks.tbl set a = 1, b = 'y' where id = 3 and c != true;",
                "UPDATE ks.tbl SET a = ?,b = ? WHERE id = ? AND c != ?",
                vec![Value::Int(1), Value::from("y"), Value::Int(3), Value::Bool(true)],
            ),
            (
                "delete from ks.tbl where id = 3;",
                "DELETE FROM ks.tbl WHERE id = ?",
                vec![Value::Int(3)],
            ),
            ("drop table ks.tbl;", "DROP TABLE ks.tbl", vec![]),
            (
                "select mean(a) as m, max(b) from ks.tbl limit 5;",
                "SELECT avg(a) AS m,max(b) FROM ks.tbl LIMIT 5",
                vec![],
            ),
        ];

        for (query, cql, args) in cases {
            let sessions = ScriptedSessions::new();
            compiler(&sessions).run(query, &Options::default()).unwrap();
            let executed = sessions.executed();
            assert_eq!(executed.len(), 1, "{}", query);
            assert_eq!(executed[0].cql, cql);
            assert_eq!(executed[0].args, args);
        }
    }

    #[test]
    fn test_create_table_cql() {
        let sessions = ScriptedSessions::new();
        compiler(&sessions)
            .run(
                "create table ks.t (a int, b text, c timestamp, primary key ((a, b), c)) \
                 with clustering order by (c desc) and compact storage;",
                &Options::default(),
            )
            .unwrap();
        assert_eq!(
            sessions.executed()[0].cql,
            "CREATE TABLE IF NOT EXISTS ks.t (a int, b text, c timestamp, PRIMARY KEY((a, b), c)) \
             WITH CLUSTERING ORDER BY (c DESC) AND COMPACT STORAGE"
        );
    }

    #[test]
    fn test_compile_errors() {
        let cases = vec![
            ("delete from ks.tbl;", "missing WHERE clause in DELETE statement"),
            ("update ks.tbl set a = 1;", "missing WHERE clause in UPDATE statement"),
            ("update ks.tbl set a = b where id = 1;", "invalid expression in SET"),
            ("select *, a from ks.tbl;", "unexpected COMMA"),
            ("select a from tbl;", "invalid table name"),
            ("select a from ks.t1 join ks.t2;", "invalid FROM in SELECT"),
            (
                "select a from ks.tbl where a is null;",
                "unsupported expression in WHERE",
            ),
            (
                "(select a from ks.t) union (select a from ks.t);",
                "set operations are not supported",
            ),
        ];
        for (query, expected) in cases {
            let sessions = ScriptedSessions::new();
            let err = compiler(&sessions).run(query, &Options::default()).unwrap_err();
            assert!(err.to_string().ends_with(expected), "{} -> {}", query, err);
        }
    }

    #[test]
    fn test_select_transformers() {
        let sessions = ScriptedSessions::new();
        let t1 = Utc.timestamp_opt(100, 0).unwrap();
        let t2 = Utc.timestamp_opt(40, 0).unwrap();
        let mut row = BTreeMap::new();
        row.insert("id".to_string(), Value::Int(7));
        row.insert("stats".to_string(), Value::from(r#"{"rssi": -71}"#));
        row.insert("d1".to_string(), Value::Timestamp(t1));
        row.insert("d2".to_string(), Value::Timestamp(t2));
        sessions.push(Ok(QueryRows {
            columns: vec![
                ColumnMeta { name: "id".to_string(), internal_type: "int".to_string() },
                ColumnMeta { name: "stats".to_string(), internal_type: "string".to_string() },
                ColumnMeta { name: "d1".to_string(), internal_type: "time".to_string() },
                ColumnMeta { name: "d2".to_string(), internal_type: "time".to_string() },
            ],
            rows: vec![row],
        }));

        let result = compiler(&sessions)
            .run(
                "select id, json_fetch(stats, 'rssi'), subtract_timestamps(a, b) as d from ks.tbl;",
                &Options { return_typed: true, ..Options::default() },
            )
            .unwrap();
        assert_eq!(
            sessions.executed()[0].cql,
            "SELECT id,stats,a AS d1,b AS d2 FROM ks.tbl"
        );
        assert_eq!(
            result.get("columns"),
            Some(&Value::List(vec![
                Value::from("id"),
                Value::from("json_fetch(rssi)"),
                Value::from("d"),
            ]))
        );
        assert_eq!(
            result.get("rows"),
            Some(&Value::List(vec![Value::List(vec![
                Value::Int(7),
                Value::Int(-71),
                Value::Int(60_000_000_000),
            ])]))
        );
        assert_eq!(
            result.get("types"),
            Some(&Value::List(vec![Value::from("int"), Value::from("int"), Value::from("int")]))
        );
    }

    #[test]
    fn test_table_count_and_wildcard() {
        let sessions = ScriptedSessions::new();
        let mut row = BTreeMap::new();
        row.insert("count".to_string(), Value::Int(42));
        sessions.push(Ok(QueryRows {
            columns: vec![ColumnMeta { name: "count".to_string(), internal_type: "int".to_string() }],
            rows: vec![row],
        }));
        let result = compiler(&sessions)
            .run("select tcount() from ks.tbl;", &Options::default())
            .unwrap();
        assert_eq!(sessions.executed()[0].cql, "SELECT count(*) FROM ks.tbl");
        assert_eq!(result.get("type"), Some(&Value::from("int")));
        assert_eq!(result.get("value"), Some(&Value::from("42")));

        let sessions = ScriptedSessions::new();
        let mut row = BTreeMap::new();
        row.insert("a".to_string(), Value::Bytes(vec![0xab]));
        row.insert("b".to_string(), Value::Bool(true));
        sessions.push(Ok(QueryRows {
            columns: vec![
                ColumnMeta { name: "a".to_string(), internal_type: "blob".to_string() },
                ColumnMeta { name: "b".to_string(), internal_type: "bool".to_string() },
            ],
            rows: vec![row],
        }));
        let result = compiler(&sessions)
            .run(
                "select * from ks.tbl;",
                &Options { allow_filtering: true, ..Options::default() },
            )
            .unwrap();
        assert_eq!(sessions.executed()[0].cql, "SELECT * FROM ks.tbl allow filtering");
        assert_eq!(
            result.get("rows"),
            Some(&Value::List(vec![Value::List(vec![
                Value::from("0xab"),
                Value::from("true"),
            ])]))
        );
    }

    #[test]
    fn test_session_lifecycle() {
        let sessions = ScriptedSessions::new();
        let mut standalone = compiler(&sessions);
        standalone.run("drop table ks.a;", &Options::default()).unwrap();
        standalone.run("drop table ks.b;", &Options::default()).unwrap();
        assert_eq!(sessions.lifecycle(), (2, 2));

        let sessions = ScriptedSessions::new();
        let mut connected = compiler(&sessions);
        connected.connect().unwrap();
        connected.run("drop table ks.a;", &Options::default()).unwrap();
        connected.run("drop table ks.b;", &Options::default()).unwrap();
        assert_eq!(sessions.lifecycle(), (1, 0));
        connected.disconnect();
        assert!(!connected.is_connected());
        assert_eq!(sessions.lifecycle(), (1, 1));
    }

    #[test]
    fn test_json_fetch_errors() {
        let cases = vec![
            (Value::Int(1), "invalid first argument in JSON_FETCH, string required"),
            (Value::from("{not json"), "malformed records received"),
        ];
        for (input, expected) in cases {
            let err = apply(
                &Transform::JsonFetch { field: "x".to_string() },
                &[&input],
                &["string"],
            )
            .unwrap_err();
            assert!(err.to_string().ends_with(expected));
        }

        let mut blobs = BTreeMap::new();
        blobs.insert("cap".to_string(), Value::Bytes(br#"{"field": "v"}"#.to_vec()));
        let value = apply(
            &Transform::MapBlobJsonFetch {
                field: "cap".to_string(),
                sub_field: "field".to_string(),
            },
            &[&Value::Map(blobs)],
            &["map[string]blob"],
        )
        .unwrap();
        assert_eq!(value, Value::from("v"));
    }
}
