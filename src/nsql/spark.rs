//! Spark backend
//!
//! A query is compiled into a Scala program of chained dataframe statements,
//! `var dfN = df(N-1).<operation>;`, and posted to the Spark execution
//! service. The service replies with the collected rows as wire strings.

use std::collections::{BTreeMap, HashMap, HashSet};

use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::ast::*;
use super::{parse, udfs, Compiler, Options, Source, CASSANDRA};
use crate::error::NsqlError;
use crate::value::{data_to_string, string_to_data, Value};

const EXECUTE_PATH: &str = "/execute";
const CLUSTER: &str = "ClusterOne";
const SUFFIX: &str = ";";

type SResult<T> = Result<T, NsqlError>;

fn error(msg: impl Into<String>) -> NsqlError {
    NsqlError::spark(msg)
}

/// How the service should collect the final variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Converter {
    #[default]
    Dataframe,
    Number,
}

impl Converter {
    fn name(&self) -> &'static str {
        match self {
            Converter::Dataframe => "dataframe",
            Converter::Number => "number",
        }
    }
}

/// Per-compile bookkeeping, reset on every call
#[derive(Debug, Default)]
struct State {
    context: usize,
    converter: Converter,
    /// Variable holding the latest dataframe
    variable: String,
    code: String,
    /// Table reference -> variable
    references: HashMap<String, String>,
    udfs: HashSet<&'static str>,
    fetch_limit: u64,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    converter: &'static str,
    limit: u64,
    statements: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ExecuteResponse {
    result: String,
    status: String,
    error_descr: String,
}

/// Compiles nsQL to a Spark program and runs it on the execution service
pub struct SparkCompiler {
    host_port: String,
    source: Source,
    state: State,
}

impl SparkCompiler {
    pub fn new(host_port: &str, source: Source) -> Self {
        SparkCompiler {
            host_port: host_port.to_string(),
            source,
            state: State::default(),
        }
    }

    /// Compile `query` into the JSON request body for the execution service
    pub fn compile(&mut self, query: &str, options: Option<&Options>) -> SResult<String> {
        let options = options.ok_or_else(|| error("mandatory options missing"))?;
        let statement = parse(query)?;

        self.state = State {
            fetch_limit: options.cassandra_fetch_limit,
            ..State::default()
        };
        self.initializer();

        match &statement {
            Statement::Query(query) => self.query(query)?,
            _ => return Err(error("unsupported statement type")),
        }

        let request = ExecuteRequest {
            converter: self.state.converter.name(),
            limit: 0,
            statements: &self.state.code,
        };
        serde_json::to_string(&request).map_err(|e| error(e.to_string()))
    }

    fn initializer(&mut self) {
        self.push("import org.apache.spark.sql.functions._");
        if self.source.protocol != CASSANDRA {
            return;
        }
        let settings = [
            ("spark.cassandra.connection.host", self.source.host.clone()),
            ("spark.cassandra.connection.port", self.source.port.clone()),
            ("spark.cassandra.input.consistency.level", "LOCAL_QUORUM".to_string()),
            ("spark.cassandra.auth.username", self.source.username.clone()),
            ("spark.cassandra.auth.password", self.source.password.clone()),
        ];
        for (key, value) in settings {
            self.push(&format!(
                "sqlContext.setConf(\"{}/{}\", {})",
                CLUSTER,
                key,
                scala_string(&value)
            ));
        }
    }

    fn push(&mut self, statement: &str) {
        self.state.code.push_str(statement);
        self.state.code.push_str(SUFFIX);
    }

    fn new_dataframe(&mut self) -> String {
        self.state.context += 1;
        format!("df{}", self.state.context)
    }

    /// Bind `operation` to a fresh variable that becomes the current one
    fn assign(&mut self, operation: String) -> String {
        let frame = self.new_dataframe();
        self.push(&format!("var {} = {}", frame, operation));
        self.state.variable = frame.clone();
        self.state.converter = Converter::Dataframe;
        frame
    }

    fn query(&mut self, query: &Query) -> SResult<()> {
        match query {
            Query::Select(select) => self.select(select),
            Query::Compound { op, left, right } => {
                self.query(left)?;
                let left = self.state.variable.clone();
                self.query(right)?;
                let right = self.state.variable.clone();
                let operation = match op {
                    SetOperator::Union => format!("{}.unionAll({}).dropDuplicates()", left, right),
                    SetOperator::UnionAll => format!("{}.unionAll({})", left, right),
                    SetOperator::Intersect => format!("{}.intersect({})", left, right),
                };
                self.assign(operation);
                Ok(())
            }
        }
    }

    fn select(&mut self, select: &Select) -> SResult<()> {
        self.load(&select.from)?;
        for join in &select.joins {
            self.join(join)?;
        }

        if let Some(condition) = &select.where_clause {
            let filter = self.expression(condition)?;
            if !filter.is_empty() {
                let frame = self.state.variable.clone();
                self.assign(format!("{}.filter({})", frame, filter));
            }
        }

        match &select.group_by {
            Some(group) => self.group_by(group, &select.items)?,
            None => self.projection(select)?,
        }

        // A table aggregator leaves a scalar behind
        if self.state.converter == Converter::Number {
            return Ok(());
        }

        if !select.order_by.is_empty() {
            let mut columns = Vec::new();
            for item in &select.order_by {
                let column = self.expression(&item.expr)?;
                columns.push(if item.descending {
                    format!("{}.desc", column)
                } else {
                    column
                });
            }
            let frame = self.state.variable.clone();
            self.assign(format!("{}.orderBy({})", frame, columns.join(", ")));
        }

        if let Some(limit) = select.limit {
            let frame = self.state.variable.clone();
            self.assign(format!("{}.limit({})", frame, limit));
        }
        Ok(())
    }

    fn projection(&mut self, select: &Select) -> SResult<()> {
        let mut columns = Vec::new();
        for item in &select.items {
            let column = self.item(item)?;
            if column.is_empty() {
                return Ok(());
            }
            columns.push(column);
        }
        let frame = self.state.variable.clone();
        let mut operation = format!("{}.select({})", frame, columns.join(", "));
        if select.distinct {
            operation.push_str(".dropDuplicates()");
        }
        self.assign(operation);
        Ok(())
    }

    fn group_by(&mut self, group: &GroupBy, items: &[SelectItem]) -> SResult<()> {
        let mut keys = Vec::new();
        for item in &group.items {
            keys.push(self.item(item)?);
        }
        let mut aggregates = Vec::new();
        for item in items {
            let column = self.item(item)?;
            if !column.is_empty() {
                aggregates.push(column);
            }
        }

        let frame = self.state.variable.clone();
        let operation = if aggregates.is_empty() {
            format!("{}.groupBy({}).count().drop(\"count\")", frame, keys.join(", "))
        } else {
            format!(
                "{}.groupBy({}).agg({})",
                frame,
                keys.join(", "),
                aggregates.join(", ")
            )
        };
        self.assign(operation);

        if let Some(having) = &group.having {
            let filter = self.expression(having)?;
            if !filter.is_empty() {
                let frame = self.state.variable.clone();
                self.assign(format!("{}.filter({})", frame, filter));
            }
        }
        Ok(())
    }

    fn item(&mut self, item: &SelectItem) -> SResult<String> {
        match item {
            SelectItem::Wildcard => Ok(format!("{}(\"*\")", self.state.variable)),
            SelectItem::Expr { expr, alias } => {
                let column = self.expression(expr)?;
                Ok(match alias {
                    Some(alias) if !column.is_empty() => {
                        format!("{}.as({})", column, scala_string(alias))
                    }
                    _ => column,
                })
            }
        }
    }

    /// Load a table or build a subquery, then register its reference
    fn load(&mut self, table: &TableRef) -> SResult<()> {
        match &table.source {
            TableSource::Table(id) => {
                let keyspace = id
                    .owner
                    .as_deref()
                    .ok_or_else(|| error(format!("keyspace missing for table {}", id.name)))?;
                if self.source.protocol != CASSANDRA {
                    return Err(error(format!(
                        "{} is not a supported data source protocol",
                        self.source.protocol
                    )));
                }
                let frame = self.new_dataframe();
                let mut load = format!(
                    "var {} = sqlContext.read.format(\"org.apache.spark.sql.cassandra\")\
                     .options(Map(\"cluster\" -> \"{}\", \"keyspace\" -> {}, \"table\" -> {})).load()",
                    frame,
                    CLUSTER,
                    scala_string(keyspace),
                    scala_string(&id.name)
                );
                if self.state.fetch_limit > 0 {
                    load.push_str(&format!(".limit({})", self.state.fetch_limit));
                }
                load.push_str(".cache()");
                self.push(&load);
                self.push(&format!("{}.count()", frame));
                self.state.variable = frame;
                self.state.converter = Converter::Dataframe;
            }
            TableSource::Subquery(query) => self.query(query)?,
        }
        self.state
            .references
            .insert(table.reference(), self.state.variable.clone());
        Ok(())
    }

    fn join(&mut self, join: &Join) -> SResult<()> {
        let left = self.state.variable.clone();
        self.load(&join.table)?;
        let right = self.state.variable.clone();

        let mut arguments = vec![right];
        match &join.on {
            Some(on) => arguments.push(self.expression(on)?),
            None if join.kind != JoinKind::Inner => arguments.push("lit(true)".to_string()),
            None => {}
        }
        let kind = match join.kind {
            JoinKind::Inner => None,
            JoinKind::LeftOuter => Some("left_outer"),
            JoinKind::RightOuter => Some("right_outer"),
            JoinKind::FullOuter => Some("outer"),
            JoinKind::LeftSemi => Some("leftsemi"),
        };
        if let Some(kind) = kind {
            arguments.push(scala_string(kind));
        }
        self.assign(format!("{}.join({})", left, arguments.join(", ")));
        Ok(())
    }

    /// Column expression text; empty when the expression was compiled into
    /// dataframe statements instead
    fn expression(&mut self, expr: &Expr) -> SResult<String> {
        match &expr.kind {
            ExprKind::Literal(lit) => literal(lit),
            ExprKind::Identifier(id) => Ok(self.identifier(id)),
            ExprKind::Binary { op, left, right } if op.is_logical() => {
                self.logical(*op, left, right)
            }
            ExprKind::Binary { op, left, right } => {
                let l = self.expression(left)?;
                let r = self.expression(right)?;
                Ok(match op {
                    BinaryOp::Eq => format!("{} === {}", l, r),
                    BinaryOp::Ne => format!("{} =!= {}", l, r),
                    BinaryOp::BitAnd => format!("{}.bitwiseAND({})", l, r),
                    BinaryOp::BitOr => format!("{}.bitwiseOR({})", l, r),
                    op if op.is_comparison() => format!("{} {} {}", l, op.symbol(), r),
                    op => format!("({} {} {})", l, op.symbol(), r),
                })
            }
            ExprKind::Negate(inner) => Ok(format!("(- {})", self.expression(inner)?)),
            ExprKind::Function { name, params } => self.function(*name, params),
            ExprKind::IsNull { negated, expr } => {
                let column = self.expression(expr)?;
                Ok(if *negated {
                    format!("{}.isNotNull", column)
                } else {
                    format!("{}.isNull", column)
                })
            }
            ExprKind::In {
                negated,
                expr,
                query,
            } => self.membership(*negated, expr, query),
        }
    }

    fn identifier(&self, id: &Identifier) -> String {
        let frame = match &id.owner {
            Some(owner) => self
                .state
                .references
                .get(owner)
                .cloned()
                .unwrap_or_else(|| owner.clone()),
            None => self.state.variable.clone(),
        };
        format!("{}({})", frame, scala_string(&id.name))
    }

    fn function(&mut self, name: FunctionName, params: &[Expr]) -> SResult<String> {
        if name.family() == Family::TableAggregator {
            self.table_aggregator(name, params)?;
            return Ok(String::new());
        }

        let spark_name = match name {
            FunctionName::Day => "dayofmonth",
            FunctionName::Now => "current_timestamp",
            FunctionName::Stdev => "stddev",
            FunctionName::SubtractTimestamps => {
                self.udf("subtract_timestamps", udfs::SUBTRACT_TIMESTAMPS)
            }
            FunctionName::JsonFetch => self.udf("json_fetch", udfs::JSON_FETCH),
            FunctionName::MapBlobJsonFetch => {
                self.udf("map_blob_json_fetch", udfs::MAP_BLOB_JSON_FETCH)
            }
            other => other.name(),
        };

        let mut arguments = Vec::new();
        for param in params {
            arguments.push(self.expression(param)?);
        }
        Ok(format!("{}({})", spark_name, arguments.join(", ")))
    }

    /// Emit a UDF definition the first time it is used
    fn udf(&mut self, name: &'static str, definition: &str) -> &'static str {
        if self.state.udfs.insert(name) {
            self.push(definition);
        }
        name
    }

    fn table_aggregator(&mut self, name: FunctionName, params: &[Expr]) -> SResult<()> {
        let frame = self.state.variable.clone();
        let operation = match name {
            FunctionName::TCount => format!("{}.count()", frame),
            FunctionName::TCorr | FunctionName::TCov => {
                let columns = params
                    .iter()
                    .map(|p| {
                        p.as_identifier()
                            .map(|id| scala_string(&id.name))
                            .ok_or_else(|| error(format!("column expected in {}", name.name())))
                    })
                    .collect::<SResult<Vec<_>>>()?;
                let method = if name == FunctionName::TCorr { "corr" } else { "cov" };
                format!("{}.stat.{}({})", frame, method, columns.join(", "))
            }
            other => return Err(error(format!("{} is not a table aggregator", other.name()))),
        };
        let value = self.new_dataframe();
        self.push(&format!("var {} = {}", value, operation));
        self.state.variable = value;
        self.state.converter = Converter::Number;
        Ok(())
    }

    /// `x [not] in (select ...)` as a semi/anti join against the subquery
    fn membership(&mut self, negated: bool, expr: &Expr, query: &Query) -> SResult<String> {
        let key = self.expression(expr)?;
        let outer = self.state.variable.clone();

        self.query(query)?;
        let inner = self.state.variable.clone();
        let column = first_column(query).ok_or_else(|| error("subquery returns no column"))?;

        let kind = if negated { "leftanti" } else { "leftsemi" };
        self.assign(format!(
            "{}.join({}, {} === {}({}), {})",
            outer,
            inner,
            key,
            inner,
            scala_string(&column),
            scala_string(kind)
        ));
        Ok(String::new())
    }

    fn logical(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> SResult<String> {
        let base = self.state.variable.clone();
        let l = self.expression(left)?;
        let left_frame = self.state.variable.clone();
        self.state.variable = base.clone();
        let r = self.expression(right)?;
        let right_frame = self.state.variable.clone();

        let combine = |first: &str, second: &str| match op {
            BinaryOp::Or => format!("{}.unionAll({}).dropDuplicates()", first, second),
            _ => format!("{}.intersect({})", first, second),
        };

        match (l.is_empty(), r.is_empty()) {
            (false, false) => {
                let symbol = if op == BinaryOp::Or { "||" } else { "&&" };
                Ok(format!("({} {} {})", l, symbol, r))
            }
            (true, true) => {
                self.assign(combine(&left_frame, &right_frame));
                Ok(String::new())
            }
            (true, false) => {
                let filtered = format!("{}.filter({})", base, r);
                self.assign(combine(&left_frame, &filtered));
                Ok(String::new())
            }
            (false, true) => {
                let filtered = format!("{}.filter({})", base, l);
                self.assign(combine(&right_frame, &filtered));
                Ok(String::new())
            }
        }
    }
}

impl Compiler for SparkCompiler {
    fn run(&mut self, query: &str, options: &Options) -> SResult<Value> {
        let request = self.compile(query, Some(options))?;
        let url = format!("http://{}{}", self.host_port, EXECUTE_PATH);
        debug!(%url, converter = self.state.converter.name(), "submitting spark program");

        let body = reqwest::blocking::Client::new()
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(request)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.text())
            .map_err(|e| {
                error!(%url, error = %e, "spark request failed");
                NsqlError::SparkComm(e.to_string())
            })?;

        let response: ExecuteResponse =
            serde_json::from_str(&body).map_err(|e| error(e.to_string()))?;
        if !response.error_descr.is_empty() {
            error!(status = %response.status, error = %response.error_descr, "spark execution failed");
            return Err(NsqlError::SparkData(response.error_descr));
        }
        decode_result(&response.result, self.state.converter, options.return_typed)
    }
}

/// Turn the service's `Result` document into a script value
fn decode_result(raw: &str, converter: Converter, typed: bool) -> SResult<Value> {
    let document: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| error(e.to_string()))?;

    let mut object = match document {
        serde_json::Value::Number(n) if converter == Converter::Number => {
            let mut scalar = BTreeMap::new();
            scalar.insert("type".to_string(), Value::from("int"));
            scalar.insert("value".to_string(), Value::String(n.to_string()));
            return Ok(Value::Map(scalar));
        }
        serde_json::Value::Object(object) => object,
        _ => return Err(error("unexpected result document")),
    };

    let types: Vec<String> = match object.get("types") {
        Some(serde_json::Value::Array(types)) => types
            .iter()
            .map(|t| t.as_str().unwrap_or_default().to_string())
            .collect(),
        _ => Vec::new(),
    };
    let raw_rows = match object.remove("rows") {
        Some(serde_json::Value::Array(rows)) => rows,
        _ => Vec::new(),
    };

    let mut rows = Vec::with_capacity(raw_rows.len());
    for raw_row in &raw_rows {
        let cells = raw_row.as_array().map(Vec::as_slice).unwrap_or_default();
        let mut row = Vec::with_capacity(cells.len());
        for (i, cell) in cells.iter().enumerate() {
            let internal_type = types
                .get(i)
                .ok_or_else(|| error(format!("no type for column {}", i)))?;
            let data = string_to_data(cell.as_str().unwrap_or_default(), internal_type)
                .map_err(|e| match e {
                    NsqlError::Module(msg) => error(msg),
                    other => other,
                })?;
            row.push(if typed {
                data
            } else {
                Value::String(data_to_string(&data, internal_type))
            });
        }
        rows.push(Value::List(row));
    }

    let mut result: BTreeMap<String, Value> =
        object.into_iter().map(|(k, v)| (k, Value::from(v))).collect();
    result.insert("rows".to_string(), Value::List(rows));
    Ok(Value::Map(result))
}

fn first_column(query: &Query) -> Option<String> {
    match query {
        Query::Select(select) => select.output_columns().into_iter().next(),
        Query::Compound { left, .. } => first_column(left),
    }
}

fn literal(lit: &Literal) -> SResult<String> {
    Ok(match lit {
        Literal::String(s) | Literal::Uuid(s) => format!("lit({})", scala_string(s)),
        Literal::Timestamp(s) => format!("lit(java.sql.Timestamp.valueOf({}))", scala_string(s)),
        Literal::Date(s) => format!("lit(java.sql.Date.valueOf({}))", scala_string(s)),
        Literal::Time(s) => format!(
            "lit(java.sql.Time.valueOf({}).getTime() * 1000000L)",
            scala_string(s)
        ),
        Literal::Interval { negative, text } => {
            let interval = format!("expr({})", scala_string(text));
            if *negative {
                format!("(- {})", interval)
            } else {
                interval
            }
        }
        Literal::Binary(bytes) => format!("unhex(lit({}))", scala_string(&hex::encode(bytes))),
        Literal::Collection(_) => return Err(error("collection literals are not supported")),
        Literal::Integer(_) | Literal::Float(_) | Literal::Boolean(_) | Literal::Null => {
            format!("lit({})", lit.text())
        }
    })
}

fn scala_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiler() -> SparkCompiler {
        SparkCompiler::new(
            "0.0.0.0:0",
            Source {
                protocol: CASSANDRA.to_string(),
                host: "0.0.0.0".to_string(),
                port: "0".to_string(),
                ..Source::default()
            },
        )
    }

    fn options() -> Options {
        Options {
            cassandra_fetch_limit: 100,
            ..Options::default()
        }
    }

    /// Compile and return (converter, program)
    fn program(query: &str) -> (String, String) {
        let request = compiler().compile(query, Some(&options())).unwrap();
        let request: serde_json::Value = serde_json::from_str(&request).unwrap();
        assert_eq!(request["limit"], 0);
        (
            request["converter"].as_str().unwrap().to_string(),
            request["statements"].as_str().unwrap().to_string(),
        )
    }

    #[test]
    fn test_compile_errors() {
        let mut spark = compiler();
        let cases = vec![
            ("SELECT * FROM devicetxn.battery_history", "nsQL syntax error"),
            (
                "INSERT INTO devicetxn.battery_history (imsi) VALUES (5);",
                "nsQL spark transcompiler error: unsupported statement type",
            ),
            (
                "SELECT * FROM battery_history;",
                "nsQL spark transcompiler error: keyspace missing for table battery_history",
            ),
        ];
        for (query, expected) in cases {
            let err = spark.compile(query, Some(&options())).unwrap_err();
            assert!(err.to_string().starts_with(expected), "{}: {}", query, err);
        }

        let err = spark
            .compile("SELECT * FROM devicetxn.battery_history;", None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "nsQL spark transcompiler error: mandatory options missing"
        );
    }

    #[test]
    fn test_supported_queries_compile() {
        let queries = vec![
            "SELECT TCOUNT() FROM devicetxn.battery_history;",
            "SELECT bh.imsi FROM devicetxn.battery_history as bh;",
            "SELECT bh1.imsi FROM devicetxn.battery_history as bh1 JOIN devicetxn.battery_history as bh2;",
            "SELECT DISTINCT imsi as id FROM devicetxn.battery_history WHERE battery_level > 0;",
            "SELECT count(imsi) as countid FROM devicetxn.battery_history GROUP BY imsi as id HAVING id > 0;",
            "SELECT imsi, battery_level FROM devicetxn.battery_history ORDER BY imsi LIMIT 5;",
            "(SELECT battery_level FROM devicetxn.battery_history) UNION (SELECT battery_level FROM \
             devicetxn.battery_history) UNION ALL (SELECT battery_level FROM devicetxn.battery_history) \
             INTERSECT(SELECT battery_level FROM devicetxn.battery_history);",
            "SELECT bh1.imsi FROM devicetxn.battery_history as bh1 OUTER JOIN devicetxn.battery_history as bh2 \
             ON bh1.imsi=bh1.imsi;",
            "SELECT bh1.imsi FROM devicetxn.battery_history as bh1 LEFT JOIN devicetxn.battery_history as bh2 \
             ON bh1.imsi=bh1.imsi;",
            "SELECT bh1.imsi FROM devicetxn.battery_history as bh1 LEFT SEMI JOIN devicetxn.battery_history as \
             bh2 ON bh1.imsi=bh1.imsi;",
            "SELECT bh1.imsi FROM (SELECT imsi FROM devicetxn.battery_history) as bh1;",
            "SELECT imsi FROM devicetxn.battery_history WHERE (msg_type = 'RetMsgLost' and event_time < \
             '2017-02-14 21:19:30' - 'INTERVAL 1 DAY') or msg_type = 'RetMsgInitial';",
            "SELECT TCORR(battery_level, current_voltage) FROM devicetxn.battery_history;",
            "SELECT TCOV(battery_level, current_voltage) FROM devicetxn.battery_history;",
            "SELECT MIN(battery_level) FROM devicetxn.battery_history;",
            "SELECT DAY(event_time), JSON_FETCH(msg_type, 'lost'), MAP_BLOB_JSON_FETCH(msg_type, 'lost', 'time'), \
             NOW() FROM devicetxn.battery_history;",
            "SELECT original_voltage - current_voltage, battery_level - 10, event_time + -'INTERVAL 1 DAY'\
             FROM devicetxn.battery_history;",
            "SELECT battery_level FROM devicetxn.battery_history WHERE imsi IN (SELECT imsi FROM \
             devicetxn.battery_history) and imsi NOT IN (SELECT imsi FROM devicetxn.battery_history) and imsi IS \
             NULL and imsi IS NOT NULL and imsi != 5;",
            "SELECT battery_level FROM devicetxn.battery_history WHERE imsi IN (SELECT imsi FROM \
             devicetxn.battery_history) or imsi NOT IN (SELECT imsi FROM devicetxn.battery_history) and imsi IS \
             NULL and imsi IS NOT NULL or imsi != 5;",
            "SELECT battery_level FROM devicetxn.battery_history WHERE imsi IN (SELECT imsi FROM \
             devicetxn.battery_history) or imsi IS NULL;",
            "SELECT battery_level FROM devicetxn.battery_history WHERE imsi IS NULL or imsi IN (SELECT imsi FROM \
             devicetxn.battery_history);",
            "SELECT battery_level FROM devicetxn.battery_history WHERE imsi IS NULL and imsi IN (SELECT imsi FROM \
             devicetxn.battery_history);",
        ];
        for query in queries {
            let mut spark = compiler();
            assert!(spark.compile(query, Some(&options())).is_ok(), "{}", query);
            assert!(spark.compile(query, Some(&Options::default())).is_ok(), "{}", query);
        }
    }

    #[test]
    fn test_program_fragments() {
        let cases = vec![
            (
                "SELECT TCOUNT() FROM devicetxn.battery_history;",
                "number",
                vec![
                    "import org.apache.spark.sql.functions._;",
                    "sqlContext.setConf(\"ClusterOne/spark.cassandra.connection.host\", \"0.0.0.0\");",
                    "\"keyspace\" -> \"devicetxn\", \"table\" -> \"battery_history\")).load().limit(100).cache();",
                    "df1.count();",
                    "var df2 = df1.count();",
                ],
            ),
            (
                "SELECT TCORR(battery_level, current_voltage) FROM devicetxn.battery_history;",
                "number",
                vec!["var df2 = df1.stat.corr(\"battery_level\", \"current_voltage\");"],
            ),
            (
                "SELECT DISTINCT imsi as id FROM devicetxn.battery_history WHERE battery_level > 0;",
                "dataframe",
                vec![
                    "var df2 = df1.filter(df1(\"battery_level\") > lit(0));",
                    "var df3 = df2.select(df2(\"imsi\").as(\"id\")).dropDuplicates();",
                ],
            ),
            (
                "SELECT count(imsi) as countid FROM devicetxn.battery_history GROUP BY imsi as id HAVING id > 0;",
                "dataframe",
                vec![
                    "var df2 = df1.groupBy(df1(\"imsi\").as(\"id\")).agg(count(df1(\"imsi\")).as(\"countid\"));",
                    "var df3 = df2.filter(df2(\"id\") > lit(0));",
                ],
            ),
            (
                "SELECT imsi FROM devicetxn.battery_history ORDER BY imsi DESC LIMIT 5;",
                "dataframe",
                vec![
                    "var df3 = df2.orderBy(df2(\"imsi\").desc);",
                    "var df4 = df3.limit(5);",
                ],
            ),
            (
                "SELECT bh1.imsi FROM devicetxn.battery_history as bh1 LEFT SEMI JOIN devicetxn.battery_history as \
                 bh2 ON bh1.imsi=bh2.imsi;",
                "dataframe",
                vec!["var df3 = df1.join(df2, df1(\"imsi\") === df2(\"imsi\"), \"leftsemi\");"],
            ),
            (
                "SELECT battery_level FROM devicetxn.battery_history WHERE imsi NOT IN (SELECT imsi FROM \
                 devicetxn.battery_history);",
                "dataframe",
                vec![
                    "var df3 = df2.select(df2(\"imsi\"));",
                    "var df4 = df1.join(df3, df1(\"imsi\") === df3(\"imsi\"), \"leftanti\");",
                    "var df5 = df4.select(df4(\"battery_level\"));",
                ],
            ),
            (
                "SELECT battery_level FROM devicetxn.battery_history WHERE imsi IS NULL or imsi IN (SELECT imsi FROM \
                 devicetxn.battery_history);",
                "dataframe",
                vec!["var df5 = df4.unionAll(df1.filter(df1(\"imsi\").isNull)).dropDuplicates();"],
            ),
            (
                "SELECT imsi FROM devicetxn.battery_history WHERE msg_type = 'a' or msg_type != 'b';",
                "dataframe",
                vec!["df1.filter((df1(\"msg_type\") === lit(\"a\") || df1(\"msg_type\") =!= lit(\"b\")));"],
            ),
        ];
        for (query, converter, fragments) in cases {
            let (actual_converter, code) = program(query);
            assert_eq!(actual_converter, converter, "{}", query);
            for fragment in fragments {
                assert!(code.contains(fragment), "{}\nmissing {}\nin {}", query, fragment, code);
            }
        }
    }

    #[test]
    fn test_udfs_emitted_once() {
        let (_, code) = program(
            "SELECT JSON_FETCH(msg_type, 'lost'), JSON_FETCH(msg_type, 'found'), \
             SUBTRACT_TIMESTAMPS(event_time, event_time) FROM devicetxn.battery_history;",
        );
        assert_eq!(code.matches("var json_fetch = udf").count(), 1);
        assert_eq!(code.matches("var subtract_timestamps = udf").count(), 1);
        assert!(!code.contains("map_blob_json_fetch"));
        assert!(code.contains("json_fetch(df1(\"msg_type\"), lit(\"found\"))"));
    }

    #[test]
    fn test_set_operations() {
        let (_, code) = program(
            "(SELECT imsi FROM ks.a) UNION (SELECT imsi FROM ks.b) UNION ALL (SELECT imsi FROM ks.c);",
        );
        assert!(code.contains("var df5 = df2.unionAll(df4).dropDuplicates();"));
        assert!(code.contains("var df8 = df5.unionAll(df7);"));
    }

    #[test]
    fn test_unreachable_service() {
        let err = compiler()
            .run("SELECT * FROM devicetxn.battery_history;", &options())
            .unwrap_err();
        assert!(matches!(err, NsqlError::SparkComm(_)), "{:?}", err);
    }

    #[test]
    fn test_decode_result() {
        let raw = r#"{"types":["int","string","bool"],"rows":[["5","\"abc\"","true"],["","\"\"","false"]]}"#;

        let typed = decode_result(raw, Converter::Dataframe, true).unwrap();
        let rows = typed.get("rows").unwrap();
        assert_eq!(
            rows,
            &Value::List(vec![
                Value::List(vec![Value::Int(5), Value::from("abc"), Value::Bool(true)]),
                Value::List(vec![Value::Int(0), Value::from(""), Value::Bool(false)]),
            ])
        );
        assert!(typed.get("types").is_some());

        let strings = decode_result(raw, Converter::Dataframe, false).unwrap();
        assert_eq!(
            strings.get("rows").unwrap(),
            &Value::List(vec![
                Value::List(vec![Value::from("5"), Value::from("abc"), Value::from("true")]),
                Value::List(vec![Value::from("0"), Value::from(""), Value::from("false")]),
            ])
        );

        let count = decode_result("42", Converter::Number, false).unwrap();
        assert_eq!(count.get("value"), Some(&Value::from("42")));

        let err = decode_result(r#"{"types":["int"],"rows":[["x"]]}"#, Converter::Dataframe, true)
            .unwrap_err();
        assert!(err.to_string().starts_with("nsQL spark transcompiler error: x"));
    }
}
