//! `nsOutput`: captured stdout and structured result documents
//!
//! Printing appends to a per-invocation buffer guarded by a rolling byte
//! budget. Structured helpers render `{"type": <mime>, "content": ...}`
//! documents, either returned to the script or stored as the invocation
//! result by the `*Direct` variants.

use std::sync::Arc;

use mlua::{FromLua, Lua, Table, Value as LuaValue, Variadic};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::stats::MetricsSink;
use crate::value::{data_to_string, lenient_string, Value, STRING};

pub const VALUE_MIME: &str = "application/vnd.vz.value";
pub const TABLE_MIME: &str = "application/vnd.vz.table";
pub const MAP_MIME: &str = "application/vnd.vz.map";
pub const HTML_MIME: &str = "text/html";

const ERROR_PREFIX: &str = "nsOutput error: ";

/// Captured output of one invocation
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    limit: usize,
    rolling: usize,
    stdout: Vec<String>,
    result: String,
}

/// Output buffer shared between the module callbacks and the interpreter state
pub type SharedOutput = Arc<Mutex<OutputBuffer>>;

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        OutputBuffer {
            limit,
            rolling: limit,
            stdout: Vec::new(),
            result: String::new(),
        }
    }

    pub fn shared(limit: usize) -> SharedOutput {
        Arc::new(Mutex::new(OutputBuffer::new(limit)))
    }

    /// Append to stdout, failing once the byte budget would go negative
    pub fn append(&mut self, out: String) -> Result<(), String> {
        if out.len() > self.rolling {
            return Err(format!("{}-byte stdout limit is exceeded", self.limit));
        }
        self.rolling -= out.len();
        self.stdout.push(out);
        Ok(())
    }

    pub fn stdout(&self) -> String {
        self.stdout.concat()
    }

    pub fn result(&self) -> &str {
        &self.result
    }

    pub fn set_result(&mut self, result: String) {
        self.result = result;
    }

    pub fn remaining(&self) -> usize {
        self.rolling
    }

    /// Restore the budget and drop everything captured so far
    pub fn reset(&mut self) {
        self.rolling = self.limit;
        self.stdout.clear();
        self.result.clear();
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ValueDoc {
    #[serde(rename = "type", deserialize_with = "lenient_string")]
    kind: String,
    #[serde(deserialize_with = "lenient_string")]
    value: String,
    #[serde(deserialize_with = "lenient_string")]
    semantic: String,
    #[serde(deserialize_with = "lenient_string")]
    background: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TableDoc {
    columns: Option<Vec<String>>,
    types: Option<Vec<String>>,
    rows: Option<Vec<Vec<Value>>>,
}

#[derive(Debug, Serialize)]
struct TableContent {
    columns: Option<Vec<String>>,
    types: Option<Vec<String>>,
    rows: Vec<Vec<String>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Location {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Item {
    #[serde(deserialize_with = "lenient_string")]
    label: String,
    locations: Vec<Location>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct MapDoc {
    #[serde(rename = "type", deserialize_with = "lenient_string")]
    kind: String,
    center: Option<Location>,
    zoom: i64,
    items: Vec<Item>,
}

#[derive(Serialize)]
struct Document<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    content: T,
}

/// Render one output document, newline terminated
fn document<T: Serialize>(mime: &str, content: T) -> Result<String, String> {
    let mut out = serde_json::to_string(&Document {
        kind: mime,
        content,
    })
    .map_err(|e| e.to_string())?;
    out.push('\n');
    Ok(out)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, String> {
    serde_json::from_value(value.into()).map_err(|e| e.to_string())
}

pub fn value_document(value: Value) -> Result<String, String> {
    document(VALUE_MIME, decode::<ValueDoc>(value)?)
}

pub fn table_document(value: Value) -> Result<String, String> {
    let table: TableDoc = decode(value)?;
    let types = table.types;
    let rows = table
        .rows
        .unwrap_or_default()
        .iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(j, cell)| {
                    let ty = types
                        .as_ref()
                        .and_then(|t| t.get(j))
                        .map(String::as_str)
                        .unwrap_or(STRING);
                    data_to_string(cell, ty)
                })
                .collect()
        })
        .collect();
    document(
        TABLE_MIME,
        TableContent {
            columns: table.columns,
            types,
            rows,
        },
    )
}

pub fn map_document(value: Value) -> Result<String, String> {
    document(MAP_MIME, decode::<MapDoc>(value)?)
}

pub fn html_document(html: &str) -> Result<String, String> {
    document(HTML_MIME, html)
}

/// Header line plus one comma separated line per row
pub fn table_to_csv(value: Value) -> Result<String, String> {
    let table: TableDoc = decode(value)?;
    let (columns, rows) = match (table.columns, table.rows) {
        (Some(columns), Some(rows)) => (columns, rows),
        _ => return Err("malformed input table".to_string()),
    };

    let mut lines = vec![columns.join(",")];
    for row in rows {
        let fields: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        lines.push(fields.join(","));
    }
    Ok(lines.join("\n"))
}

/// Operands joined with a space unless either side is a string
pub fn sprint(args: &[Value]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 && !matches!(arg, Value::String(_)) && !matches!(args[i - 1], Value::String(_)) {
            out.push(' ');
        }
        out.push_str(&arg.to_string());
    }
    out
}

/// printf-style formatting with `%v %s %d %i %f %.Nf %q %x %X %t %%`
pub fn sprintf(format: &str, args: &[Value]) -> String {
    let mut out = String::new();
    let mut args = args.iter();
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut digits = String::new();
            while let Some(&d) = chars.peek() {
                if !d.is_ascii_digit() {
                    break;
                }
                digits.push(d);
                chars.next();
            }
            precision = Some(digits.parse::<usize>().unwrap_or(0));
        }

        let verb = match chars.next() {
            Some(v) => v,
            None => {
                out.push_str("%!(NOVERB)");
                break;
            }
        };
        if verb == '%' {
            out.push('%');
            continue;
        }

        match args.next() {
            Some(arg) => out.push_str(&format_verb(verb, precision, arg)),
            None => out.push_str(&format!("%!{}(MISSING)", verb)),
        }
    }
    out
}

fn format_verb(verb: char, precision: Option<usize>, arg: &Value) -> String {
    let bad = || format!("%!{}({})", verb, arg);
    match verb {
        'v' | 's' => arg.to_string(),
        'd' | 'i' => match arg {
            Value::Int(i) => i.to_string(),
            Value::Float(f) => (*f as i64).to_string(),
            _ => bad(),
        },
        'f' => match arg.as_f64() {
            Some(f) => format!("{:.*}", precision.unwrap_or(6), f),
            None => bad(),
        },
        'q' => match arg {
            Value::String(s) => format!("{:?}", s),
            other => format!("{:?}", other.to_string()),
        },
        'x' | 'X' => {
            let text = match arg {
                Value::Int(i) => format!("{:x}", i),
                Value::Float(f) if f.fract() == 0.0 => format!("{:x}", *f as i64),
                Value::String(s) => hex::encode(s.as_bytes()),
                Value::Bytes(b) => hex::encode(b),
                _ => return bad(),
            };
            if verb == 'X' {
                text.to_uppercase()
            } else {
                text
            }
        }
        't' => match arg {
            Value::Bool(b) => b.to_string(),
            _ => bad(),
        },
        _ => bad(),
    }
}

fn values(lua: &Lua, args: Variadic<LuaValue>) -> mlua::Result<Vec<Value>> {
    args.into_iter().map(|v| Value::from_lua(v, lua)).collect()
}

fn abort(metrics: &dyn MetricsSink, api: &str, msg: String) -> mlua::Error {
    metrics.incr(&format!("nsOutput.{}.error", api));
    mlua::Error::RuntimeError(format!("{}{}", ERROR_PREFIX, msg))
}

/// Build the `nsOutput` module table over `output`
pub fn module(lua: &Lua, output: SharedOutput, metrics: Arc<dyn MetricsSink>) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    {
        let output = Arc::clone(&output);
        let metrics = Arc::clone(&metrics);
        table.set(
            "print",
            lua.create_function(move |lua, args: Variadic<LuaValue>| {
                let out = sprint(&values(lua, args)?);
                output
                    .lock()
                    .append(out)
                    .map_err(|e| abort(metrics.as_ref(), "print", e))?;
                metrics.incr("nsOutput.print");
                Ok(())
            })?,
        )?;
    }

    {
        let output = Arc::clone(&output);
        let metrics = Arc::clone(&metrics);
        table.set(
            "printf",
            lua.create_function(move |lua, args: Variadic<LuaValue>| {
                let args = values(lua, args)?;
                let format = match args.first() {
                    None => {
                        return Err(abort(
                            metrics.as_ref(),
                            "printf",
                            "printf requires at least one argument".to_string(),
                        ))
                    }
                    Some(Value::String(format)) => format.clone(),
                    Some(_) => {
                        return Err(abort(
                            metrics.as_ref(),
                            "printf",
                            "first argument of printf must be a string".to_string(),
                        ))
                    }
                };
                let out = sprintf(&format, &args[1..]);
                output
                    .lock()
                    .append(out)
                    .map_err(|e| abort(metrics.as_ref(), "printf", e))?;
                metrics.incr("nsOutput.printf");
                Ok(())
            })?,
        )?;
    }

    let documents: [(&str, fn(Value) -> Result<String, String>); 3] = [
        ("value", value_document),
        ("table", table_document),
        ("map", map_document),
    ];
    for (name, render) in documents {
        let m = Arc::clone(&metrics);
        table.set(
            name,
            lua.create_function(move |lua, data: Table| {
                let value = Value::from_lua(LuaValue::Table(data), lua)?;
                Ok(returned(m.as_ref(), name, render(value)))
            })?,
        )?;

        let direct = format!("{}Direct", name);
        let m = Arc::clone(&metrics);
        let out = Arc::clone(&output);
        let counter = direct.clone();
        table.set(
            direct.as_str(),
            lua.create_function(move |lua, data: Table| {
                let value = Value::from_lua(LuaValue::Table(data), lua)?;
                Ok(stored(&out, m.as_ref(), &counter, render(value)))
            })?,
        )?;
    }

    {
        let m = Arc::clone(&metrics);
        table.set(
            "html",
            lua.create_function(move |_, html: String| {
                Ok(returned(m.as_ref(), "html", html_document(&html)))
            })?,
        )?;
    }

    {
        let m = Arc::clone(&metrics);
        let out = Arc::clone(&output);
        table.set(
            "htmlDirect",
            lua.create_function(move |_, html: String| {
                Ok(stored(&out, m.as_ref(), "htmlDirect", html_document(&html)))
            })?,
        )?;
    }

    {
        let m = Arc::clone(&metrics);
        table.set(
            "tableToCsv",
            lua.create_function(move |lua, data: Table| {
                let value = Value::from_lua(LuaValue::Table(data), lua)?;
                Ok(returned(m.as_ref(), "tableToCsv", table_to_csv(value)))
            })?,
        )?;
    }

    Ok(table)
}

/// `document` or `(nil, error)`
fn returned(
    metrics: &dyn MetricsSink,
    api: &str,
    rendered: Result<String, String>,
) -> (Option<String>, Option<String>) {
    match rendered {
        Ok(doc) => {
            metrics.incr(&format!("nsOutput.{}", api));
            (Some(doc), None)
        }
        Err(e) => {
            metrics.incr(&format!("nsOutput.{}.error", api));
            (None, Some(format!("{}{}", ERROR_PREFIX, e)))
        }
    }
}

/// Store the document as the invocation result, returning only an error
fn stored(
    output: &SharedOutput,
    metrics: &dyn MetricsSink,
    api: &str,
    rendered: Result<String, String>,
) -> Option<String> {
    match rendered {
        Ok(doc) => {
            metrics.incr(&format!("nsOutput.{}", api));
            output.lock().set_result(doc);
            None
        }
        Err(e) => {
            metrics.incr(&format!("nsOutput.{}.error", api));
            Some(format!("{}{}", ERROR_PREFIX, e))
        }
    }
}
