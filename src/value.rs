//! Dynamic values shared by the sandbox, invocation arguments and query results
//!
//! `Value` is the one closed representation of "anything a script can hand us
//! or get back". It converts to and from Lua values, to and from JSON, and to
//! and from the string wire form used when results cross process boundaries.
//!
//! Internal type names used by the wire codec:
//! `bool`, `int`, `double`, `string`, `blob`, `time`, `array[T]`, `map[K]V`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use mlua::{FromLua, IntoLua, Lua, Value as LuaValue};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::NsqlError;

pub const BOOLEAN: &str = "bool";
pub const INTEGER: &str = "int";
pub const DOUBLE: &str = "double";
pub const STRING: &str = "string";
pub const BLOB: &str = "blob";
pub const TIME: &str = "time";
pub const ARRAY: &str = "array[";
pub const MAP: &str = "map[";

/// Tagged union of every value the runtime moves around
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Field of a map value
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            _ => None,
        }
    }

    /// Internal type name describing this value
    pub fn internal_type(&self) -> String {
        match self {
            Value::Null | Value::String(_) => STRING.to_string(),
            Value::Bool(_) => BOOLEAN.to_string(),
            Value::Int(_) => INTEGER.to_string(),
            Value::Float(_) => DOUBLE.to_string(),
            Value::Bytes(_) => BLOB.to_string(),
            Value::Timestamp(_) => TIME.to_string(),
            Value::List(items) => {
                let elem = items
                    .first()
                    .map(|v| v.internal_type())
                    .unwrap_or_else(|| STRING.to_string());
                format!("{}{}]", ARRAY, elem)
            }
            Value::Map(m) => {
                let elem = m
                    .values()
                    .next()
                    .map(|v| v.internal_type())
                    .unwrap_or_else(|| STRING.to_string());
                format!("{}{}]{}", MAP, STRING, elem)
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", data_to_string(self, &self.internal_type()))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

// JSON conversions

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Map(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Bytes(b) => serde_json::Value::Array(b.into_iter().map(Into::into).collect()),
            Value::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Map(m) => {
                serde_json::Value::Object(m.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

// Lua bridge

impl FromLua for Value {
    fn from_lua(value: LuaValue, lua: &Lua) -> mlua::Result<Self> {
        match value {
            LuaValue::Nil => Ok(Value::Null),
            LuaValue::Boolean(b) => Ok(Value::Bool(b)),
            LuaValue::Integer(i) => Ok(Value::Int(i)),
            LuaValue::Number(n) => Ok(Value::Float(n)),
            LuaValue::String(s) => match s.to_str() {
                Ok(text) => Ok(Value::String(text.to_string())),
                Err(_) => Ok(Value::Bytes(s.as_bytes().to_vec())),
            },
            LuaValue::Table(table) => {
                let len = table.raw_len();
                let mut pairs = 0usize;
                for pair in table.clone().pairs::<LuaValue, LuaValue>() {
                    pair?;
                    pairs += 1;
                }

                if len > 0 && pairs == len {
                    let mut items = Vec::with_capacity(len);
                    for item in table.sequence_values::<LuaValue>() {
                        items.push(Value::from_lua(item?, lua)?);
                    }
                    return Ok(Value::List(items));
                }

                let mut map = BTreeMap::new();
                for pair in table.pairs::<LuaValue, LuaValue>() {
                    let (k, v) = pair?;
                    let key = match k {
                        LuaValue::String(s) => s.to_string_lossy().to_string(),
                        LuaValue::Integer(i) => i.to_string(),
                        LuaValue::Number(n) => n.to_string(),
                        LuaValue::Boolean(b) => b.to_string(),
                        other => {
                            return Err(mlua::Error::RuntimeError(format!(
                                "unsupported table key of type {}",
                                other.type_name()
                            )))
                        }
                    };
                    map.insert(key, Value::from_lua(v, lua)?);
                }
                Ok(Value::Map(map))
            }
            other => Err(mlua::Error::RuntimeError(format!(
                "unknown Lua type {}",
                other.type_name()
            ))),
        }
    }
}

impl IntoLua for Value {
    fn into_lua(self, lua: &Lua) -> mlua::Result<LuaValue> {
        match self {
            Value::Null => Ok(LuaValue::Nil),
            Value::Bool(b) => Ok(LuaValue::Boolean(b)),
            Value::Int(i) => Ok(LuaValue::Integer(i)),
            Value::Float(f) => Ok(LuaValue::Number(f)),
            Value::String(s) => Ok(LuaValue::String(lua.create_string(&s)?)),
            Value::Bytes(bytes) => {
                let table = lua.create_table_with_capacity(bytes.len(), 0)?;
                for b in bytes {
                    table.raw_push(b as i64)?;
                }
                Ok(LuaValue::Table(table))
            }
            Value::Timestamp(t) => Ok(LuaValue::Integer(t.timestamp())),
            Value::List(items) => {
                let table = lua.create_table_with_capacity(items.len(), 0)?;
                for item in items {
                    table.raw_push(item.into_lua(lua)?)?;
                }
                Ok(LuaValue::Table(table))
            }
            Value::Map(map) => {
                let table = lua.create_table_with_capacity(0, map.len())?;
                for (k, v) in map {
                    table.raw_set(k, v.into_lua(lua)?)?;
                }
                Ok(LuaValue::Table(table))
            }
        }
    }
}

/// Deserialize any scalar as its string form, null as empty
pub fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Render a value in its wire string form for the given internal type
pub fn data_to_string(value: &Value, internal_type: &str) -> String {
    if let Value::String(s) = value {
        return s.clone();
    }

    match internal_type {
        TIME => {
            let t = match value {
                Value::Timestamp(t) => Some(*t),
                Value::Int(secs) => Utc.timestamp_opt(*secs, 0).single(),
                Value::Float(secs) => Utc.timestamp_opt(*secs as i64, 0).single(),
                _ => None,
            };
            match t {
                Some(t) if t.timestamp() >= 0 => t.format("%Y-%m-%d %H:%M:%S").to_string(),
                _ => String::new(),
            }
        }
        BLOB => {
            let blob: Vec<u8> = match value {
                Value::Bytes(b) => b.clone(),
                Value::List(items) => items
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as u8)
                    .collect(),
                _ => Vec::new(),
            };
            if blob.is_empty() {
                String::new()
            } else {
                format!("0x{}", hex::encode(blob))
            }
        }
        t if t.starts_with(ARRAY) && t.ends_with(']') => {
            let elem_type = &t[ARRAY.len()..t.len() - 1];
            match value {
                Value::List(items) => {
                    let parts: Vec<String> =
                        items.iter().map(|v| data_to_string(v, elem_type)).collect();
                    format!("[{}]", parts.join(" "))
                }
                other => plain(other),
            }
        }
        t if t.starts_with(MAP) => {
            let (key_type, elem_type) = split_map_type(t);
            match value {
                Value::Map(m) => {
                    let mut parts: Vec<(String, String)> = m
                        .iter()
                        .map(|(k, v)| {
                            (
                                data_to_string(&Value::String(k.clone()), key_type),
                                data_to_string(v, elem_type),
                            )
                        })
                        .collect();
                    parts.sort();
                    let body: Vec<String> =
                        parts.into_iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
                    format!("map[{}]", body.join(" "))
                }
                other => plain(other),
            }
        }
        INTEGER => match value {
            Value::Float(f) => (*f as i64).to_string(),
            other => plain(other),
        },
        _ => plain(value),
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => s.clone(),
        Value::Bytes(b) => {
            let parts: Vec<String> = b.iter().map(|x| x.to_string()).collect();
            format!("[{}]", parts.join(" "))
        }
        Value::Timestamp(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        other => data_to_string(other, &other.internal_type()),
    }
}

/// Split `map[K]V` into `(K, V)` honouring nested brackets
fn split_map_type(t: &str) -> (&str, &str) {
    let rest = &t[MAP.len()..];
    let mut depth = 1;
    for (i, c) in rest.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return (&rest[..i], &rest[i + 1..]);
                }
            }
            _ => {}
        }
    }
    (rest, "")
}

/// Decode a wire string into a typed value
pub fn string_to_data(s: &str, internal_type: &str) -> Result<Value, NsqlError> {
    match internal_type {
        BOOLEAN => Ok(Value::Bool(s == "true")),
        INTEGER => {
            if s.is_empty() {
                return Ok(Value::Int(0));
            }
            s.parse::<i64>()
                .map(Value::Int)
                .map_err(|e| NsqlError::module(format!("{}: {}", s, e)))
        }
        DOUBLE => {
            if s.is_empty() {
                return Ok(Value::Float(0.0));
            }
            s.parse::<f64>()
                .map(Value::Float)
                .map_err(|e| NsqlError::module(format!("{}: {}", s, e)))
        }
        TIME => {
            if s.is_empty() {
                return Ok(Value::Null);
            }
            let inner = strip_quotes(s);
            parse_time(inner)
                .map(Value::Timestamp)
                .ok_or_else(|| NsqlError::module(format!("cannot parse time {}", s)))
        }
        BLOB => {
            if s.is_empty() {
                return Ok(Value::Bytes(Vec::new()));
            }
            let digits = s.strip_prefix("0x").unwrap_or(s);
            hex::decode(digits)
                .map(Value::Bytes)
                .map_err(|e| NsqlError::module(e.to_string()))
        }
        STRING => Ok(Value::String(strip_quotes(s).to_string())),
        t if t.starts_with(ARRAY) && t.ends_with(']') => {
            let elem_type = &t[ARRAY.len()..t.len() - 1];
            let body = s.trim();
            let body = body
                .strip_prefix('[')
                .and_then(|b| b.strip_suffix(']'))
                .unwrap_or(body)
                .trim();
            let mut rest = body;
            let mut items = Vec::new();
            while !rest.is_empty() {
                let (element, tail) = next_element(rest, elem_type);
                items.push(string_to_data(&element, elem_type)?);
                rest = tail;
            }
            Ok(Value::List(items))
        }
        t if t.starts_with(MAP) => {
            let (key_type, elem_type) = split_map_type(t);
            let body = s.trim();
            let body = body
                .strip_prefix("map[")
                .and_then(|b| b.strip_suffix(']'))
                .unwrap_or(body)
                .trim();
            let mut rest = body;
            let mut map = BTreeMap::new();
            while !rest.is_empty() {
                let (key, tail) = next_element(rest, key_type);
                let (element, tail) = next_element(tail, elem_type);
                let key = string_to_data(&key, key_type)?;
                map.insert(
                    data_to_string(&key, key_type),
                    string_to_data(&element, elem_type)?,
                );
                rest = tail;
            }
            Ok(Value::Map(map))
        }
        other => Err(NsqlError::module(format!("{} is unknown", other))),
    }
}

fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc())
}

/// Cut the next element of a collection body, returning it and the remainder
fn next_element<'a>(s: &'a str, elem_type: &str) -> (String, &'a str) {
    let s = s.trim_start_matches(|c: char| c.is_whitespace() || c == ':');
    if s.is_empty() {
        return (String::new(), "");
    }

    if elem_type.starts_with(ARRAY) || elem_type.starts_with(MAP) {
        let (list, rest) = next_list(s);
        let element = if elem_type.starts_with(ARRAY) {
            format!("[{}]", list)
        } else {
            format!("map[{}]", list)
        };
        return (element, rest);
    }

    if let Some(quoted) = s.strip_prefix('"') {
        return match quoted.find('"') {
            Some(end) => (format!("\"{}\"", &quoted[..end]), &quoted[end + 1..]),
            None => (format!("\"{}", quoted), ""),
        };
    }

    match s.find(|c: char| c == ':' || c == ' ') {
        Some(end) => (s[..end].to_string(), &s[end..]),
        None => (s.to_string(), ""),
    }
}

/// Contents of the first bracketed group and the text after it
fn next_list(s: &str) -> (&str, &str) {
    let mut start = None;
    let mut depth = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => {
                if start.is_none() {
                    start = Some(i + 1);
                }
                depth += 1;
            }
            ']' => {
                depth -= 1;
                if depth == 0 {
                    let from = start.unwrap_or(0);
                    return (&s[from..i], &s[i + 1..]);
                }
            }
            _ => {}
        }
    }
    (s, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_to_string() {
        let t = Utc.with_ymd_and_hms(2017, 3, 4, 5, 6, 7).unwrap();
        let mut m = BTreeMap::new();
        m.insert("b".to_string(), Value::Int(2));
        m.insert("a".to_string(), Value::Int(1));

        let cases = vec![
            (Value::from("text"), "string", "text"),
            (Value::Int(42), "int", "42"),
            (Value::Float(42.0), "int", "42"),
            (Value::Float(1.5), "double", "1.5"),
            (Value::Bool(true), "bool", "true"),
            (Value::Timestamp(t), "time", "2017-03-04 05:06:07"),
            (Value::Int(0), "time", "1970-01-01 00:00:00"),
            (Value::Bytes(vec![0, 10, 255]), "blob", "0x000aff"),
            (Value::Bytes(vec![]), "blob", ""),
            (
                Value::List(vec![Value::Int(1), Value::Int(2)]),
                "array[int]",
                "[1 2]",
            ),
            (Value::Map(m), "map[string]int", "map[a:1 b:2]"),
        ];

        for (value, ty, expected) in cases {
            assert_eq!(data_to_string(&value, ty), expected, "{:?} as {}", value, ty);
        }
    }

    #[test]
    fn test_string_to_data() {
        assert_eq!(string_to_data("true", "bool").unwrap(), Value::Bool(true));
        assert_eq!(string_to_data("", "int").unwrap(), Value::Int(0));
        assert_eq!(string_to_data("-7", "int").unwrap(), Value::Int(-7));
        assert_eq!(string_to_data("2.5", "double").unwrap(), Value::Float(2.5));
        assert_eq!(
            string_to_data("\"hello\"", "string").unwrap(),
            Value::from("hello")
        );
        assert_eq!(
            string_to_data("0x0a0b", "blob").unwrap(),
            Value::Bytes(vec![10, 11])
        );
        assert_eq!(
            string_to_data("\"2016-06-15 10:20:30.0\"", "time").unwrap(),
            Value::Timestamp(Utc.with_ymd_and_hms(2016, 6, 15, 10, 20, 30).unwrap())
        );
        assert_eq!(
            string_to_data("[1 2 3]", "array[int]").unwrap(),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            string_to_data("[\"a b\" \"c\"]", "array[string]").unwrap(),
            Value::List(vec![Value::from("a b"), Value::from("c")])
        );

        let decoded = string_to_data("map[x:1 y:2]", "map[string]int").unwrap();
        assert_eq!(decoded.get("x"), Some(&Value::Int(1)));
        assert_eq!(decoded.get("y"), Some(&Value::Int(2)));

        let nested = string_to_data("[[1 2] [3]]", "array[array[int]]").unwrap();
        assert_eq!(
            nested,
            Value::List(vec![
                Value::List(vec![Value::Int(1), Value::Int(2)]),
                Value::List(vec![Value::Int(3)]),
            ])
        );

        assert_eq!(
            string_to_data("x", "decimal").unwrap_err().to_string(),
            "nsQL error: decimal is unknown"
        );
    }

    #[test]
    fn test_internal_type() {
        assert_eq!(Value::Int(1).internal_type(), "int");
        assert_eq!(Value::Null.internal_type(), "string");
        assert_eq!(
            Value::List(vec![Value::Float(1.0)]).internal_type(),
            "array[double]"
        );
        let mut m = BTreeMap::new();
        m.insert("k".to_string(), Value::Bytes(vec![1]));
        assert_eq!(Value::Map(m).internal_type(), "map[string]blob");
    }

    #[test]
    fn test_lua_bridge() {
        let lua = Lua::new();
        let table: Value = lua
            .load(r#"return { name = "x", n = 3, f = 1.5, list = {1, 2, 3}, flag = true }"#)
            .eval()
            .unwrap();
        assert_eq!(table.get("name"), Some(&Value::from("x")));
        assert_eq!(table.get("n"), Some(&Value::Int(3)));
        assert_eq!(table.get("f"), Some(&Value::Float(1.5)));
        assert_eq!(table.get("flag"), Some(&Value::Bool(true)));
        assert_eq!(
            table.get("list"),
            Some(&Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]))
        );

        let back = table.clone().into_lua(&lua).unwrap();
        lua.globals().set("t", back).unwrap();
        let n: i64 = lua.load("return t.n + #t.list").eval().unwrap();
        assert_eq!(n, 6);

        let func: mlua::Function = lua.load("return function() end").eval().unwrap();
        assert!(Value::from_lua(LuaValue::Function(func), &lua).is_err());
    }

    #[test]
    fn test_json_conversion() {
        let value: Value = serde_json::from_str(r#"{"a": [1, 2.5, "x", null]}"#).unwrap();
        assert_eq!(
            value.get("a"),
            Some(&Value::List(vec![
                Value::Int(1),
                Value::Float(2.5),
                Value::from("x"),
                Value::Null
            ]))
        );
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"a":[1,2.5,"x",null]}"#
        );
    }
}
