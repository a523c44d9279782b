//! `nsUtil`: helpers for decoding binary payloads

use std::sync::Arc;

use mlua::{FromLua, IntoLua, Lua, Table, Value as LuaValue};

use crate::stats::MetricsSink;
use crate::value::Value;

use super::failure;

const ERROR_PREFIX: &str = "nsUtil error: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "BigEndian" | "big" => Some(ByteOrder::Big),
            "LittleEndian" | "little" => Some(ByteOrder::Little),
            _ => None,
        }
    }
}

/// A number read out of a byte array
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Int(i64),
    Float(f64),
}

macro_rules! read_as {
    ($bytes:expr, $order:expr, $ty:ty) => {{
        const WIDTH: usize = std::mem::size_of::<$ty>();
        let chunk = take::<WIDTH>($bytes)?;
        match $order {
            ByteOrder::Big => <$ty>::from_be_bytes(chunk),
            ByteOrder::Little => <$ty>::from_le_bytes(chunk),
        }
    }};
}

fn take<const N: usize>(bytes: &[u8]) -> Result<[u8; N], String> {
    if bytes.is_empty() {
        return Err("EOF".to_string());
    }
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| "unexpected EOF".to_string())
}

/// Decode one fixed-width number of `kind` at `start`
pub fn read_from_byte_array(
    data: &[u8],
    start: i64,
    order: &str,
    kind: &str,
) -> Result<Reading, String> {
    let order = ByteOrder::parse(order).ok_or_else(|| "unknown byte order".to_string())?;
    let start = usize::try_from(start)
        .ok()
        .filter(|s| *s <= data.len())
        .ok_or_else(|| "start offset out of range".to_string())?;
    let bytes = &data[start..];

    let reading = match kind {
        "uint8" => Reading::Int(read_as!(bytes, order, u8) as i64),
        "uint16" => Reading::Int(read_as!(bytes, order, u16) as i64),
        "uint" | "uint32" => Reading::Int(read_as!(bytes, order, u32) as i64),
        "uint64" => Reading::Int(read_as!(bytes, order, u64) as i64),
        "int8" => Reading::Int(read_as!(bytes, order, i8) as i64),
        "int16" => Reading::Int(read_as!(bytes, order, i16) as i64),
        "int" | "int32" => Reading::Int(read_as!(bytes, order, i32) as i64),
        "int64" => Reading::Int(read_as!(bytes, order, i64)),
        "float32" => Reading::Float(read_as!(bytes, order, f32) as f64),
        "float64" => Reading::Float(read_as!(bytes, order, f64)),
        _ => return Err("unknown data type".to_string()),
    };
    Ok(reading)
}

/// Bytes of a Lua array of integers 0-255
fn byte_array(value: Value) -> Result<Vec<u8>, String> {
    match value {
        Value::List(items) => items
            .iter()
            .map(|item| match item {
                Value::Int(i) => Ok(*i as u8),
                Value::Float(f) => Ok(*f as i64 as u8),
                _ => Err("invalid data".to_string()),
            })
            .collect(),
        Value::Bytes(bytes) => Ok(bytes),
        _ => Err("invalid data".to_string()),
    }
}

pub fn module(lua: &Lua, metrics: Arc<dyn MetricsSink>) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set(
        "readFromByteArray",
        lua.create_function(
            move |lua, (data, start, order, kind): (Table, i64, String, String)| {
                let read = Value::from_lua(LuaValue::Table(data), lua)
                    .map_err(|e| e.to_string())
                    .and_then(byte_array)
                    .and_then(|bytes| read_from_byte_array(&bytes, start, &order, &kind));
                match read {
                    Ok(Reading::Int(i)) => {
                        metrics.incr("nsUtil.readFromByteArray");
                        Ok((i.into_lua(lua)?, None))
                    }
                    Ok(Reading::Float(f)) => {
                        metrics.incr("nsUtil.readFromByteArray");
                        Ok((f.into_lua(lua)?, None))
                    }
                    Err(e) => {
                        metrics.incr("nsUtil.readFromByteArray.error");
                        Ok(failure(format!("{}{}", ERROR_PREFIX, e)))
                    }
                }
            },
        )?,
    )?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::NoopMetrics;

    #[test]
    fn test_read_from_byte_array() {
        let data = [0x01, 0x02, 0x03, 0x04, 0xff, 0xff, 0xff, 0xff];
        let cases = vec![
            (0, "BigEndian", "uint8", Ok(Reading::Int(1))),
            (0, "BigEndian", "uint16", Ok(Reading::Int(0x0102))),
            (0, "LittleEndian", "uint16", Ok(Reading::Int(0x0201))),
            (0, "big", "uint32", Ok(Reading::Int(0x01020304))),
            (4, "little", "int32", Ok(Reading::Int(-1))),
            (4, "BigEndian", "uint", Ok(Reading::Int(0xffff_ffff))),
            (4, "BigEndian", "int8", Ok(Reading::Int(-1))),
            (0, "BigEndian", "int64", Ok(Reading::Int(0x01020304ffffffff))),
            (6, "BigEndian", "uint32", Err("unexpected EOF".to_string())),
            (8, "BigEndian", "uint8", Err("EOF".to_string())),
            (9, "BigEndian", "uint8", Err("start offset out of range".to_string())),
            (0, "middle", "uint8", Err("unknown byte order".to_string())),
            (0, "BigEndian", "decimal", Err("unknown data type".to_string())),
        ];
        for (start, order, kind, expected) in cases {
            assert_eq!(
                read_from_byte_array(&data, start, order, kind),
                expected,
                "{} {} {}",
                start,
                order,
                kind
            );
        }

        let pi = 1.5f32.to_be_bytes();
        assert_eq!(
            read_from_byte_array(&pi, 0, "BigEndian", "float32"),
            Ok(Reading::Float(1.5))
        );
        let e = 2.25f64.to_le_bytes();
        assert_eq!(
            read_from_byte_array(&e, 0, "LittleEndian", "float64"),
            Ok(Reading::Float(2.25))
        );
    }

    #[test]
    fn test_module_from_lua() {
        let lua = Lua::new();
        let table = module(&lua, Arc::new(NoopMetrics)).unwrap();
        lua.globals().set("nsUtil", table).unwrap();

        let n: i64 = lua
            .load(r#"return nsUtil.readFromByteArray({0, 1, 0, 2}, 2, "BigEndian", "uint16")"#)
            .eval()
            .unwrap();
        assert_eq!(n, 2);

        let (n, err): (Option<i64>, String) = lua
            .load(r#"return nsUtil.readFromByteArray({"a"}, 0, "BigEndian", "uint8")"#)
            .eval()
            .unwrap();
        assert!(n.is_none());
        assert_eq!(err, "nsUtil error: invalid data");
    }
}
