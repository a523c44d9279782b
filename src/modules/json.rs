//! `json` global: encode Lua values to JSON text and back

use mlua::{FromLua, IntoLua, Lua, Table, Value as LuaValue};

use crate::value::Value;

use super::failure;

const ERROR_PREFIX: &str = "json error: ";

pub fn encode(value: &Value) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| e.to_string())
}

pub fn decode(text: &str) -> Result<Value, String> {
    serde_json::from_str(text).map_err(|e| e.to_string())
}

pub fn module(lua: &Lua) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    table.set(
        "encode",
        lua.create_function(|lua, value: LuaValue| {
            let encoded = Value::from_lua(value, lua)
                .map_err(|e| e.to_string())
                .and_then(|v| encode(&v));
            match encoded {
                Ok(text) => Ok((text.into_lua(lua)?, None)),
                Err(e) => Ok(failure(format!("{}{}", ERROR_PREFIX, e))),
            }
        })?,
    )?;

    table.set(
        "decode",
        lua.create_function(|lua, text: String| match decode(&text) {
            Ok(value) => Ok((value.into_lua(lua)?, None)),
            Err(e) => Ok(failure(format!("{}{}", ERROR_PREFIX, e))),
        })?,
    )?;

    Ok(table)
}
