//! Capability modules exposed to sandboxed scripts
//!
//! Each module is a plain Lua table of Rust callbacks. Modules that own
//! per-invocation state (captured output, open connections) hand back a shared
//! handle so the interpreter state can reset them between invocations.
//!
//! Recoverable failures come back to the script as `(nil, "<prefix> error: ...")`.
//! Unrecoverable ones raise a Lua runtime error and abort the snippet.

pub mod json;
pub mod nsql;
pub mod output;
pub mod util;

use mlua::{Lua, Table, Value as LuaValue};

pub use nsql::NsqlHandle;
pub use output::{OutputBuffer, SharedOutput};

/// Module name of the output capture capability
pub const NS_OUTPUT: &str = "nsOutput";

/// Module name of the byte utilities
pub const NS_UTIL: &str = "nsUtil";

/// Module name of the query capability
pub const NS_QL: &str = "nsQL";

/// Global name of the JSON helpers
pub const JSON: &str = "json";

/// Make `module` reachable through `require(name)` and as a global
pub fn register(lua: &Lua, name: &str, module: Table) -> mlua::Result<()> {
    let package: Table = lua.globals().get("package")?;
    let preload: Table = package.get("preload")?;

    let loader_module = module.clone();
    let loader = lua.create_function(move |_, _: mlua::MultiValue| Ok(loader_module.clone()))?;
    preload.set(name, loader)?;

    lua.globals().set(name, module)
}

/// The conventional `(nil, message)` failure pair
pub(crate) fn failure(message: impl Into<String>) -> (LuaValue, Option<String>) {
    (LuaValue::Nil, Some(message.into()))
}
