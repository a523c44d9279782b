//! `nsQL` Lua module
//!
//! `connect(source)` opens a persistent Cassandra session and returns a
//! connection object with `query` and `disconnect` methods. `queryDirect`
//! (also exported as `query`) picks a backend per call and runs one query.

use std::sync::Arc;

use mlua::{FromLua, IntoLua, Lua, Table, UserData, UserDataMethods, Value as LuaValue};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::NsqlError;
use crate::nsql::{Backends, CassandraCompiler, Compiler, Options, Source};
use crate::stats::MetricsSink;
use crate::value::Value;

use super::failure;

type SharedCompiler = Arc<Mutex<CassandraCompiler>>;

/// Connections opened by scripts of the current invocation
#[derive(Clone, Default)]
pub struct NsqlHandle {
    connections: Arc<Mutex<Vec<SharedCompiler>>>,
}

impl NsqlHandle {
    /// Close every connection a script left open
    pub fn reset(&self) {
        let connections: Vec<SharedCompiler> = self.connections.lock().drain(..).collect();
        for connection in connections {
            connection.lock().disconnect();
        }
    }

    pub fn open_connections(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|c| c.lock().is_connected())
            .count()
    }

    fn track(&self, compiler: SharedCompiler) {
        self.connections.lock().push(compiler);
    }
}

struct Connection {
    compiler: SharedCompiler,
    metrics: Arc<dyn MetricsSink>,
}

impl UserData for Connection {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("query", |lua, this, (query, options): (String, LuaValue)| {
            let result = options_from(lua, options).and_then(|options| {
                let mut compiler = this.compiler.lock();
                if !compiler.is_connected() {
                    return Err(NsqlError::module("connection is closed"));
                }
                compiler.run(&query, &options)
            });
            respond(lua, this.metrics.as_ref(), "query", result)
        });

        methods.add_method("disconnect", |_, this, ()| {
            this.compiler.lock().disconnect();
            this.metrics.incr("nsQL.disconnect");
            Ok(())
        });
    }
}

fn options_from(lua: &Lua, options: LuaValue) -> Result<Options, NsqlError> {
    let value = Value::from_lua(options, lua).map_err(|e| NsqlError::module(e.to_string()))?;
    Options::from_value(&value)
}

fn source_from(lua: &Lua, source: LuaValue) -> Result<Source, NsqlError> {
    let value = Value::from_lua(source, lua).map_err(|e| NsqlError::module(e.to_string()))?;
    Source::from_value(&value)
}

/// The result, or `(nil, message)` for a failed query
fn respond(
    lua: &Lua,
    metrics: &dyn MetricsSink,
    api: &str,
    result: Result<Value, NsqlError>,
) -> mlua::Result<(LuaValue, Option<String>)> {
    match result {
        Ok(value) => {
            metrics.incr(&format!("nsQL.{}", api));
            Ok((value.into_lua(lua)?, None))
        }
        Err(e) => {
            debug!(api, error = %e, "nsQL call failed");
            metrics.incr(&format!("nsQL.{}.error", api));
            Ok(failure(e.to_string()))
        }
    }
}

/// Build the `nsQL` module table; the handle closes connections on reset
pub fn module(
    lua: &Lua,
    backends: Backends,
    metrics: Arc<dyn MetricsSink>,
) -> mlua::Result<(Table, NsqlHandle)> {
    let table = lua.create_table()?;
    let handle = NsqlHandle::default();

    {
        let backends = backends.clone();
        let handle = handle.clone();
        let metrics = Arc::clone(&metrics);
        table.set(
            "connect",
            lua.create_function(move |lua, source: LuaValue| {
                let opened = source_from(lua, source)
                    .and_then(|source| backends.cassandra_for(&source))
                    .and_then(|mut compiler| {
                        compiler.connect()?;
                        Ok(compiler)
                    });
                match opened {
                    Ok(compiler) => {
                        let compiler = Arc::new(Mutex::new(compiler));
                        handle.track(Arc::clone(&compiler));
                        metrics.incr("nsQL.connect");
                        let connection = Connection {
                            compiler,
                            metrics: Arc::clone(&metrics),
                        };
                        Ok((lua.create_userdata(connection)?.into_lua(lua)?, None))
                    }
                    Err(e) => {
                        metrics.incr("nsQL.connect.error");
                        Ok(failure(e.to_string()))
                    }
                }
            })?,
        )?;
    }

    let direct = {
        let metrics = Arc::clone(&metrics);
        lua.create_function(
            move |lua, (query, source, options): (String, LuaValue, LuaValue)| {
                let result = source_from(lua, source)
                    .and_then(|source| backends.compiler_for(&source))
                    .and_then(|mut compiler| {
                        let options = options_from(lua, options)?;
                        compiler.run(&query, &options)
                    });
                respond(lua, metrics.as_ref(), "queryDirect", result)
            },
        )?
    };
    table.set("queryDirect", direct.clone())?;
    table.set("query", direct)?;

    Ok((table, handle))
}
