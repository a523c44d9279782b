//! One sandboxed Lua environment
//!
//! A state owns a Lua VM with an allow-listed standard library, the enabled
//! capability modules, and the cancellation token polled by the VM hook.
//! States are reused across invocations, but snippet code never sees the
//! VM globals: `prepare` builds a fresh environment table holding copies of
//! every library and module table, and `clean` throws it away.

use std::sync::Arc;

use mlua::{
    FromLua, Function, HookTriggers, IntoLua, Lua, LuaOptions, MultiValue, StdLib, Table,
    Value as LuaValue, Variadic, VmState,
};
use tracing::debug;

use super::cancel::CancelToken;
use super::Input;
use crate::config::{ModuleFlags, RteConfig};
use crate::error::{Result, RteError};
use crate::modules::{self, NsqlHandle, OutputBuffer, SharedOutput};
use crate::nsql::Backends;
use crate::stats::MetricsSink;
use crate::value::Value;

/// VM instructions between two cancellation checks
pub const HOOK_INTERVAL: u32 = 1000;

/// Global holding the invocation context
pub const CONTEXT: &str = "context";

const REMOVED_BASE: [&str; 4] = ["dofile", "loadfile", "load", "collectgarbage"];
const OS_ALLOWED: [&str; 4] = ["time", "clock", "date", "difftime"];

/// Globals rebuilt per environment instead of copied
const REBUILT: [&str; 3] = ["_G", "package", "require"];

/// Builds a `require` resolving only the tables of one environment
const REQUIRE_FACTORY: &str = r#"
return function(loaded)
  return function(name)
    local module = loaded[name]
    if module == nil then
      error("module '" .. tostring(name) .. "' not found", 2)
    end
    return module
  end
end
"#;

/// Everything a state needs besides the input
#[derive(Clone)]
pub struct StateEnv {
    pub modules: ModuleFlags,
    pub print_limit: usize,
    pub backends: Backends,
    pub metrics: Arc<dyn MetricsSink>,
}

impl StateEnv {
    pub fn from_config(config: &RteConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        StateEnv {
            modules: config.modules,
            print_limit: config.print_limit,
            backends: Backends::new(config.spark_host_port.clone())
                .with_driver_threads(config.thread_count),
            metrics,
        }
    }

    /// Capabilities requested by configuration that this runtime cannot provide
    fn unavailable(&self) -> Vec<&'static str> {
        let flags = &self.modules;
        [
            (flags.http, "http"),
            (flags.ns_ftp, "nsFTP"),
            (flags.ns_sftp, "nsSFTP"),
            (flags.ns_object, "nsObject"),
            (flags.ns_kv, "nsKV"),
            (flags.ns_stream, "nsStream"),
        ]
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .map(|(_, name)| name)
        .collect()
    }
}

/// A sandboxed Lua VM plus the handles of its capability modules
pub struct InterpreterState {
    lua: Lua,
    token: CancelToken,
    output: Option<SharedOutput>,
    nsql: Option<NsqlHandle>,
    /// Environment of the current invocation
    sandbox: Table,
    require_factory: Function,
    closed: bool,
}

impl InterpreterState {
    /// Build a fresh state bound to `input`
    pub fn create(input: &Input, env: &StateEnv) -> Result<Self> {
        if let Some(name) = env.unavailable().first() {
            return Err(RteError::Lua(format!(
                "{} module is not available in this runtime",
                name
            )));
        }

        let lua = Lua::new_with(
            StdLib::STRING | StdLib::MATH | StdLib::TABLE | StdLib::PACKAGE | StdLib::OS,
            LuaOptions::default(),
        )?;
        restrict_libraries(&lua)?;

        let token = CancelToken::new();
        let hook_token = token.clone();
        let _ = lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
            move |_lua, _debug| match hook_token.check() {
                Ok(()) => Ok(VmState::Continue),
                Err(interrupt) => Err(mlua::Error::RuntimeError(interrupt.to_string())),
            },
        );

        lua.globals().set(modules::JSON, modules::json::module(&lua)?)?;

        let mut output = None;
        if env.modules.ns_output {
            debug!("loading nsOutput module");
            let buffer = OutputBuffer::shared(env.print_limit);
            let table = modules::output::module(&lua, Arc::clone(&buffer), Arc::clone(&env.metrics))?;
            modules::register(&lua, modules::NS_OUTPUT, table)?;
            install_print(&lua, Arc::clone(&buffer))?;
            output = Some(buffer);
        } else {
            lua.globals().set("print", LuaValue::Nil)?;
        }

        let mut nsql = None;
        if env.modules.nsql {
            debug!("loading nsQL module");
            let (table, handle) =
                modules::nsql::module(&lua, env.backends.clone(), Arc::clone(&env.metrics))?;
            modules::register(&lua, modules::NS_QL, table)?;
            nsql = Some(handle);
        }

        if env.modules.ns_util {
            debug!("loading nsUtil module");
            let table = modules::util::module(&lua, Arc::clone(&env.metrics))?;
            modules::register(&lua, modules::NS_UTIL, table)?;
        }

        // The shared string table stays reachable only through method calls
        lua.load("getmetatable('').__metatable = false").exec()?;
        let require_factory: Function = lua.load(REQUIRE_FACTORY).set_name("require").eval()?;
        let sandbox = lua.create_table()?;

        let mut state = InterpreterState {
            lua,
            token,
            output,
            nsql,
            sandbox,
            require_factory,
            closed: false,
        };
        state.prepare(input)?;
        Ok(state)
    }

    /// Bind a new invocation: arm the deadline, expose its arguments and
    /// cap the allocator
    pub fn prepare(&mut self, input: &Input) -> Result<()> {
        if self.closed {
            return Err(RteError::Internal("interpreter state is closed".to_string()));
        }

        self.lua.set_memory_limit(0)?;
        let args = Value::Map(input.args.clone()).into_lua(&self.lua)?;
        let args = match args {
            LuaValue::Table(table) => read_only(&self.lua, table)?,
            _ => self.lua.create_table()?,
        };
        let context = self.lua.create_table()?;
        context.set("Args", args)?;
        context.set("AccountId", input.account_id.as_str())?;
        context.set("InvocationId", input.invocation_id.as_str())?;
        let context = read_only(&self.lua, context)?;
        self.sandbox = self.fresh_sandbox(context)?;

        if input.memory > 0 {
            let limit = self.lua.used_memory() + input.memory as usize;
            self.lua.set_memory_limit(limit)?;
        }

        self.token.reset(input.deadline());
        Ok(())
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Environment snippet code runs in
    pub fn sandbox(&self) -> &Table {
        &self.sandbox
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Run the snippet's top-level code
    pub fn exec(&self, code: &str) -> mlua::Result<()> {
        self.lua
            .load(code)
            .set_name("snippet")
            .set_environment(self.sandbox.clone())
            .exec()
    }

    /// Call global `name` without arguments and render its first return value
    pub fn call_entry(&self, name: &str) -> mlua::Result<String> {
        let entry: LuaValue = self.sandbox.get(name)?;
        let entry = match entry {
            LuaValue::Function(f) => f,
            other => {
                return Err(mlua::Error::RuntimeError(format!(
                    "attempt to call a {} value (global '{}')",
                    other.type_name(),
                    name
                )))
            }
        };
        let returned: MultiValue = entry.call(())?;
        Ok(match returned.into_iter().next() {
            Some(LuaValue::String(s)) => s.to_string_lossy().to_string(),
            Some(LuaValue::Integer(i)) => i.to_string(),
            Some(LuaValue::Number(n)) => Value::Float(n).to_string(),
            _ => String::new(),
        })
    }

    pub fn stdout(&self) -> String {
        self.output
            .as_ref()
            .map(|o| o.lock().stdout())
            .unwrap_or_default()
    }

    /// Result set by one of the `*Direct` output functions
    pub fn direct_result(&self) -> Option<String> {
        self.output
            .as_ref()
            .map(|o| o.lock().result().to_string())
            .filter(|r| !r.is_empty())
    }

    /// Forget the previous invocation but keep the VM
    pub fn clean(&mut self) {
        if let Some(output) = &self.output {
            output.lock().reset();
        }
        if let Some(nsql) = &self.nsql {
            nsql.reset();
        }
        if self.closed {
            return;
        }
        match self.lua.create_table() {
            Ok(empty) => self.sandbox = empty,
            Err(e) => debug!(error = %e, "failed to drop snippet environment"),
        }
        let _ = self.lua.set_memory_limit(0);
        let _ = self.lua.gc_collect();
    }

    /// Clean, cancel and refuse further use
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.clean();
        self.token.cancel();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Environment for one invocation
    ///
    /// Library and module tables are copied so a snippet that patches
    /// `string` or `nsOutput` only patches its own copy.
    fn fresh_sandbox(&self, context: Table) -> mlua::Result<Table> {
        let sandbox = self.lua.create_table()?;
        let loaded = self.lua.create_table()?;
        for pair in self.lua.globals().pairs::<LuaValue, LuaValue>() {
            let (key, value) = pair?;
            let name = match key {
                LuaValue::String(s) => s.to_string_lossy().to_string(),
                _ => continue,
            };
            if REBUILT.contains(&name.as_str()) {
                continue;
            }
            let value = match value {
                LuaValue::Table(table) => {
                    let copy = shallow_copy(&self.lua, &table)?;
                    loaded.raw_set(name.as_str(), copy.clone())?;
                    LuaValue::Table(copy)
                }
                other => other,
            };
            sandbox.raw_set(name, value)?;
        }

        let package = self.lua.create_table()?;
        package.raw_set("path", "")?;
        package.raw_set("cpath", "")?;
        package.raw_set("preload", self.lua.create_table()?)?;
        package.raw_set("loaded", loaded.clone())?;
        let require: Function = self.require_factory.call(loaded)?;

        sandbox.raw_set("package", package)?;
        sandbox.raw_set("require", require)?;
        sandbox.raw_set(CONTEXT, context)?;
        sandbox.raw_set("_G", sandbox.clone())?;
        Ok(sandbox)
    }
}

impl Drop for InterpreterState {
    fn drop(&mut self) {
        self.close();
    }
}

fn shallow_copy(lua: &Lua, table: &Table) -> mlua::Result<Table> {
    let copy = lua.create_table()?;
    for pair in table.pairs::<LuaValue, LuaValue>() {
        let (key, value) = pair?;
        copy.raw_set(key, value)?;
    }
    Ok(copy)
}

/// Trim the loaded libraries down to the sandbox surface
fn restrict_libraries(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in REMOVED_BASE {
        globals.set(name, LuaValue::Nil)?;
    }

    let os: Table = globals.get("os")?;
    let restricted = lua.create_table()?;
    for name in OS_ALLOWED {
        let f: LuaValue = os.get(name)?;
        restricted.set(name, f)?;
    }
    globals.set("os", restricted)?;

    // require only resolves preloaded modules
    let package: Table = globals.get("package")?;
    package.set("path", "")?;
    package.set("cpath", "")?;
    package.set("loadlib", LuaValue::Nil)?;
    let searchers: Table = package.get("searchers")?;
    let preload_searcher: LuaValue = searchers.get(1)?;
    package.set("searchers", lua.create_sequence_from([preload_searcher])?)?;
    Ok(())
}

/// Wrap `table` in a proxy that can be read and iterated but not written
fn read_only(lua: &Lua, table: Table) -> mlua::Result<Table> {
    let proxy = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.set("__index", table.clone())?;
    meta.set(
        "__newindex",
        lua.create_function(|_, _: MultiValue| -> mlua::Result<()> {
            Err(mlua::Error::RuntimeError(
                "attempt to modify a read-only table".to_string(),
            ))
        })?,
    )?;
    let len_source = table.clone();
    meta.set(
        "__len",
        lua.create_function(move |_, _: MultiValue| Ok(len_source.raw_len()))?,
    )?;
    meta.set(
        "__pairs",
        lua.create_function(move |lua, _: MultiValue| {
            let next: Function = lua.globals().get("next")?;
            Ok((next, table.clone(), LuaValue::Nil))
        })?,
    )?;
    meta.set("__metatable", false)?;

    let setmetatable: Function = lua.globals().get("setmetatable")?;
    let proxy: Table = setmetatable.call((proxy, meta))?;
    Ok(proxy)
}

/// Route the global `print` into the captured stdout
fn install_print(lua: &Lua, output: SharedOutput) -> mlua::Result<()> {
    let print = lua.create_function(move |lua, args: Variadic<LuaValue>| {
        let mut parts = Vec::with_capacity(args.len());
        for arg in args {
            parts.push(match arg {
                LuaValue::Table(_) | LuaValue::Function(_) | LuaValue::UserData(_) => {
                    arg.type_name().to_string()
                }
                other => Value::from_lua(other, lua)?.to_string(),
            });
        }
        let mut line = parts.join("\t");
        line.push('\n');
        output
            .lock()
            .append(line)
            .map_err(|e| mlua::Error::RuntimeError(format!("nsOutput error: {}", e)))
    })?;
    lua.globals().set("print", print)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::NoopMetrics;
    use std::collections::BTreeMap;

    fn env() -> StateEnv {
        StateEnv {
            modules: ModuleFlags::default(),
            print_limit: 100,
            backends: Backends::new(None),
            metrics: Arc::new(NoopMetrics),
        }
    }

    fn eval<R: mlua::FromLuaMulti>(state: &InterpreterState, code: &str) -> mlua::Result<R> {
        state
            .lua()
            .load(code)
            .set_environment(state.sandbox().clone())
            .eval()
    }

    fn input_with_args() -> Input {
        let mut args = BTreeMap::new();
        args.insert("name".to_string(), Value::from("rte"));
        args.insert("n".to_string(), Value::Int(2));
        Input {
            args,
            ..Input::default()
        }
    }

    #[test]
    fn test_sandbox_surface() {
        let state = InterpreterState::create(&Input::default(), &env()).unwrap();
        let cases = vec![
            ("return dofile == nil and loadfile == nil and load == nil", true),
            ("return collectgarbage == nil and io == nil and debug == nil", true),
            ("return os.execute == nil and os.getenv == nil and os.remove == nil", true),
            ("return type(os.time()) == 'number' and type(os.clock()) == 'number'", true),
            ("return package.loadlib == nil and package.path == ''", true),
            ("return require('nsOutput') == nsOutput and require('nsUtil') == nsUtil", true),
            ("return pcall(require, 'os.nope') == false", true),
            ("return nsQL == nil", true),
            ("return string.upper('x') == 'X' and math.max(1, 2) == 2", true),
            ("return _G == _ENV and _G.context == context", true),
            ("return getmetatable('') == false", true),
            ("return package.loaded.string == string", true),
            ("return rawequal(nsOutput, require('nsOutput'))", true),
        ];
        for (code, expected) in cases {
            let got: bool = eval(&state, code).unwrap();
            assert_eq!(got, expected, "{}", code);
        }
    }

    #[test]
    fn test_context_args_are_read_only() {
        let state = InterpreterState::create(&input_with_args(), &env()).unwrap();
        let (name, n): (String, i64) =
            eval(&state, "return context.Args.name, context.Args.n").unwrap();
        assert_eq!(name, "rte");
        assert_eq!(n, 2);

        let keys: i64 = eval(
            &state,
            "local c = 0 for _ in pairs(context.Args) do c = c + 1 end return c",
        )
        .unwrap();
        assert_eq!(keys, 2);

        for code in ["context.Args.name = 'x'", "context.Args = {}"] {
            let err = state.exec(code).unwrap_err();
            assert!(err.to_string().contains("read-only"), "{}", err);
        }
    }

    #[test]
    fn test_unavailable_modules_fail_creation() {
        let mut env = env();
        env.modules.ns_kv = true;
        let err = InterpreterState::create(&Input::default(), &env)
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "nsKV module is not available in this runtime");
    }

    #[test]
    fn test_clean_drops_script_globals_and_output() {
        let mut state = InterpreterState::create(&Input::default(), &env()).unwrap();
        state
            .exec("leaked = 1 nsOutput.print('hi') print('a', 1) nsOutput.valueDirect({value = 1})")
            .unwrap();
        assert_eq!(state.stdout(), "hia\t1\n");
        assert!(state.direct_result().is_some());

        state.clean();
        state.prepare(&Input::default()).unwrap();
        let leaked: LuaValue = state.sandbox().get("leaked").unwrap();
        assert!(leaked.is_nil());
        assert_eq!(state.stdout(), "");
        assert!(state.direct_result().is_none());
        let json: LuaValue = state.sandbox().get("json").unwrap();
        assert!(!json.is_nil());
    }

    #[test]
    fn test_library_patches_do_not_outlive_invocation() {
        let mut state = InterpreterState::create(&Input::default(), &env()).unwrap();
        state
            .exec(
                "string.upper = function() return 'patched' end \
                 math.n = 1 json.encode = nil package.loaded.nsUtil = nil \
                 nsOutput.print = nil",
            )
            .unwrap();
        state.clean();
        state.prepare(&Input::default()).unwrap();

        let cases = vec![
            ("return string.upper('x') == 'X'", true),
            ("return ('x'):upper() == 'X'", true),
            ("return math.n == nil", true),
            ("return type(json.encode) == 'function'", true),
            ("return require('nsUtil') == nsUtil", true),
            ("return type(nsOutput.print) == 'function'", true),
        ];
        for (code, expected) in cases {
            let got: bool = eval(&state, code).unwrap();
            assert_eq!(got, expected, "{}", code);
        }
    }

    #[test]
    fn test_entry_function_results() {
        let state = InterpreterState::create(&Input::default(), &env()).unwrap();
        state
            .exec(
                "function s() return '10' end function i() return 10 end \
                 function f() return 1.5 end function t() return {} end",
            )
            .unwrap();
        let cases = vec![("s", "10"), ("i", "10"), ("f", "1.5"), ("t", "")];
        for (entry, expected) in cases {
            assert_eq!(state.call_entry(entry).unwrap(), expected);
        }
        let err = state.call_entry("missing").unwrap_err();
        assert!(err.to_string().contains("attempt to call a nil value"));
    }

    #[test]
    fn test_cancelled_token_interrupts_loop() {
        let state = InterpreterState::create(&Input::default(), &env()).unwrap();
        state.token().cancel();
        let err = state.exec("while true do end").unwrap_err();
        assert!(err.to_string().contains("context canceled"), "{}", err);
    }
}
