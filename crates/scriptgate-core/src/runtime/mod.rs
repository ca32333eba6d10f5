//! Script runtime adapter over an embedded Lua 5.4 engine.
//!
//! A [`ScriptRuntime`] owns the engine, the persistent execution context and
//! two primitive sets (ADMIN and RESTRICTED) computed once at startup. Every
//! call runs in a fresh scope table whose lookups fall through to extra
//! bindings, then the context, then the tier's primitives; unknown names
//! raise `name 'x' is not defined`.
//!
//! After a successful `execute`, the scope's own bindings are merged into the
//! context. `evaluate` and `call_capability` never write to the context.

mod convert;
pub mod modules;

pub use convert::{json_to_lua, lua_to_json, map_to_table, textual, values_to_json};

use std::sync::{Arc, Mutex, PoisonError};

use mlua::{Function, Lua, MultiValue, Table, Value};
use serde_json::{Map, Value as Json};
use tracing::debug;

use scriptgate_config::policy::DANGEROUS_PRIMITIVES;
use scriptgate_config::{CapabilityRegistry, CapabilityTier, PrivilegeTier, SecurityPolicy, Violation};

use crate::error::GatewayError;

/// Chunk name reported in error positions (`input:3: ...`).
pub const CHUNK_NAME: &str = "=input";

/// Builds a scope table whose `__index` consults the context, then the
/// primitive set, and raises for anything else.
const SCOPE_FACTORY: &str = r#"
local setmetatable, error, type = setmetatable, error, type
return function(context, primitives)
    return setmetatable({}, {
        __index = function(_, key)
            local value = context[key]
            if value ~= nil then
                return value
            end
            value = primitives[key]
            if value ~= nil then
                return value
            end
            if type(key) == "string" then
                error("name '" .. key .. "' is not defined", 2)
            end
        end,
    })
end
"#;

/// Points the `io` library's standard output at `emit`. Scripts never
/// reach the process's own stdout, which carries protocol records.
const STDOUT_REDIRECT: &str = r#"
local setmetatable, error = setmetatable, error
return function(io, emit)
    local stdout = setmetatable({}, {
        __name = "FILE*",
        __tostring = function() return "file (stdout)" end,
    })
    function stdout:write(...)
        emit(...)
        return self
    end
    function stdout:flush() return self end
    function stdout:setvbuf() return true end
    function stdout:close() return nil, "cannot close standard file" end

    io.stdout = stdout
    io.write = function(...)
        emit(...)
        return stdout
    end
    io.output = function(file)
        if file == nil or file == stdout then
            return stdout
        end
        error("io.output cannot be redirected", 2)
    end
end
"#;

/// Raised inside the engine when `require` resolves a denied module.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct ImportDenied(Violation);

/// Outcome of a successful `execute`.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    /// Serialized result value.
    pub result: Json,
    /// Text written through `print`.
    pub output: String,
}

/// One call's scope: the table the chunk runs against and the extra
/// bindings seeded into it.
struct Scope {
    env: Table,
    seeded: Vec<(String, Value)>,
}

impl Scope {
    /// Whether `name` still holds the value it was seeded with.
    fn is_seeded(&self, name: &[u8], value: &Value) -> bool {
        self.seeded
            .iter()
            .any(|(seed, original)| seed.as_bytes() == name && original == value)
    }

    /// A binding made by the chunk itself.
    fn own_binding(&self, name: &str) -> mlua::Result<Option<Value>> {
        let value: Value = self.env.raw_get(name)?;
        if value.is_nil() || self.is_seeded(name.as_bytes(), &value) {
            return Ok(None);
        }
        Ok(Some(value))
    }
}

/// Persistent interpreter state plus the tier-specific primitive sets.
pub struct ScriptRuntime {
    lua: Lua,
    policy: Arc<SecurityPolicy>,
    context: Table,
    admin: Table,
    restricted: Table,
    scope_factory: Function,
    require: Function,
    output: Arc<Mutex<String>>,
    inventory: Vec<String>,
}

impl ScriptRuntime {
    /// Start the engine, register gateway modules and build both primitive
    /// sets. `module_paths` are searched ahead of the engine defaults.
    pub fn new(policy: Arc<SecurityPolicy>, module_paths: &[String]) -> mlua::Result<Self> {
        let lua = Lua::new();
        let globals = lua.globals();

        let package: Table = globals.get("package")?;
        if !module_paths.is_empty() {
            let mut search: Vec<String> = module_paths
                .iter()
                .map(|dir| dir.trim_end_matches('/'))
                .flat_map(|dir| [format!("{dir}/?.lua"), format!("{dir}/?/init.lua")])
                .collect();
            search.push(package.get("path")?);
            package.set("path", search.join(";"))?;
        }
        modules::register(&lua, &package.get::<Table>("preload")?)?;
        let inventory = modules::inventory(&package.get::<Table>("loaded")?, module_paths)?;
        let require: Function = globals.get("require")?;

        // `require` keeps `package` as an upvalue, so it still works after
        // the global is gone.
        for (name, tier) in policy.registry().iter() {
            if tier == CapabilityTier::Forbidden {
                globals.raw_set(name, Value::Nil)?;
            }
        }

        // Capture goes in before the ADMIN copy so `_G.print` and
        // `require('io')` see the same redirected functions.
        let output = Arc::new(Mutex::new(String::new()));
        globals.raw_set("print", capture_print(&lua, Arc::clone(&output))?)?;
        let io: Table = globals.get("io")?;
        lua.load(STDOUT_REDIRECT)
            .set_name("=stdout")
            .call::<Function>(())?
            .call::<()>((io, capture_write(&lua, Arc::clone(&output))?))?;

        let admin = lua.create_table()?;
        for pair in globals.pairs::<Value, Value>() {
            let (key, value) = pair?;
            admin.raw_set(key, value)?;
        }
        admin.raw_set("require", resolver(&lua, &policy, &require, PrivilegeTier::Admin)?)?;

        let restricted = lua.create_table()?;
        for pair in admin.pairs::<Value, Value>() {
            let (key, value) = pair?;
            let blocked = match &key {
                Value::String(name) => blocked_at_restricted(&name.to_string_lossy(), policy.registry()),
                _ => false,
            };
            if !blocked {
                restricted.raw_set(key, value)?;
            }
        }
        restricted.raw_set(
            "require",
            resolver(&lua, &policy, &require, PrivilegeTier::Restricted)?,
        )?;

        let scope_factory: Function = lua
            .load(SCOPE_FACTORY)
            .set_name("=scope")
            .call(())?;
        let context = lua.create_table()?;

        debug!(modules = inventory.len(), "script runtime ready");

        Ok(Self {
            lua,
            policy,
            context,
            admin,
            restricted,
            scope_factory,
            require,
            output,
            inventory,
        })
    }

    /// The policy this runtime validates against.
    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Validate and run `code`, merging its bindings into the context.
    ///
    /// The result is the `result` binding if the chunk made one, else the
    /// chunk's return value(s), else the captured output, else `null`.
    pub fn execute(
        &self,
        code: &str,
        extras: &Map<String, Json>,
        tier: PrivilegeTier,
    ) -> Result<Execution, GatewayError> {
        self.policy.validate(code, tier)?;
        let scope = self.scope(tier, extras).map_err(fault)?;

        self.drain_output();
        let returned = self
            .lua
            .load(code)
            .set_name(CHUNK_NAME)
            .set_environment(scope.env.clone())
            .eval::<MultiValue>();
        let output = self.drain_output();
        let returned = returned.map_err(fault)?;

        self.merge(&scope).map_err(fault)?;

        let result = match scope.own_binding("result").map_err(fault)? {
            Some(bound) => lua_to_json(&bound),
            None => match values_to_json(returned) {
                Json::Null if !output.is_empty() => Json::String(output.clone()),
                other => other,
            },
        };
        Ok(Execution { result, output })
    }

    /// Validate and evaluate a single expression. Output is discarded and the
    /// context is left untouched.
    pub fn evaluate(
        &self,
        expression: &str,
        extras: &Map<String, Json>,
        tier: PrivilegeTier,
    ) -> Result<Json, GatewayError> {
        self.policy.validate(expression, tier)?;
        let scope = self.scope(tier, extras).map_err(fault)?;

        self.drain_output();
        let returned = self
            .lua
            .load(format!("return {expression}"))
            .set_name(CHUNK_NAME)
            .set_environment(scope.env)
            .call::<MultiValue>(());
        self.drain_output();

        Ok(values_to_json(returned.map_err(fault)?))
    }

    /// Resolve `module` at `tier` and invoke its `member` with positional
    /// arguments. Named arguments, when present, are passed as one trailing
    /// table.
    pub fn call_capability(
        &self,
        module: &str,
        member: &str,
        args: &[Json],
        kwargs: &Map<String, Json>,
        tier: PrivilegeTier,
    ) -> Result<Json, GatewayError> {
        self.policy.check_import(module, tier)?;
        let loaded: Value = self.require.call(module).map_err(fault)?;

        let target = match &loaded {
            Value::Table(table) => table.get::<Value>(member).map_err(fault)?,
            _ => Value::Nil,
        };
        let function = match target {
            Value::Nil => {
                return Err(GatewayError::AttributeMissing {
                    module: module.to_string(),
                    member: member.to_string(),
                });
            }
            Value::Function(function) => function,
            other => {
                return Err(GatewayError::runtime(format!(
                    "'{module}.{member}' is not callable (got {})",
                    other.type_name()
                )));
            }
        };

        let mut call_args = args
            .iter()
            .map(|arg| json_to_lua(&self.lua, arg))
            .collect::<mlua::Result<Vec<_>>>()
            .map_err(fault)?;
        if !kwargs.is_empty() {
            call_args.push(Value::Table(map_to_table(&self.lua, kwargs).map_err(fault)?));
        }

        self.drain_output();
        let returned = function.call::<MultiValue>(MultiValue::from_iter(call_args));
        self.drain_output();

        Ok(values_to_json(returned.map_err(fault)?))
    }

    /// Drop every binding in the context.
    pub fn clear_context(&mut self) -> Result<(), GatewayError> {
        self.context = self.lua.create_table().map_err(fault)?;
        Ok(())
    }

    /// Current value of a context binding.
    pub fn binding(&self, name: &str) -> Option<Json> {
        match self.context.raw_get::<Value>(name) {
            Ok(Value::Nil) | Err(_) => None,
            Ok(value) => Some(lua_to_json(&value)),
        }
    }

    /// Sorted names bound in the context.
    pub fn binding_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .context
            .pairs::<Value, Value>()
            .filter_map(Result::ok)
            .map(|(key, _)| textual(&key))
            .collect();
        names.sort();
        names
    }

    /// Installed-module inventory, computed at startup.
    pub fn modules(&self) -> &[String] {
        &self.inventory
    }

    /// The engine's `_VERSION` string, e.g. `Lua 5.4`.
    pub fn engine_version(&self) -> String {
        self.lua
            .globals()
            .get::<String>("_VERSION")
            .unwrap_or_else(|_| "Lua".to_string())
    }

    fn primitives(&self, tier: PrivilegeTier) -> &Table {
        match tier {
            PrivilegeTier::Admin => &self.admin,
            PrivilegeTier::Restricted => &self.restricted,
        }
    }

    fn scope(&self, tier: PrivilegeTier, extras: &Map<String, Json>) -> mlua::Result<Scope> {
        let env: Table = self
            .scope_factory
            .call((self.context.clone(), self.primitives(tier).clone()))?;
        let mut seeded = Vec::with_capacity(extras.len());
        for (name, value) in extras {
            let value = json_to_lua(&self.lua, value)?;
            env.raw_set(name.as_str(), value.clone())?;
            seeded.push((name.clone(), value));
        }
        Ok(Scope { env, seeded })
    }

    fn merge(&self, scope: &Scope) -> mlua::Result<()> {
        for pair in scope.env.pairs::<Value, Value>() {
            let (key, value) = pair?;
            let seeded = match &key {
                Value::String(name) => scope.is_seeded(&name.as_bytes(), &value),
                _ => false,
            };
            if seeded {
                continue;
            }
            self.context.raw_set(key, value)?;
        }
        Ok(())
    }

    fn drain_output(&self) -> String {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *output)
    }
}

fn blocked_at_restricted(name: &str, registry: &CapabilityRegistry) -> bool {
    DANGEROUS_PRIMITIVES.contains(&name)
        || (CapabilityRegistry::is_builtin(name)
            && !PrivilegeTier::Restricted.allows(registry.tier_of(name)))
}

/// `require` bound to a tier: re-checks the policy, then defers to the
/// engine's loader.
fn resolver(
    lua: &Lua,
    policy: &Arc<SecurityPolicy>,
    require: &Function,
    tier: PrivilegeTier,
) -> mlua::Result<Function> {
    let policy = Arc::clone(policy);
    let require = require.clone();
    lua.create_function(move |_, name: String| {
        policy
            .check_import(&name, tier)
            .map_err(|violation| mlua::Error::external(ImportDenied(violation)))?;
        require.call::<MultiValue>(name)
    })
}

fn capture_print(lua: &Lua, sink: Arc<Mutex<String>>) -> mlua::Result<Function> {
    lua.create_function(move |_, args: MultiValue| {
        let line = args.iter().map(textual).collect::<Vec<_>>().join("\t");
        let mut out = sink.lock().unwrap_or_else(PoisonError::into_inner);
        out.push_str(&line);
        out.push('\n');
        Ok(())
    })
}

/// `io.write` semantics: strings and numbers, no separators.
fn capture_write(lua: &Lua, sink: Arc<Mutex<String>>) -> mlua::Result<Function> {
    lua.create_function(move |_, args: MultiValue| {
        let mut out = sink.lock().unwrap_or_else(PoisonError::into_inner);
        for (index, arg) in args.iter().enumerate() {
            match arg {
                Value::String(_) | Value::Integer(_) | Value::Number(_) => out.push_str(&textual(arg)),
                other => {
                    return Err(mlua::Error::runtime(format!(
                        "bad argument #{} to 'write' (string expected, got {})",
                        index + 1,
                        other.type_name()
                    )));
                }
            }
        }
        Ok(())
    })
}

/// Map an engine error to a gateway fault. A denied import surfaces as a
/// security error without trace.
fn fault(err: mlua::Error) -> GatewayError {
    if let Some(violation) = denied_import(&err) {
        return GatewayError::Security(violation);
    }
    let (message, trace) = describe(&err);
    GatewayError::Runtime { message, trace }
}

fn denied_import(err: &mlua::Error) -> Option<Violation> {
    match err {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<ImportDenied>().map(|d| d.0.clone()),
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            denied_import(cause)
        }
        _ => None,
    }
}

fn describe(err: &mlua::Error) -> (String, Option<String>) {
    match err {
        mlua::Error::RuntimeError(msg) => match msg.split_once("\nstack traceback:") {
            Some((message, trace)) => (message.to_string(), Some(format!("stack traceback:{trace}"))),
            None => (msg.clone(), None),
        },
        mlua::Error::CallbackError { traceback, cause } => (describe(cause).0, Some(traceback.clone())),
        mlua::Error::WithContext { context, cause } => {
            let (message, trace) = describe(cause);
            (format!("{context}: {message}"), trace)
        }
        mlua::Error::SyntaxError { message, .. } => (message.clone(), None),
        mlua::Error::ExternalError(inner) => (inner.to_string(), None),
        other => (other.to_string(), None),
    }
}
