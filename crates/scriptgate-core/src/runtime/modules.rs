//! Gateway-provided script modules and the installed-module inventory.
//!
//! `json`, `base64`, `time` and `fs` are implemented in Rust and registered
//! in `package.preload`, so they resolve through the ordinary `require`
//! path and are classified by the capability registry like any other name.

use std::collections::BTreeSet;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use mlua::{Lua, MultiValue, Table, Value};

use super::convert::{json_to_lua, lua_to_json};

/// Names of the modules registered by [`register`].
pub const GATEWAY_MODULES: &[&str] = &["base64", "fs", "json", "time"];

/// Install every gateway module loader into `preload`.
pub fn register(lua: &Lua, preload: &Table) -> mlua::Result<()> {
    preload.set("json", lua.create_function(|lua, _: MultiValue| json_module(lua))?)?;
    preload.set("base64", lua.create_function(|lua, _: MultiValue| base64_module(lua))?)?;
    preload.set("time", lua.create_function(|lua, _: MultiValue| time_module(lua))?)?;
    preload.set("fs", lua.create_function(|lua, _: MultiValue| fs_module(lua))?)?;
    Ok(())
}

fn json_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "encode",
        lua.create_function(|_, (value, pretty): (Value, Option<bool>)| {
            let json = lua_to_json(&value);
            let text = if pretty.unwrap_or(false) {
                serde_json::to_string_pretty(&json)
            } else {
                serde_json::to_string(&json)
            };
            text.map_err(mlua::Error::external)
        })?,
    )?;
    module.set(
        "decode",
        lua.create_function(|lua, text: mlua::String| {
            let json: serde_json::Value =
                serde_json::from_slice(&text.as_bytes()).map_err(mlua::Error::external)?;
            json_to_lua(lua, &json)
        })?,
    )?;
    Ok(module)
}

fn base64_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "encode",
        lua.create_function(|_, data: mlua::String| Ok(STANDARD.encode(&*data.as_bytes())))?,
    )?;
    module.set(
        "decode",
        lua.create_function(|lua, text: mlua::String| {
            let bytes = STANDARD
                .decode(&*text.as_bytes())
                .map_err(|e| mlua::Error::runtime(format!("invalid base64: {e}")))?;
            lua.create_string(bytes)
        })?,
    )?;
    Ok(module)
}

fn time_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "now",
        lua.create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))?,
    )?;
    module.set(
        "unix",
        lua.create_function(|_, ()| {
            let now = chrono::Utc::now();
            Ok(now.timestamp_millis() as f64 / 1000.0)
        })?,
    )?;
    module.set(
        "parse",
        lua.create_function(|_, text: String| {
            let parsed = chrono::DateTime::parse_from_rfc3339(text.trim())
                .map_err(|e| mlua::Error::runtime(format!("invalid RFC 3339 timestamp: {e}")))?;
            Ok(parsed.timestamp())
        })?,
    )?;
    Ok(module)
}

fn fs_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "read",
        lua.create_function(|lua, path: String| {
            let bytes = std::fs::read(&path).map_err(|e| io_fault("read", &path, e))?;
            lua.create_string(bytes)
        })?,
    )?;
    module.set(
        "write",
        lua.create_function(|_, (path, data): (String, mlua::String)| {
            std::fs::write(&path, &*data.as_bytes()).map_err(|e| io_fault("write", &path, e))
        })?,
    )?;
    module.set(
        "exists",
        lua.create_function(|_, path: String| Ok(Path::new(&path).exists()))?,
    )?;
    module.set(
        "list",
        lua.create_function(|_, path: String| {
            let mut names = Vec::new();
            for entry in std::fs::read_dir(&path).map_err(|e| io_fault("list", &path, e))? {
                let entry = entry.map_err(|e| io_fault("list", &path, e))?;
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            Ok(names)
        })?,
    )?;
    Ok(module)
}

fn io_fault(op: &str, path: &str, err: std::io::Error) -> mlua::Error {
    mlua::Error::runtime(format!("fs.{op} {path:?}: {err}"))
}

/// Sorted, de-duplicated inventory of installed modules: the engine's
/// preloaded libraries, the gateway modules, and Lua modules found on
/// `module_paths`.
pub fn inventory(loaded: &Table, module_paths: &[String]) -> mlua::Result<Vec<String>> {
    let mut names = BTreeSet::new();
    for pair in loaded.pairs::<String, Value>() {
        let (name, _) = pair?;
        if name != "_G" {
            names.insert(name);
        }
    }
    names.extend(GATEWAY_MODULES.iter().map(|n| n.to_string()));
    for dir in module_paths {
        scan_module_dir(Path::new(dir), &mut names);
    }
    Ok(names.into_iter().collect())
}

fn scan_module_dir(dir: &Path, names: &mut BTreeSet<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(path = %dir.display(), error = %e, "module path not readable");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if path.join("init.lua").is_file() {
                names.insert(entry.file_name().to_string_lossy().into_owned());
            }
        } else if path.extension().is_some_and(|ext| ext == "lua") {
            if let Some(stem) = path.file_stem() {
                names.insert(stem.to_string_lossy().into_owned());
            }
        }
    }
}
