//! Conversion between JSON request values and Lua values.
//!
//! JSON → Lua is exact for everything JSON can express. Lua → JSON is lossy:
//! sequences become arrays, other tables become objects with text keys,
//! byte strings are decoded lossily, and anything without a JSON shape
//! (functions, userdata, non-finite numbers, cyclic references) becomes its
//! textual representation.

use std::collections::HashSet;
use std::ffi::c_void;

use mlua::{Lua, MultiValue, Table, Value};
use serde_json::{Map, Number, Value as Json};

/// Build a Lua value from JSON. `null` becomes `nil`.
pub fn json_to_lua(lua: &Lua, value: &Json) -> mlua::Result<Value> {
    Ok(match value {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::String(lua.create_string(s)?),
        Json::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, json_to_lua(lua, item)?)?;
            }
            Value::Table(table)
        }
        Json::Object(map) => Value::Table(map_to_table(lua, map)?),
    })
}

/// Build a Lua table from a JSON object.
pub fn map_to_table(lua: &Lua, map: &Map<String, Json>) -> mlua::Result<Table> {
    let table = lua.create_table_with_capacity(0, map.len())?;
    for (key, item) in map {
        table.raw_set(key.as_str(), json_to_lua(lua, item)?)?;
    }
    Ok(table)
}

/// Serialize a Lua value for a response.
pub fn lua_to_json(value: &Value) -> Json {
    let mut visiting = HashSet::new();
    to_json(value, &mut visiting)
}

/// Serialize a call's return values: none is `null`, one is itself, several
/// become an array.
pub fn values_to_json(values: MultiValue) -> Json {
    let mut values: Vec<Value> = values.into_iter().collect();
    while matches!(values.last(), Some(Value::Nil)) {
        values.pop();
    }
    match values.len() {
        0 => Json::Null,
        1 => lua_to_json(&values[0]),
        _ => Json::Array(values.iter().map(lua_to_json).collect()),
    }
}

/// Textual representation, honoring `__tostring`.
pub fn textual(value: &Value) -> String {
    match value {
        Value::String(s) => String::from_utf8_lossy(&s.as_bytes()).into_owned(),
        other => other.to_string().unwrap_or_else(|_| format!("{other:?}")),
    }
}

fn to_json(value: &Value, visiting: &mut HashSet<*const c_void>) -> Json {
    match value {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(i) => Json::from(*i),
        Value::Number(n) => Number::from_f64(*n)
            .map(Json::Number)
            .unwrap_or_else(|| Json::String(textual(value))),
        Value::String(_) => Json::String(textual(value)),
        Value::Table(table) => {
            let ptr = table.to_pointer();
            if !visiting.insert(ptr) {
                return Json::String(textual(value));
            }
            let json = table_to_json(table, visiting);
            visiting.remove(&ptr);
            json
        }
        other => Json::String(textual(other)),
    }
}

fn table_to_json(table: &Table, visiting: &mut HashSet<*const c_void>) -> Json {
    let pairs: Vec<(Value, Value)> = table.pairs::<Value, Value>().filter_map(Result::ok).collect();
    let len = table.raw_len();

    if len > 0 && len == pairs.len() {
        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
            let item: Value = table.raw_get(i).unwrap_or(Value::Nil);
            items.push(to_json(&item, visiting));
        }
        return Json::Array(items);
    }

    let mut map = Map::new();
    for (key, item) in &pairs {
        map.insert(key_text(key), to_json(item, visiting));
    }
    Json::Object(map)
}

fn key_text(key: &Value) -> String {
    match key {
        Value::Integer(i) => i.to_string(),
        Value::Boolean(b) => b.to_string(),
        other => textual(other),
    }
}
