//! Operator-supplied scalar functions.
//!
//! Configuration files may embed Lua function definitions, globally or inline
//! on a join part. Each definition is compiled into an embedded Lua state and
//! bound into the run database as a SQLite scalar function of matching arity.
//!
//! Trust boundary: function source executes with full host privileges. The
//! configuration file is trusted input; there is no sandbox.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;

use mlua::{Function, Lua, Value as LuaValue, Variadic};
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::store::value_to_text;

/// Every definition block must begin with this token on its first line.
pub const DEFINITION_TOKEN: &str = "function";

#[derive(Debug, Error)]
pub enum FunctionError {
    #[error("custom function source does not start with '{DEFINITION_TOKEN}': {preview}")]
    MalformedHeader { preview: String },

    #[error("custom function '{name}' failed to compile: {detail}")]
    Compile { name: String, detail: String },

    #[error("failed to bind custom function '{name}': {source}")]
    Bind {
        name: String,
        #[source]
        source: rusqlite::Error,
    },
}

struct CompiledFunction {
    name: String,
    arity: usize,
    callable: Function,
}

/// Run-scoped registry of compiled functions, owned by the run controller
/// and bound explicitly into each join's connection.
pub struct FunctionRegistry {
    lua: Lua,
    functions: BTreeMap<String, CompiledFunction>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            lua: Lua::new(),
            functions: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn arity_of(&self, name: &str) -> Option<usize> {
        self.functions.get(name).map(|function| function.arity)
    }

    /// Aggregate raw source blocks, split them on the definition boundary
    /// token, and compile each definition. Any malformed header aborts the
    /// whole pass: the configuration is considered structurally broken.
    pub fn compile_sources<S: AsRef<str>>(&mut self, sources: &[S]) -> Result<(), FunctionError> {
        let joined = sources
            .iter()
            .map(|source| source.as_ref())
            .collect::<Vec<_>>()
            .join("\n");
        if joined.trim().is_empty() {
            return Ok(());
        }
        for block in split_definitions(&joined) {
            self.compile(&block)?;
        }
        Ok(())
    }

    /// Compile one definition. A later definition under the same name
    /// replaces the earlier one for all subsequent joins in the run.
    pub fn compile(&mut self, source: &str) -> Result<(), FunctionError> {
        let header = parse_header(source)?;

        self.lua
            .load(source)
            .set_name(header.name.clone())
            .exec()
            .map_err(|lua_error| FunctionError::Compile {
                name: header.name.clone(),
                detail: lua_error.to_string(),
            })?;

        let callable: Function = self
            .lua
            .globals()
            .get(header.name.as_str())
            .map_err(|lua_error| FunctionError::Compile {
                name: header.name.clone(),
                detail: lua_error.to_string(),
            })?;

        debug!(function = %header.name, arity = header.arity, "registered custom function");
        let replaced = self
            .functions
            .insert(
                header.name.clone(),
                CompiledFunction {
                    name: header.name.clone(),
                    arity: header.arity,
                    callable,
                },
            )
            .is_some();
        if replaced {
            debug!(function = %header.name, "custom function redefined; later definition wins");
        }
        Ok(())
    }

    /// Bind every registered function into `conn` as a scalar function.
    pub fn bind_all(&self, conn: &Connection) -> Result<(), FunctionError> {
        for function in self.functions.values() {
            bind(conn, function)?;
        }
        Ok(())
    }
}

/// Bind one compiled function. A runtime failure inside a single invocation
/// is caught here, logged with the function name, and reported to the engine
/// as NULL so the enclosing join keeps running.
fn bind(conn: &Connection, function: &CompiledFunction) -> Result<(), FunctionError> {
    let name = function.name.clone();
    let callable = AssertUnwindSafe(function.callable.clone());

    conn.create_scalar_function(
        &function.name,
        function.arity as i32,
        FunctionFlags::SQLITE_UTF8,
        move |ctx| {
            let args: Variadic<Option<String>> = (0..ctx.len())
                .map(|index| ctx.get_raw(index))
                .map(value_to_text)
                .collect();
            match callable.call::<LuaValue>(args) {
                Ok(value) => Ok(lua_to_text(&name, value)),
                Err(lua_error) => {
                    error!(function = %name, error = %lua_error, "custom function invocation failed");
                    Ok(None)
                }
            }
        },
    )
    .map_err(|source| FunctionError::Bind {
        name: function.name.clone(),
        source,
    })
}

/// Convert a Lua return value to the text-affine cell representation.
fn lua_to_text(name: &str, value: LuaValue) -> Option<String> {
    match value {
        LuaValue::Nil => None,
        LuaValue::Boolean(value) => Some(value.to_string()),
        LuaValue::Integer(value) => Some(value.to_string()),
        LuaValue::Number(value) => Some(value.to_string()),
        LuaValue::String(value) => Some(String::from_utf8_lossy(&value.as_bytes()).into_owned()),
        other => {
            warn!(
                function = %name,
                kind = other.type_name(),
                "custom function returned a non-scalar value; storing NULL"
            );
            None
        }
    }
}

struct FunctionHeader {
    name: String,
    arity: usize,
}

/// Parse `function <name>(<params>)` from the first line of a definition.
fn parse_header(source: &str) -> Result<FunctionHeader, FunctionError> {
    let first_line = source.lines().next().unwrap_or("").trim();
    let malformed = || FunctionError::MalformedHeader {
        preview: preview(first_line),
    };

    let rest = first_line.strip_prefix(DEFINITION_TOKEN).ok_or_else(malformed)?;
    if !rest.starts_with(char::is_whitespace) {
        return Err(malformed());
    }
    let (name_part, params_part) = rest.split_once('(').ok_or_else(malformed)?;
    let name = name_part.trim();
    if name.is_empty() || !is_identifier(name) {
        return Err(malformed());
    }

    let params = params_part.split(')').next().unwrap_or("");
    let arity = params
        .split(',')
        .map(str::trim)
        .filter(|param| !param.is_empty())
        .count();

    Ok(FunctionHeader {
        name: name.to_string(),
        arity,
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn preview(line: &str) -> String {
    const LIMIT: usize = 60;
    if line.len() > LIMIT {
        format!("{}...", &line[..LIMIT])
    } else {
        line.to_string()
    }
}

/// Split concatenated source text into individual definitions on lines that
/// begin with the definition token. Any leading text that is not a definition
/// becomes its own block so header validation rejects it.
fn split_definitions(source: &str) -> Vec<String> {
    let mut blocks: Vec<String> = Vec::new();
    for line in source.lines() {
        let starts_definition = is_definition_header(line);
        if starts_definition || (blocks.is_empty() && !line.trim().is_empty()) {
            blocks.push(String::new());
        }
        if let Some(block) = blocks.last_mut() {
            if !block.is_empty() {
                block.push('\n');
            }
            block.push_str(line);
        }
    }
    blocks
}

fn is_definition_header(line: &str) -> bool {
    line.trim_start()
        .strip_prefix(DEFINITION_TOKEN)
        .is_some_and(|rest| rest.starts_with(char::is_whitespace))
}
