//! Built-in restricted command interpreter.
//!
//! Commands operate on the captured [`Scope`] and the session slots only.
//! Function calls are limited to an explicit whitelist of host functions.

mod parser;

use std::{collections::BTreeMap, sync::Arc};

use pausepoint_core::{CommandContext, ControllerFault, ExecError, Interpreter, Scope};
use pausepoint_shm::RegionRegistry;
use serde_json::{Map, Value};
use thiserror::Error;

pub use parser::{Expr, Stmt, parse};

/// Host function callable from scripts.
pub type HostFn = dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync;

/// Script error.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Syntax error: {0}")]
    Syntax(String),
    #[error("Unbound name '{0}'")]
    Unbound(String),
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),
    #[error("{function}: {message}")]
    Host { function: String, message: String },
    #[error("Type error: {0}")]
    Type(String),
}

impl ScriptError {
    pub(crate) fn syntax(message: impl Into<String>) -> Self {
        Self::Syntax(message.into())
    }
}

impl From<ScriptError> for ExecError {
    fn from(err: ScriptError) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Interpreter for the command script language.
///
/// Statements:
///
/// | Statement | Effect |
/// |-----------|--------|
/// | `x = expr` | bind a local |
/// | `global x = expr` | bind in the enclosing scope |
/// | `del x` | remove a binding |
/// | `return expr` | set the result slot |
/// | `next expr` | set the command slot (`null` clears it) |
/// | `continue` | stop and raise the continue signal |
/// | `fault expr [, payload]` | stop and raise a controller fault |
/// | `pass` | nothing |
/// | `f(args)` | call a host function for its side effects |
#[derive(Clone, Default)]
pub struct ScriptInterpreter {
    functions: BTreeMap<String, Arc<HostFn>>,
}

impl ScriptInterpreter {
    /// Create an interpreter with the standard functions `len`, `str`,
    /// `add` and `get`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
            .with_function("len", builtin_len)
            .with_function("str", builtin_str)
            .with_function("add", builtin_add)
            .with_function("get", builtin_get)
    }

    /// Whitelist a host function.
    #[must_use]
    pub fn with_function<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
        self
    }

    /// Expose `share(key, value)` and `fetch(key)` backed by a region
    /// registry.
    #[must_use]
    pub fn with_registry(self, registry: Arc<RegionRegistry>) -> Self {
        let writer = Arc::clone(&registry);
        self.with_function("share", move |args| {
            let [key, value] = args else {
                return Err(format!("expected 2 arguments, got {}", args.len()));
            };
            let key = key.as_str().ok_or("key must be a string")?;
            writer.share(key, value).map_err(|e| e.to_string())?;
            Ok(Value::Null)
        })
        .with_function("fetch", move |args| {
            let [key] = args else {
                return Err(format!("expected 1 argument, got {}", args.len()));
            };
            let key = key.as_str().ok_or("key must be a string")?;
            registry.retrieve(key).map_err(|e| e.to_string())
        })
    }

    /// Names of the whitelisted functions.
    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    fn eval(&self, expr: &Expr, scope: &Scope) -> Result<Value, ScriptError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => scope
                .get(name)
                .ok_or_else(|| ScriptError::Unbound(name.clone())),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item, scope))
                .collect::<Result<Vec<_>, ScriptError>>()
                .map(Value::Array),
            Expr::Object(fields) => fields
                .iter()
                .map(|(key, value)| Ok((key.clone(), self.eval(value, scope)?)))
                .collect::<Result<Map<String, Value>, ScriptError>>()
                .map(Value::Object),
            Expr::Call(name, args) => {
                let function = self
                    .functions
                    .get(name)
                    .ok_or_else(|| ScriptError::UnknownFunction(name.clone()))?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                function(&args).map_err(|message| ScriptError::Host {
                    function: name.clone(),
                    message,
                })
            }
        }
    }
}

impl std::fmt::Debug for ScriptInterpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptInterpreter")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Interpreter for ScriptInterpreter {
    fn execute(&self, command: &str, cx: &mut CommandContext<'_>) -> Result<(), ExecError> {
        let program = parse(command)?;
        for stmt in &program {
            match stmt {
                Stmt::Pass => {}
                Stmt::Continue => return Err(ExecError::Continue),
                Stmt::Del(name) => {
                    cx.scope
                        .remove(name)
                        .ok_or_else(|| ScriptError::Unbound(name.clone()))?;
                }
                Stmt::Assign {
                    name,
                    global,
                    value,
                } => {
                    let value = self.eval(value, cx.scope)?;
                    if *global {
                        cx.scope.set_global(name.clone(), value);
                    } else {
                        cx.scope.set(name.clone(), value);
                    }
                }
                Stmt::Return(expr) => cx.slots.result = Some(self.eval(expr, cx.scope)?),
                Stmt::Next(expr) => {
                    cx.slots.command = match self.eval(expr, cx.scope)? {
                        Value::Null => None,
                        Value::String(text) => Some(text),
                        other => {
                            return Err(
                                ScriptError::Type(format!("next expects a string, got {other}")).into(),
                            );
                        }
                    };
                }
                Stmt::Fault { message, payload } => {
                    let message = match self.eval(message, cx.scope)? {
                        Value::String(text) => text,
                        other => other.to_string(),
                    };
                    let mut fault = ControllerFault::new(message);
                    if let Some(payload) = payload {
                        fault = fault.with_payload(self.eval(payload, cx.scope)?);
                    }
                    return Err(ExecError::Fault(fault));
                }
                Stmt::Expr(expr) => {
                    self.eval(expr, cx.scope)?;
                }
            }
        }
        Ok(())
    }
}

fn builtin_len(args: &[Value]) -> Result<Value, String> {
    let len = match args {
        [Value::String(s)] => s.chars().count(),
        [Value::Array(items)] => items.len(),
        [Value::Object(fields)] => fields.len(),
        [other] => return Err(format!("{other} has no length")),
        _ => return Err(format!("expected 1 argument, got {}", args.len())),
    };
    Ok(Value::from(len))
}

fn builtin_str(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::String(s)] => Ok(Value::String(s.clone())),
        [other] => Ok(Value::String(other.to_string())),
        _ => Err(format!("expected 1 argument, got {}", args.len())),
    }
}

fn builtin_add(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::String(a), Value::String(b)] => Ok(Value::String(format!("{a}{b}"))),
        [Value::Array(a), Value::Array(b)] => Ok(Value::Array(a.iter().chain(b).cloned().collect())),
        [Value::Number(a), Value::Number(b)] => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                if let Some(sum) = a.checked_add(b) {
                    return Ok(Value::from(sum));
                }
            }
            match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::from(a + b)),
                _ => Err("numbers out of range".to_string()),
            }
        }
        [a, b] => Err(format!("cannot add {a} and {b}")),
        _ => Err(format!("expected 2 arguments, got {}", args.len())),
    }
}

fn builtin_get(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Object(fields), Value::String(key)] => Ok(fields.get(key).cloned().unwrap_or(Value::Null)),
        [Value::Array(items), Value::Number(index)] => Ok(index
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or(Value::Null)),
        [container, key] => Err(format!("cannot index {container} with {key}")),
        _ => Err(format!("expected 2 arguments, got {}", args.len())),
    }
}
