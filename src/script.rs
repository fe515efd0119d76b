//! Script runner: executes one example file in its own interpreter context.
//!
//! Example scripts are JavaScript evaluated by Boa. A script opts in to export
//! by requiring the registration module:
//!
//! ```js
//! const { save_model, get_saved_models } = require("tcv_screenshots");
//!
//! save_model({ solid: "box", size: [10, 10, 10] }, "box", { cadWidth: 500 });
//!
//! function main() {
//!     return get_saved_models();
//! }
//! ```
//!
//! Files that never require the module are not examples and are skipped
//! without being evaluated.

use crate::registry::{ModelRegistry, SavedModel};
use crate::{Error, Result};
use boa_engine::native_function::{NativeFunction, NativeFunctionPointer};
use boa_engine::object::builtins::JsArray;
use boa_engine::{js_string, Context, JsNativeError, JsResult, JsValue, Source};
use log::{debug, error, info, warn};
use std::cell::RefCell;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

/// Module name scripts pass to `require`
pub const API_MODULE: &str = "tcv_screenshots";

/// Name of the function every example must define
pub const ENTRY_POINT: &str = "main";

/// Script-side definitions installed before every example
const PRELUDE: &str = r#"
var console = (function () {
    function fmt(args) {
        return Array.prototype.map.call(args, function (a) {
            return (typeof a === 'object' && a !== null) ? JSON.stringify(a) : String(a);
        }).join(' ');
    }
    return {
        log: function () { __tcv_log('info', fmt(arguments)); },
        info: function () { __tcv_log('info', fmt(arguments)); },
        debug: function () { __tcv_log('debug', fmt(arguments)); },
        warn: function () { __tcv_log('warn', fmt(arguments)); },
        error: function () { __tcv_log('error', fmt(arguments)); }
    };
})();
var tcv_screenshots = Object.freeze({
    save_model: __tcv_save_model,
    get_saved_models: __tcv_get_saved_models,
    clear_saved_models: __tcv_clear_saved_models
});
function require(name) {
    if (name === 'tcv_screenshots') {
        return tcv_screenshots;
    }
    throw new Error("Cannot find module '" + name + "'");
}
"#;

/// Interpreter limits for one example run
#[derive(Debug, Clone)]
pub struct ScriptConfig {
    /// Wall-clock bound for evaluating the file and calling `main()`
    pub timeout_ms: u64,
    /// Maximum loop iterations before Boa throws (0 => disabled)
    pub loop_iteration_limit: u64,
    /// Maximum recursion depth before Boa throws (usize::MAX => disabled)
    pub recursion_limit: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            loop_iteration_limit: 10_000_000,
            recursion_limit: 1024,
        }
    }
}

/// What running a file produced
#[derive(Debug)]
pub enum ScriptOutcome {
    /// The file does not reference the registration API
    Skipped,
    /// The registry snapshot returned by `main()`
    Models(Vec<SavedModel>),
}

/// Why an evaluation failed, before it is tied to a path
enum Failure {
    Script(String),
    InvalidReturn(String),
}

/// State the native functions reach while a script runs on this thread
struct RunState {
    registry: ModelRegistry,
    label: String,
}

thread_local! {
    static ACTIVE: RefCell<Option<RunState>> = RefCell::new(None);
}

/// Runs example files one at a time
#[derive(Debug, Clone, Default)]
pub struct ScriptRunner {
    config: ScriptConfig,
}

impl ScriptRunner {
    pub fn new(config: ScriptConfig) -> Self {
        Self { config }
    }

    /// Read `path`, skip it if it is not an example, otherwise run it against
    /// `registry`. The caller is expected to have cleared the registry.
    pub fn run_file(&self, path: &Path, registry: &mut ModelRegistry) -> Result<ScriptOutcome> {
        let source = std::fs::read_to_string(path).map_err(|e| Error::ScriptExecutionError {
            path: path.to_path_buf(),
            cause: format!("cannot read file: {}", e),
        })?;

        if !uses_export_api(&source) {
            debug!("{} does not require '{}'", path.display(), API_MODULE);
            return Ok(ScriptOutcome::Skipped);
        }

        self.run_source(path, source, registry).map(ScriptOutcome::Models)
    }

    /// Evaluate `source`, call its entry point and return the models it
    /// registered. The registry keeps its entries afterwards.
    pub fn run_source(&self, path: &Path, source: String, registry: &mut ModelRegistry) -> Result<Vec<SavedModel>> {
        let (tx, rx) = mpsc::channel();
        let lent = std::mem::take(registry);
        let limits = self.config.clone();
        let label = path.display().to_string();

        // Boa contexts are not Send; the interpreter lives and dies on its own thread
        std::thread::Builder::new()
            .name("tcv-script".into())
            .spawn(move || {
                let result = execute(label, &source, lent, &limits);
                let _ = tx.send(result);
            })
            .map_err(|e| Error::ScriptExecutionError {
                path: path.to_path_buf(),
                cause: format!("failed to spawn interpreter thread: {}", e),
            })?;

        match rx.recv_timeout(Duration::from_millis(self.config.timeout_ms)) {
            Ok((returned, outcome)) => {
                *registry = returned;
                match outcome {
                    Ok(()) => Ok(registry.get_saved_models().to_vec()),
                    Err(Failure::Script(cause)) => Err(Error::ScriptExecutionError { path: path.to_path_buf(), cause }),
                    Err(Failure::InvalidReturn(found)) => Err(Error::InvalidReturnError { path: path.to_path_buf(), found }),
                }
            }
            Err(RecvTimeoutError::Timeout) => Err(Error::ScriptExecutionError {
                path: path.to_path_buf(),
                cause: format!("script timed out after {}ms", self.config.timeout_ms),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ScriptExecutionError {
                path: path.to_path_buf(),
                cause: "interpreter thread exited without a result".to_string(),
            }),
        }
    }
}

fn execute(label: String, source: &str, registry: ModelRegistry, limits: &ScriptConfig) -> (ModelRegistry, std::result::Result<(), Failure>) {
    ACTIVE.with(|slot| *slot.borrow_mut() = Some(RunState { registry, label }));
    let outcome = evaluate(source, limits);
    let registry = ACTIVE
        .with(|slot| slot.borrow_mut().take())
        .map(|state| state.registry)
        .unwrap_or_default();
    (registry, outcome)
}

fn evaluate(source: &str, limits: &ScriptConfig) -> std::result::Result<(), Failure> {
    let mut ctx = Context::default();
    if limits.loop_iteration_limit > 0 {
        ctx.runtime_limits_mut().set_loop_iteration_limit(limits.loop_iteration_limit);
    }
    if limits.recursion_limit < usize::MAX {
        ctx.runtime_limits_mut().set_recursion_limit(limits.recursion_limit);
    }

    install_api(&mut ctx).map_err(|e| Failure::Script(format!("failed to install prelude: {}", e)))?;

    ctx.eval(Source::from_bytes(source.as_bytes()))
        .map_err(|e| Failure::Script(format!("Script thrown: {}", e)))?;

    let entry = ctx
        .global_object()
        .get(js_string!("main"), &mut ctx)
        .map_err(|e| Failure::Script(e.to_string()))?;
    let entry = entry
        .as_callable()
        .cloned()
        .ok_or_else(|| Failure::Script(format!("no {}() entry point defined", ENTRY_POINT)))?;

    let returned = entry
        .call(&JsValue::undefined(), &[], &mut ctx)
        .map_err(|e| Failure::Script(format!("{}() threw: {}", ENTRY_POINT, e)))?;

    check_return(&returned, &mut ctx).map_err(Failure::InvalidReturn)
}

fn install_api(ctx: &mut Context) -> JsResult<()> {
    let natives: [(&str, usize, NativeFunctionPointer); 4] = [
        ("__tcv_save_model", 3, save_model_native),
        ("__tcv_get_saved_models", 0, get_saved_models_native),
        ("__tcv_clear_saved_models", 0, clear_saved_models_native),
        ("__tcv_log", 2, log_native),
    ];
    for (name, length, f) in natives {
        ctx.register_global_builtin_callable(name.into(), length, NativeFunction::from_fn_ptr(f))?;
    }
    ctx.eval(Source::from_bytes(PRELUDE.as_bytes()))?;
    Ok(())
}

/// Accept only the array handed out by `get_saved_models()`
fn check_return(value: &JsValue, ctx: &mut Context) -> std::result::Result<(), String> {
    let Some(obj) = value.as_object() else {
        let found = if value.is_undefined() {
            "undefined"
        } else if value.is_null() {
            "null"
        } else if value.is_string() {
            "a string"
        } else if value.is_number() {
            "a number"
        } else if value.is_boolean() {
            "a boolean"
        } else {
            "a primitive value"
        };
        return Err(found.to_string());
    };
    if obj.is_callable() {
        return Err("a function".to_string());
    }
    if !obj.is_array() {
        return Err("an object (a bare model?)".to_string());
    }
    let branded = obj
        .get(js_string!("__tcv_saved_models"), ctx)
        .map(|v| v.as_boolean() == Some(true))
        .unwrap_or(false);
    if branded {
        Ok(())
    } else {
        Err("an array that was not produced by get_saved_models()".to_string())
    }
}

fn with_registry<T>(f: impl FnOnce(&mut ModelRegistry) -> std::result::Result<T, String>) -> JsResult<T> {
    ACTIVE
        .with(|slot| match slot.borrow_mut().as_mut() {
            Some(state) => f(&mut state.registry),
            None => Err("model registry is not available outside an example run".to_string()),
        })
        .map_err(|msg| JsNativeError::typ().with_message(msg).into())
}

fn save_model_native(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let model = args.first().cloned().unwrap_or_else(JsValue::undefined);
    if model.is_undefined() || model.is_null() {
        return Err(JsNativeError::typ().with_message("save_model: model is required").into());
    }
    let name = match args.get(1).and_then(JsValue::as_string) {
        Some(s) => s.to_std_string_escaped(),
        None => return Err(JsNativeError::typ().with_message("save_model: name must be a string").into()),
    };

    // Copy out now so later mutation of the script object cannot leak in
    let model = model.to_json(ctx)?;
    let config = match args.get(2) {
        Some(v) if !v.is_undefined() && !v.is_null() => match v.to_json(ctx)? {
            serde_json::Value::Object(map) => Some(map),
            _ => return Err(JsNativeError::typ().with_message("save_model: config must be an object").into()),
        },
        _ => None,
    };

    with_registry(|r| r.save_model(model, &name, config.as_ref()))?;
    Ok(JsValue::undefined())
}

fn get_saved_models_native(_this: &JsValue, _args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let entries = with_registry(|r| {
        Ok(r.get_saved_models()
            .iter()
            .map(|m| serde_json::json!({ "name": m.name, "model": m.model, "config": m.config }))
            .collect::<Vec<_>>())
    })?;

    let array = JsArray::new(ctx);
    for entry in &entries {
        let value = JsValue::from_json(entry, ctx)?;
        array.push(value, ctx)?;
    }
    array.set(js_string!("__tcv_saved_models"), true, false, ctx)?;
    Ok(array.into())
}

fn clear_saved_models_native(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    with_registry(|r| {
        r.clear_saved_models();
        Ok(())
    })?;
    Ok(JsValue::undefined())
}

fn log_native(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    let level = args
        .first()
        .and_then(JsValue::as_string)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_default();
    let text = args.get(1).map(|a| format!("{}", a.display())).unwrap_or_default();
    let label = ACTIVE.with(|slot| slot.borrow().as_ref().map(|s| s.label.clone())).unwrap_or_default();
    match level.as_str() {
        "error" => error!("[{}] {}", label, text),
        "warn" => warn!("[{}] {}", label, text),
        "debug" => debug!("[{}] {}", label, text),
        _ => info!("[{}] {}", label, text),
    }
    Ok(JsValue::undefined())
}

/// Static check for `require("tcv_screenshots")` outside comments and strings.
pub fn uses_export_api(source: &str) -> bool {
    let code = code_outline(source);
    let mut rest = code.as_str();
    while let Some(pos) = rest.find("require") {
        let standalone = rest[..pos]
            .chars()
            .next_back()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '_' || c == '$' || c == '.'));
        let after = &rest[pos + "require".len()..];
        if standalone && requires_api_module(after) {
            return true;
        }
        rest = after;
    }
    false
}

fn requires_api_module(after: &str) -> bool {
    let Some(s) = after.trim_start().strip_prefix('(') else {
        return false;
    };
    let s = s.trim_start();
    let Some(quote) = s.chars().next().filter(|c| *c == '"' || *c == '\'') else {
        return false;
    };
    let s = &s[1..];
    let Some(end) = s.find(quote) else {
        return false;
    };
    &s[..end] == API_MODULE && s[end + 1..].trim_start().starts_with(')')
}

/// Replace `//` and `/* */` comments with a space and blank out string
/// literals, except those spelling the module name, so text inside strings
/// cannot look like a `require` call.
fn code_outline(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut quote: Option<char> = None;
    let mut literal = String::new();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if c == q {
                push_literal(&mut out, &literal);
                out.push(c);
                literal.clear();
                quote = None;
            } else {
                literal.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        literal.push(escaped);
                    }
                }
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => {
                quote = Some(c);
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for skipped in chars.by_ref() {
                    if prev == '*' && skipped == '/' {
                        break;
                    }
                    prev = skipped;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    // unterminated literal
    push_literal(&mut out, &literal);
    out
}

fn push_literal(out: &mut String, literal: &str) {
    if literal == API_MODULE {
        out.push_str(literal);
    } else {
        out.extend(literal.chars().map(|c| if c == '\n' { '\n' } else { ' ' }));
    }
}
