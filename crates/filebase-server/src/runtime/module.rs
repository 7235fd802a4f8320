//! Companion module loading and invocation
//!
//! A companion module is the JavaScript file colocated with a served file
//! (`index.html` -> `index.code.js`). Evaluating it against the `page`
//! prelude populates two registries:
//!
//! - `page.__registry` - procedures and variables, via `page.register(name, value)`
//! - `page.__hooks` - request hooks, via `page.hook(name, fn)`
//!
//! The module source is re-read from disk on every [`CompanionModule::load`]
//! and evaluated in a fresh Boa context per enumeration/invocation, so a
//! stale in-process copy can never survive a rebuild.

use std::path::{Path, PathBuf};

use boa_engine::{js_string, Context, JsObject, JsValue, Source};
use serde_json::Value;

use filebase_common::{FilebaseError, Result};

use super::conversions::{js_to_json, json_to_js};
use crate::capability::CapabilityKind;

/// Default suffix of companion code files: `name.ext` -> `name.code.js`.
pub const DEFAULT_CODE_SUFFIX: &str = "code.js";

/// Evaluated before every module to provide the registration API.
const PAGE_PRELUDE: &str = r#"
var page = {
    __registry: {},
    __hooks: {},
    register: function (name, value) {
        if (typeof name !== "string") {
            throw new TypeError("page.register: name must be a string");
        }
        this.__registry[name] = value;
    },
    hook: function (name, fn) {
        if (typeof name !== "string") {
            throw new TypeError("page.hook: name must be a string");
        }
        if (typeof fn !== "function") {
            throw new TypeError("page.hook: handler must be a function");
        }
        this.__hooks[name] = fn;
    }
};
"#;

/// A registration surfaced by a companion module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleExport {
    pub name: String,
    pub kind: CapabilityKind,
    /// Present for variables only; procedures and hooks are invoked by name.
    pub value: Option<Value>,
}

/// A loaded companion module: path plus the source read at load time.
///
/// The struct holds no evaluated state. Enumeration and invocation each build
/// a fresh context, which keeps the type `Send + Sync` (Boa contexts are
/// neither) and makes invalidation a matter of dropping the struct.
#[derive(Debug, Clone)]
pub struct CompanionModule {
    path: PathBuf,
    source: String,
}

impl CompanionModule {
    /// Reads the module source from disk. No evaluation happens here; a
    /// syntactically broken module fails on first use.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| FilebaseError::module_load(path.display(), e.to_string()))?;
        Ok(CompanionModule {
            path: path.to_owned(),
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_error(&self, message: impl Into<String>) -> FilebaseError {
        FilebaseError::module_load(self.path.display(), message)
    }

    /// Evaluates prelude + module source in a fresh context.
    fn fresh_context(&self) -> Result<Context> {
        let mut ctx = Context::default();
        ctx.eval(Source::from_bytes(PAGE_PRELUDE))
            .map_err(|e| self.load_error(format!("prelude evaluation failed: {}", e)))?;
        ctx.eval(Source::from_bytes(&self.source))
            .map_err(|e| self.load_error(e.to_string()))?;
        Ok(ctx)
    }

    fn page_member(&self, ctx: &mut Context, member: &str) -> Result<JsObject> {
        let page = ctx
            .global_object()
            .get(js_string!("page"), ctx)
            .map_err(|e| self.load_error(format!("page lookup failed: {}", e)))?;
        let page = page
            .as_object()
            .cloned()
            .ok_or_else(|| self.load_error("page is not an object"))?;
        let value = page
            .get(js_string!(member.to_owned()), ctx)
            .map_err(|e| self.load_error(format!("{} lookup failed: {}", member, e)))?;
        value
            .as_object()
            .cloned()
            .ok_or_else(|| self.load_error(format!("{} is not an object", member)))
    }

    fn string_keys(&self, object: &JsObject, ctx: &mut Context) -> Result<Vec<String>> {
        use boa_engine::property::PropertyKey;
        let keys = object
            .own_property_keys(ctx)
            .map_err(|e| self.load_error(format!("key enumeration failed: {}", e)))?;
        let mut names = Vec::with_capacity(keys.len());
        for key in keys {
            match key {
                PropertyKey::String(s) => names.push(s.to_std_string().map_err(|e| {
                    self.load_error(format!("key conversion failed: {:?}", e))
                })?),
                PropertyKey::Index(i) => names.push(i.get().to_string()),
                PropertyKey::Symbol(_) => continue,
            }
        }
        Ok(names)
    }

    /// Enumerates the module's registrations in declaration order.
    ///
    /// Variable values are converted to JSON eagerly; procedures and hooks
    /// are recorded by name and invoked later in their own fresh contexts.
    pub fn exports(&self) -> Result<Vec<ModuleExport>> {
        let mut ctx = self.fresh_context()?;
        let mut exports = Vec::new();

        let registry = self.page_member(&mut ctx, "__registry")?;
        for name in self.string_keys(&registry, &mut ctx)? {
            let value = registry
                .get(js_string!(name.clone()), &mut ctx)
                .map_err(|e| self.load_error(format!("registry read failed: {}", e)))?;
            let callable = value.as_object().is_some_and(|o| o.is_callable());
            if callable {
                exports.push(ModuleExport {
                    name,
                    kind: CapabilityKind::Procedure,
                    value: None,
                });
            } else {
                let json = js_to_json(&value, &mut ctx)
                    .map_err(|e| self.load_error(e.to_string()))?;
                exports.push(ModuleExport {
                    name,
                    kind: CapabilityKind::Variable,
                    value: Some(json),
                });
            }
        }

        let hooks = self.page_member(&mut ctx, "__hooks")?;
        for name in self.string_keys(&hooks, &mut ctx)? {
            exports.push(ModuleExport {
                name,
                kind: CapabilityKind::RequestHook,
                value: None,
            });
        }

        Ok(exports)
    }

    /// Invokes a registered procedure or hook by name.
    ///
    /// The function receives `(page, ...args)` where `page` is the JSON call
    /// scope. Runs in a fresh context; an exception inside the handler is a
    /// `ProcedureInvocation` error, never a crash.
    pub fn invoke(&self, name: &str, scope: &Value, args: &[Value]) -> Result<Value> {
        let mut ctx = self.fresh_context()?;

        let registry = self.page_member(&mut ctx, "__registry")?;
        let mut func = registry
            .get(js_string!(name.to_owned()), &mut ctx)
            .map_err(|e| self.load_error(format!("registry read failed: {}", e)))?;
        if func.is_undefined() {
            let hooks = self.page_member(&mut ctx, "__hooks")?;
            func = hooks
                .get(js_string!(name.to_owned()), &mut ctx)
                .map_err(|e| self.load_error(format!("hook read failed: {}", e)))?;
        }
        if func.is_undefined() {
            return Err(FilebaseError::ProcedureNotFound(name.to_owned()));
        }
        let func = func
            .as_object()
            .filter(|o| o.is_callable())
            .cloned()
            .ok_or_else(|| FilebaseError::invocation(name, "registered value is not callable"))?;

        let mut js_args = Vec::with_capacity(args.len() + 1);
        js_args.push(json_to_js(scope, &mut ctx)?);
        for arg in args {
            js_args.push(json_to_js(arg, &mut ctx)?);
        }

        let result = func
            .call(&JsValue::undefined(), &js_args, &mut ctx)
            .map_err(|e| FilebaseError::invocation(name, e.to_string()))?;
        js_to_json(&result, &mut ctx)
    }
}

/// Computes the companion code path for a target file.
///
/// The final extension group is replaced by the suffix:
/// `public/index.html` with suffix `code.js` -> `public/index.code.js`.
/// Files without an extension get the suffix appended after a dot.
pub fn companion_path(target: &Path, suffix: &str) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{}.{}", stem, suffix))
}
