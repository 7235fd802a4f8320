//! Per-file environments
//!
//! An [`Environment`] is the cache-resident bundle built for one served file:
//! the ordered capability sequence, the rendered client stub script, the
//! content type, and the modification fingerprint used for staleness checks.
//!
//! Capability order is a hard invariant: (1) globally registered
//! capabilities, (2) companion module exports, (3) built-in system
//! capabilities. Flattening is last-write-wins, so user code may override
//! global defaults but never the built-ins.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::{json, Map, Value};

use filebase_common::{FilebaseError, Result};

use crate::capability::{
    to_lookup, Capability, CapabilityKind, CapabilityRegistry, CapabilityValue, CallScope,
    HookAction, ShortCircuit,
};
use crate::runtime::{companion_path, CompanionModule, ModuleExport};

/// Name of the built-in self-reference variable.
pub const PAGE_VARIABLE: &str = "page";

/// Name of the built-in procedure that returns the client stub script.
pub const STUB_SCRIPT_PROCEDURE: &str = "render_stub_script";

const CHANNEL_TEMPLATE: &str = include_str!("../assets/channel.js");
const STUB_MARKER: &str = "/*{{stubs}}*/";
const VERSION_MARKER: &str = "{{api_version}}";

/// The per-file capability bundle.
///
/// Environments are immutable once built; the bank replaces them wholesale on
/// invalidation. Never shared across paths.
#[derive(Debug)]
pub struct Environment {
    source_path: PathBuf,
    companion_path: PathBuf,
    companion: Option<CompanionModule>,
    capabilities: Vec<Capability>,
    created_at: SystemTime,
    fingerprint: Vec<SystemTime>,
    stub_script: String,
    content_type: String,
}

impl Environment {
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Derived companion code path, whether or not the file exists.
    pub fn companion_path(&self) -> &Path {
        &self.companion_path
    }

    /// Whether a companion module was present at build time.
    pub fn has_companion(&self) -> bool {
        self.companion.is_some()
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Last-known modification times: source file first, then the companion
    /// file when one was loaded.
    pub fn fingerprint(&self) -> &[SystemTime] {
        &self.fingerprint
    }

    pub fn stub_script(&self) -> &str {
        &self.stub_script
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Looks up a procedure capability by name in the flattened table.
    pub fn procedure(&self, name: &str) -> Option<&Capability> {
        to_lookup(&self.capabilities)
            .get(name)
            .copied()
            .filter(|cap| cap.kind == CapabilityKind::Procedure)
    }

    /// Flattened variable table for the template collaborator.
    ///
    /// Last write wins across kinds too: a later callable shadows an earlier
    /// variable of the same name out of the table.
    pub fn variables(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for cap in &self.capabilities {
            match (&cap.kind, &cap.value) {
                (CapabilityKind::Variable, CapabilityValue::Value(v)) => {
                    map.insert(cap.name.clone(), v.clone());
                }
                _ => {
                    map.remove(&cap.name);
                }
            }
        }
        map
    }

    /// Request hooks in declared order, flattened by name.
    pub fn hooks(&self) -> Vec<&Capability> {
        let mut out: Vec<&Capability> = Vec::new();
        for cap in &self.capabilities {
            if cap.kind != CapabilityKind::RequestHook {
                continue;
            }
            if let Some(slot) = out.iter_mut().find(|c| c.name == cap.name) {
                *slot = cap;
            } else {
                out.push(cap);
            }
        }
        out
    }

    /// Names of every procedure in the flattened table.
    pub fn procedure_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for cap in &self.capabilities {
            if cap.kind != CapabilityKind::Procedure {
                continue;
            }
            if !names.iter().any(|n| n == &cap.name) {
                names.push(cap.name.clone());
            }
        }
        names
    }

    /// Invokes a procedure from the flattened table.
    pub async fn invoke_procedure(
        &self,
        name: &str,
        scope: CallScope,
        args: Vec<Value>,
    ) -> Result<Value> {
        let cap = self
            .procedure(name)
            .ok_or_else(|| FilebaseError::ProcedureNotFound(name.to_owned()))?;
        match &cap.value {
            CapabilityValue::Native(handler) => handler(scope, args).await,
            CapabilityValue::Script(function) => {
                let module = self
                    .companion
                    .as_ref()
                    .ok_or_else(|| FilebaseError::ProcedureNotFound(name.to_owned()))?;
                module.invoke(function, &scope.to_json(), &args)
            }
            CapabilityValue::Value(_) | CapabilityValue::NativeHook(_) => {
                Err(FilebaseError::ProcedureNotFound(name.to_owned()))
            }
        }
    }

    /// Runs one request hook and interprets its outcome.
    pub async fn run_hook(&self, hook: &Capability, scope: CallScope) -> Result<HookAction> {
        match &hook.value {
            CapabilityValue::NativeHook(handler) => handler(scope).await,
            CapabilityValue::Script(function) => {
                let module = self
                    .companion
                    .as_ref()
                    .ok_or_else(|| FilebaseError::ProcedureNotFound(hook.name.clone()))?;
                let result = module.invoke(function, &scope.to_json(), &[])?;
                Ok(match ShortCircuit::from_value(&result) {
                    Some(response) => HookAction::ShortCircuit(response),
                    None => HookAction::Continue,
                })
            }
            _ => Ok(HookAction::Continue),
        }
    }
}

/// Builds fully-populated environments for target files.
///
/// The caller guarantees the target exists; a missing companion file is
/// normal, a malformed one aborts the build with `ModuleLoad` so no partial
/// environment is ever cached.
pub struct EnvironmentBuilder {
    registry: Arc<CapabilityRegistry>,
    code_suffix: String,
    api_version: String,
}

impl EnvironmentBuilder {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        code_suffix: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        EnvironmentBuilder {
            registry,
            code_suffix: code_suffix.into(),
            api_version: api_version.into(),
        }
    }

    /// Builds the environment for `target`.
    pub fn build_sync(&self, target: &Path) -> Result<Environment> {
        let companion_file = companion_path(target, &self.code_suffix);

        // Load the companion module fresh; no stale in-process copy survives.
        let companion = if companion_file.is_file() {
            Some(CompanionModule::load(&companion_file)?)
        } else {
            None
        };

        let mut capabilities = self.registry.snapshot();
        if let Some(module) = &companion {
            for export in module.exports()? {
                capabilities.push(wrap_export(export));
            }
        }

        // Built-ins go last so nothing can override them.
        capabilities.push(Capability::variable(
            PAGE_VARIABLE,
            json!({
                "path": target.to_string_lossy(),
                "api": self.api_version,
            }),
        ));

        let mut procedure_names: Vec<String> = Vec::new();
        for cap in &capabilities {
            if cap.kind == CapabilityKind::Procedure && !procedure_names.contains(&cap.name) {
                procedure_names.push(cap.name.clone());
            }
        }
        if !procedure_names.iter().any(|n| n == STUB_SCRIPT_PROCEDURE) {
            procedure_names.push(STUB_SCRIPT_PROCEDURE.to_owned());
        }

        let stub_script = render_stub_script(&self.api_version, &procedure_names);
        let stub_for_capability = stub_script.clone();
        capabilities.push(Capability::procedure(
            STUB_SCRIPT_PROCEDURE,
            move |_scope, _args| {
                let script = stub_for_capability.clone();
                async move { Ok(Value::String(script)) }
            },
        ));

        let mut fingerprint = vec![modified_time(target)?];
        if let Some(module) = &companion {
            fingerprint.push(modified_time(module.path())?);
        }

        Ok(Environment {
            source_path: target.to_owned(),
            companion_path: companion_file,
            companion,
            capabilities,
            created_at: SystemTime::now(),
            fingerprint,
            stub_script,
            content_type: content_type_for(target),
        })
    }
}

fn wrap_export(export: ModuleExport) -> Capability {
    match export.kind {
        CapabilityKind::Variable => {
            Capability::variable(export.name, export.value.unwrap_or(Value::Null))
        }
        CapabilityKind::Procedure => Capability::script_procedure(export.name),
        CapabilityKind::RequestHook => Capability::script_hook(export.name),
    }
}

fn modified_time(path: &Path) -> Result<SystemTime> {
    Ok(std::fs::metadata(path)?.modified()?)
}

/// MIME lookup with charset for text responses.
fn content_type_for(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let essence = mime.essence_str().to_owned();
    if essence.starts_with("text/")
        || essence == "application/javascript"
        || essence == "application/json"
    {
        format!("{}; charset=utf-8", essence)
    } else {
        essence
    }
}

/// Renders the channel client script with one stub per exposed procedure.
fn render_stub_script(api_version: &str, procedures: &[String]) -> String {
    let mut stubs = String::new();
    for name in procedures {
        let quoted = serde_json::to_string(name).unwrap_or_default();
        stubs.push_str(&format!(
            "filebase[{q}] = function () {{\n        \
             return filebase.call.apply(filebase, [{q}].concat(Array.prototype.slice.call(arguments)));\n    \
             }};\n    ",
            q = quoted
        ));
    }
    CHANNEL_TEMPLATE
        .replace(VERSION_MARKER, api_version)
        .replace(STUB_MARKER, &stubs)
}
