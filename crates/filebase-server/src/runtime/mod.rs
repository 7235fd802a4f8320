//! Companion-module runtime
//!
//! Executes a file's companion JavaScript module with the Boa engine. Every
//! load and every invocation happens in a fresh context built from the module
//! source read straight off disk, which is what makes "load module fresh,
//! discard previous instance" an explicit operation instead of a property of
//! an implicit language-level module cache.

pub mod conversions;
pub mod module;


pub use conversions::{js_to_json, json_to_js};
pub use module::{companion_path, CompanionModule, ModuleExport, DEFAULT_CODE_SUFFIX};
