//! File-render collaborator seam
//!
//! Template engine internals are out of scope for the core: the dispatcher
//! only asks a [`FileRenderer`] to render a file with a variable set. The
//! default implementation delegates to minijinja.

use std::path::Path;

use serde_json::{Map, Value};

use filebase_common::{FilebaseError, Result};

/// Renders a template file with the environment's variable set.
pub trait FileRenderer: Send + Sync {
    fn render(&self, path: &Path, variables: &Map<String, Value>) -> Result<String>;
}

/// minijinja-backed renderer. Reads the template source per render; caching
/// is the environment bank's job, not the renderer's.
#[derive(Default)]
pub struct JinjaRenderer;

impl JinjaRenderer {
    pub fn new() -> Self {
        JinjaRenderer
    }
}

impl FileRenderer for JinjaRenderer {
    fn render(&self, path: &Path, variables: &Map<String, Value>) -> Result<String> {
        let source = std::fs::read_to_string(path)?;
        let env = minijinja::Environment::new();
        let template = env.template_from_str(&source).map_err(|e| FilebaseError::Render {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        template
            .render(minijinja::Value::from_serialize(variables))
            .map_err(|e| FilebaseError::Render {
                path: path.display().to_string(),
                message: e.to_string(),
            })
    }
}
