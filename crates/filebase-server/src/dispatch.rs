//! Request classification and dispatch
//!
//! Per-request state machine: resolve the URL against the served root, stat
//! the target, acquire the environment from the bank, run request hooks, then
//! branch into one of three terminal handlers:
//!
//! - a persistent channel upgrade (WebSocket RPC),
//! - a one-shot procedure call (`?api=<version>&call=<name>`),
//! - a rendered template or raw file response.
//!
//! A request that resolves to a missing file or a directory without an index
//! is delegated to the next collaborator in the chain; this server is the end
//! of the chain, so delegation terminates as 404.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode, Uri};
use percent_encoding::percent_decode_str;
use serde_json::Value;

use filebase_common::{FilebaseError, Result};

use crate::bank::{BankConfig, EnvironmentBank};
use crate::capability::{CallScope, CapabilityRegistry, HookAction, ShortCircuit};
use crate::channel;
use crate::environment::{Environment, EnvironmentBuilder, STUB_SCRIPT_PROCEDURE};
use crate::render::{FileRenderer, JinjaRenderer};

/// Type alias for hyper incoming requests.
pub type HyperRequest = Request<Incoming>;

/// Type alias for hyper responses with full body.
pub type HyperResponse = Response<Full<Bytes>>;

const QUERY_API: &str = "api";
const QUERY_CALL: &str = "call";
const QUERY_JSON: &str = "json";
const QUERY_PRETTY: &str = "pretty";

const JS_CONTENT_TYPE: &str = "application/javascript; charset=utf-8";
const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Serving configuration.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Root directory of the served tree.
    pub root: PathBuf,
    /// API version accepted in one-shot call queries.
    pub api_version: String,
    /// Companion code file suffix (`index.html` -> `index.<suffix>`).
    pub code_suffix: String,
    /// File appended to directory requests.
    pub index_file: String,
    /// Extensions rendered through the template collaborator; everything
    /// else is a raw byte transfer.
    pub template_extensions: Vec<String>,
}

impl ServeConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ServeConfig {
            root: root.into(),
            api_version: "v1".into(),
            code_suffix: crate::runtime::DEFAULT_CODE_SUFFIX.into(),
            index_file: "index.html".into(),
            template_extensions: vec!["html".into(), "htm".into(), "j2".into(), "jinja".into()],
        }
    }
}

/// A resolved request: target file plus parsed query.
#[derive(Debug, Clone, PartialEq)]
struct ResolvedRequest {
    file: PathBuf,
    query: HashMap<String, String>,
}

/// The per-request classifier and terminal handlers.
pub struct Dispatcher {
    config: ServeConfig,
    bank: Arc<EnvironmentBank<EnvironmentBuilder>>,
    renderer: Arc<dyn FileRenderer>,
}

impl Dispatcher {
    pub fn new(
        config: ServeConfig,
        registry: Arc<CapabilityRegistry>,
        bank_config: BankConfig,
    ) -> Self {
        let builder = EnvironmentBuilder::new(
            registry,
            config.code_suffix.clone(),
            config.api_version.clone(),
        );
        Dispatcher {
            bank: Arc::new(EnvironmentBank::new(builder, bank_config)),
            renderer: Arc::new(JinjaRenderer::new()),
            config,
        }
    }

    /// Swaps the file-render collaborator.
    pub fn with_renderer(mut self, renderer: Arc<dyn FileRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn bank(&self) -> &Arc<EnvironmentBank<EnvironmentBuilder>> {
        &self.bank
    }

    /// Runs one request through the state machine.
    ///
    /// Errors returned here are request-scoped; the server loop maps them to
    /// a 500 without touching other connections.
    pub async fn dispatch(
        &self,
        mut req: HyperRequest,
        peer: Option<SocketAddr>,
    ) -> Result<HyperResponse> {
        self.bank.maybe_clean();

        let resolved = self.resolve(req.uri())?;
        if !resolved.file.is_file() {
            // next collaborator in the chain; this server is the chain's end
            return Ok(text_response(
                StatusCode::NOT_FOUND,
                TEXT_CONTENT_TYPE,
                "not found",
            ));
        }

        let env = self.bank.get(&resolved.file).await?;
        let scope = CallScope {
            path: resolved.file.clone(),
            query: resolved.query.clone(),
            peer,
            pusher: None,
        };

        for hook in env.hooks() {
            match env.run_hook(hook, scope.clone()).await? {
                HookAction::Continue => {}
                HookAction::ShortCircuit(response) => {
                    tracing::debug!(hook = %hook.name, "request short-circuited by hook");
                    return Ok(short_circuit_response(response));
                }
            }
        }

        if hyper_tungstenite::is_upgrade_request(&req) {
            let (response, websocket) = hyper_tungstenite::upgrade(&mut req, None)
                .map_err(|e| FilebaseError::Transport(e.to_string()))?;
            let env = env.clone();
            let scope = scope.clone();
            tokio::spawn(async move {
                if let Err(e) = channel::serve_channel(websocket, env, scope).await {
                    tracing::warn!("channel terminated: {}", e);
                }
            });
            return Ok(response);
        }

        if let Some(name) = self.oneshot_call(&resolved.query) {
            return self.serve_oneshot(req, env, scope, &name, &resolved.query).await;
        }

        self.serve_file(&env, &resolved.file)
    }

    /// Parses path and query; rejects traversal and undecodable paths.
    fn resolve(&self, uri: &Uri) -> Result<ResolvedRequest> {
        let decoded = percent_decode_str(uri.path())
            .decode_utf8()
            .map_err(|e| FilebaseError::PathParse(format!("undecodable path: {}", e)))?;

        let mut file = self.config.root.clone();
        for component in decoded.trim_start_matches('/').split('/') {
            if component.is_empty() || component == "." {
                continue;
            }
            if component == ".." {
                return Err(FilebaseError::PathParse(
                    "path traversal is not allowed".into(),
                ));
            }
            file.push(component);
        }
        if file.is_dir() {
            file.push(&self.config.index_file);
        }

        let mut query = HashMap::new();
        for (key, value) in form_urlencoded::parse(uri.query().unwrap_or("").as_bytes()) {
            query.insert(key.into_owned(), value.into_owned());
        }

        Ok(ResolvedRequest { file, query })
    }

    /// Whether the query identifies a one-shot procedure call.
    fn oneshot_call(&self, query: &HashMap<String, String>) -> Option<String> {
        if query.get(QUERY_API)? != &self.config.api_version {
            return None;
        }
        query.get(QUERY_CALL).filter(|name| !name.is_empty()).cloned()
    }

    async fn serve_oneshot(
        &self,
        req: HyperRequest,
        env: Arc<Environment>,
        scope: CallScope,
        name: &str,
        query: &HashMap<String, String>,
    ) -> Result<HyperResponse> {
        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| FilebaseError::Transport(format!("failed to read body: {}", e)))?
            .to_bytes();

        let args = match normalize_args(&body) {
            Ok(args) => args,
            Err(e) => {
                return Ok(text_response(
                    StatusCode::BAD_REQUEST,
                    TEXT_CONTENT_TYPE,
                    e.to_string(),
                ));
            }
        };

        match env.invoke_procedure(name, scope, args).await {
            Ok(result) => {
                // the stub script is a script, not data
                if name == STUB_SCRIPT_PROCEDURE {
                    if let Value::String(script) = &result {
                        return Ok(text_response(StatusCode::OK, JS_CONTENT_TYPE, script.clone()));
                    }
                }
                let json_forced = flag(query, QUERY_JSON);
                let pretty = flag(query, QUERY_PRETTY);
                let (body, content_type) = serialize_result(&result, json_forced, pretty);
                Ok(text_response(StatusCode::OK, content_type, body))
            }
            Err(FilebaseError::ProcedureNotFound(name)) => Ok(text_response(
                StatusCode::NOT_FOUND,
                TEXT_CONTENT_TYPE,
                format!("unknown procedure: {}", name),
            )),
            Err(e) => {
                tracing::error!(procedure = name, "one-shot call failed: {}", e);
                Ok(text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    TEXT_CONTENT_TYPE,
                    e.to_string(),
                ))
            }
        }
    }

    fn serve_file(&self, env: &Environment, path: &Path) -> Result<HyperResponse> {
        if self.is_template(path) {
            let variables = env.variables();
            let rendered = self.renderer.render(path, &variables)?;
            Ok(text_response(StatusCode::OK, env.content_type(), rendered))
        } else {
            let bytes = std::fs::read(path)?;
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", env.content_type())
                .body(Full::new(Bytes::from(bytes)))
                .unwrap())
        }
    }

    fn is_template(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .is_some_and(|ext| self.config.template_extensions.contains(&ext))
    }
}

/// Normalizes a one-shot request body into an argument list.
///
/// Empty body -> no arguments; a JSON array is the argument list; any other
/// JSON value becomes a one-element list.
fn normalize_args(body: &[u8]) -> Result<Vec<Value>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_slice::<Value>(body)? {
        Value::Array(items) => Ok(items),
        single => Ok(vec![single]),
    }
}

/// One-shot result serialization.
///
/// `null` yields an empty body, strings pass through raw, everything else is
/// JSON-encoded. `json_forced` JSON-encodes strings and null too; `pretty`
/// pretty-prints JSON output.
fn serialize_result(result: &Value, json_forced: bool, pretty: bool) -> (String, &'static str) {
    if !json_forced {
        match result {
            Value::Null => return (String::new(), TEXT_CONTENT_TYPE),
            Value::String(s) => return (s.clone(), TEXT_CONTENT_TYPE),
            _ => {}
        }
    }
    let body = if pretty {
        serde_json::to_string_pretty(result).unwrap_or_default()
    } else {
        serde_json::to_string(result).unwrap_or_default()
    };
    (body, JSON_CONTENT_TYPE)
}

fn flag(query: &HashMap<String, String>, key: &str) -> bool {
    matches!(query.get(key).map(String::as_str), Some("true") | Some("1"))
}

fn text_response(
    status: StatusCode,
    content_type: &str,
    body: impl Into<String>,
) -> HyperResponse {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(body.into())))
        .unwrap()
}

fn short_circuit_response(sc: ShortCircuit) -> HyperResponse {
    let status = StatusCode::from_u16(sc.status).unwrap_or(StatusCode::OK);
    let content_type = sc.content_type.as_deref().unwrap_or(TEXT_CONTENT_TYPE);
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(sc.body)))
        .unwrap()
}

/// Maps a request-scoped error to its terminal response.
pub(crate) fn error_response(error: &FilebaseError) -> HyperResponse {
    let status = match error {
        FilebaseError::PathParse(_) | FilebaseError::ModuleLoad { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        FilebaseError::ProcedureNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    text_response(status, TEXT_CONTENT_TYPE, error.to_string())
}
