//! Capability Objects
//!
//! A capability is a named value a file's environment exposes to templates or
//! remote callers: a procedure, a plain variable, or a request hook.
//!
//! Classification is explicit and tagged, never inferred at call sites:
//! callable values are procedures, everything else is a variable, and request
//! hooks are always tagged at construction.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;

use filebase_common::{ChannelMessage, Result};

/// Classification of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    /// Callable from the client (channel or one-shot call).
    Procedure,
    /// Plain value supplied to the template variable set.
    Variable,
    /// Runs in the request pipeline before dispatch; may short-circuit.
    RequestHook,
}

/// Handle for pushing out-of-band events down an open channel.
///
/// Only present in the [`CallScope`] of procedures invoked over a channel;
/// one-shot calls have no channel to push on.
#[derive(Clone)]
pub struct EventPusher {
    tx: UnboundedSender<ChannelMessage>,
}

impl EventPusher {
    pub(crate) fn new(tx: UnboundedSender<ChannelMessage>) -> Self {
        EventPusher { tx }
    }

    /// Sends a named event to the client. Fire-and-forget: a closed channel
    /// drops the event.
    pub fn push(&self, event: impl Into<String>, payload: Value) {
        let _ = self.tx.send(ChannelMessage::event(event, payload));
    }
}

/// Per-invocation context handed to procedures and hooks.
#[derive(Clone)]
pub struct CallScope {
    /// Resolved filesystem path of the target file.
    pub path: PathBuf,
    /// Parsed query parameters of the originating request.
    pub query: HashMap<String, String>,
    /// Peer address, when known.
    pub peer: Option<SocketAddr>,
    /// Push handle, present only for channel invocations.
    pub pusher: Option<EventPusher>,
}

impl CallScope {
    /// JSON form of the scope, passed as the first argument to companion
    /// module procedures (the module-side `page` argument).
    pub fn to_json(&self) -> Value {
        json!({
            "path": self.path.to_string_lossy(),
            "query": self.query,
            "peer": self.peer.map(|p| p.to_string()),
        })
    }
}

/// Async native procedure handler.
pub type NativeHandler =
    Arc<dyn Fn(CallScope, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Async native request hook handler.
pub type HookHandler =
    Arc<dyn Fn(CallScope) -> BoxFuture<'static, Result<HookAction>> + Send + Sync>;

/// Outcome of a request hook.
pub enum HookAction {
    /// Continue down the pipeline.
    Continue,
    /// Terminate the pipeline with this response.
    ShortCircuit(ShortCircuit),
}

/// Response produced by a short-circuiting hook.
#[derive(Debug, Clone, PartialEq)]
pub struct ShortCircuit {
    pub status: u16,
    pub body: String,
    pub content_type: Option<String>,
}

impl ShortCircuit {
    /// Interprets a companion-module hook result.
    ///
    /// `null`/`undefined` means continue; an object may carry `status`,
    /// `body` and `content_type` fields, each optional.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(ShortCircuit {
            status: obj
                .get("status")
                .and_then(Value::as_u64)
                .map(|s| s as u16)
                .unwrap_or(200),
            body: obj
                .get("body")
                .map(|b| match b {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default(),
            content_type: obj
                .get("content_type")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }
}

/// The value side of a capability.
#[derive(Clone)]
pub enum CapabilityValue {
    /// Plain JSON value.
    Value(Value),
    /// Native Rust procedure.
    Native(NativeHandler),
    /// Native Rust request hook.
    NativeHook(HookHandler),
    /// Function defined by the file's companion module, invoked by name in a
    /// fresh script context.
    Script(String),
}

impl CapabilityValue {
    /// Whether the value is callable.
    pub fn is_callable(&self) -> bool {
        !matches!(self, CapabilityValue::Value(_))
    }
}

impl std::fmt::Debug for CapabilityValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityValue::Value(v) => f.debug_tuple("Value").field(v).finish(),
            CapabilityValue::Native(_) => f.write_str("Native(..)"),
            CapabilityValue::NativeHook(_) => f.write_str("NativeHook(..)"),
            CapabilityValue::Script(name) => f.debug_tuple("Script").field(name).finish(),
        }
    }
}

/// Classifies a capability value: callable → procedure, otherwise variable.
///
/// Pure and side-effect free. Request hooks are never classified; they are
/// tagged explicitly at construction.
pub fn classify(value: &CapabilityValue) -> CapabilityKind {
    if value.is_callable() {
        CapabilityKind::Procedure
    } else {
        CapabilityKind::Variable
    }
}

/// A named, classified capability owned by exactly one environment.
#[derive(Debug, Clone)]
pub struct Capability {
    pub name: String,
    pub kind: CapabilityKind,
    pub value: CapabilityValue,
}

impl Capability {
    /// Wraps a value with automatic classification, back-filling `name` from
    /// the declaring key.
    pub fn auto(name: impl Into<String>, value: CapabilityValue) -> Self {
        let kind = classify(&value);
        Capability {
            name: name.into(),
            kind,
            value,
        }
    }

    /// A plain variable capability.
    pub fn variable(name: impl Into<String>, value: Value) -> Self {
        Capability {
            name: name.into(),
            kind: CapabilityKind::Variable,
            value: CapabilityValue::Value(value),
        }
    }

    /// A native procedure capability.
    pub fn procedure<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallScope, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Capability {
            name: name.into(),
            kind: CapabilityKind::Procedure,
            value: CapabilityValue::Native(Arc::new(move |scope, args| Box::pin(f(scope, args)))),
        }
    }

    /// A native request hook capability. Always explicitly tagged.
    pub fn hook<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookAction>> + Send + 'static,
    {
        Capability {
            name: name.into(),
            kind: CapabilityKind::RequestHook,
            value: CapabilityValue::NativeHook(Arc::new(move |scope| Box::pin(f(scope)))),
        }
    }

    /// A procedure defined by the file's companion module.
    pub fn script_procedure(name: impl Into<String>) -> Self {
        let name = name.into();
        Capability {
            name: name.clone(),
            kind: CapabilityKind::Procedure,
            value: CapabilityValue::Script(name),
        }
    }

    /// A request hook defined by the file's companion module.
    pub fn script_hook(name: impl Into<String>) -> Self {
        let name = name.into();
        Capability {
            name: name.clone(),
            kind: CapabilityKind::RequestHook,
            value: CapabilityValue::Script(name),
        }
    }
}

/// Flattens an ordered capability sequence into a name lookup.
///
/// Last write wins by iteration order, which is what gives later tiers
/// override priority over earlier ones.
pub fn to_lookup(capabilities: &[Capability]) -> HashMap<&str, &Capability> {
    let mut map = HashMap::new();
    for cap in capabilities {
        map.insert(cap.name.as_str(), cap);
    }
    map
}

/// Globally registered capabilities, shared by every environment built while
/// the registry lives.
///
/// Registration order is preserved; it becomes the first tier of every
/// environment's capability sequence.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: RwLock<Vec<Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a capability to the registry.
    pub fn register(&self, capability: Capability) {
        self.capabilities.write().unwrap().push(capability);
    }

    /// Snapshot of the registered capabilities in registration order.
    pub fn snapshot(&self) -> Vec<Capability> {
        self.capabilities.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.capabilities.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_value_is_variable() {
        let value = CapabilityValue::Value(json!({"a": 1}));
        assert_eq!(classify(&value), CapabilityKind::Variable);
    }

    #[test]
    fn test_classify_callables_are_procedures() {
        let native: NativeHandler = Arc::new(|_, _| Box::pin(async { Ok(Value::Null) }));
        assert_eq!(
            classify(&CapabilityValue::Native(native)),
            CapabilityKind::Procedure
        );
        assert_eq!(
            classify(&CapabilityValue::Script("echo".into())),
            CapabilityKind::Procedure
        );
    }

    #[test]
    fn test_hook_is_explicitly_tagged() {
        let cap = Capability::hook("guard", |_scope| async { Ok(HookAction::Continue) });
        assert_eq!(cap.kind, CapabilityKind::RequestHook);
    }

    #[test]
    fn test_to_lookup_last_write_wins() {
        let caps = vec![
            Capability::variable("x", json!(1)),
            Capability::variable("y", json!("keep")),
            Capability::variable("x", json!(2)),
        ];
        let lookup = to_lookup(&caps);
        assert_eq!(lookup.len(), 2);
        match &lookup["x"].value {
            CapabilityValue::Value(v) => assert_eq!(v, &json!(2)),
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn test_registry_preserves_order() {
        let registry = CapabilityRegistry::new();
        registry.register(Capability::variable("a", json!(1)));
        registry.register(Capability::variable("b", json!(2)));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].name, "a");
        assert_eq!(snapshot[1].name, "b");
    }

    #[test]
    fn test_short_circuit_from_value() {
        assert!(ShortCircuit::from_value(&Value::Null).is_none());
        let sc = ShortCircuit::from_value(&json!({"status": 403, "body": "no"})).unwrap();
        assert_eq!(sc.status, 403);
        assert_eq!(sc.body, "no");
        assert_eq!(sc.content_type, None);

        // defaults
        let sc = ShortCircuit::from_value(&json!({})).unwrap();
        assert_eq!(sc.status, 200);
        assert!(sc.body.is_empty());
    }

    #[tokio::test]
    async fn test_native_procedure_invocation() {
        let cap = Capability::procedure("double", |_scope, args| async move {
            let n = args
                .first()
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Ok(json!(n * 2))
        });
        let scope = CallScope {
            path: PathBuf::from("/tmp/x.html"),
            query: HashMap::new(),
            peer: None,
            pusher: None,
        };
        match &cap.value {
            CapabilityValue::Native(f) => {
                let out = f(scope, vec![json!(21)]).await.unwrap();
                assert_eq!(out, json!(42));
            }
            other => panic!("unexpected value: {:?}", other),
        }
    }
}
