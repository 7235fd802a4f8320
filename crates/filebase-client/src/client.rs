//! Channel client implementation
//!
//! Calls are correlated through an explicit pending-call table
//! (`rid -> oneshot sender`) and a single inbound dispatcher that resolves,
//! rejects or removes entries by id. Timeouts and channel close both clean
//! the table; a late response for an abandoned call finds no entry and is
//! dispatched as an event instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use filebase_common::{correlation_id, ChannelMessage, FilebaseError, Result};

/// Identifies one event subscription for [`ChannelClient::off`].
pub type ListenerId = u64;

type EventCallback = Arc<dyn Fn(&[Value]) + Send + Sync>;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

struct Listener {
    id: ListenerId,
    once: bool,
    callback: EventCallback,
}

struct SharedState {
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    listener_seq: AtomicU64,
}

impl SharedState {
    fn new() -> Self {
        SharedState {
            pending: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            listener_seq: AtomicU64::new(0),
        }
    }
}

/// A persistent channel to one served page.
pub struct ChannelClient {
    state: Arc<SharedState>,
    outbound: mpsc::UnboundedSender<ChannelMessage>,
    call_timeout: Duration,
}

impl ChannelClient {
    /// Opens a channel to a served file, e.g. `ws://host:port/index.html`.
    pub async fn connect(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| FilebaseError::Transport(format!("connect {} failed: {}", url, e)))?;
        let (mut sink, mut stream) = ws.split();

        let state = Arc::new(SharedState::new());
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ChannelMessage>();

        let reader_state = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let Ok(text) = frame.encode() else { continue };
                        if sink.send(Message::text(text)).await.is_err() {
                            break;
                        }
                    }
                    inbound = stream.next() => {
                        match inbound {
                            Some(Ok(Message::Text(text))) => dispatch_inbound(&reader_state, &text),
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::debug!("channel transport fault: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            // Dropping the senders rejects every call still in flight right
            // away instead of leaving each to its own timeout.
            reader_state.pending.lock().unwrap().clear();
        });

        Ok(ChannelClient {
            state,
            outbound,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    /// Overrides the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Invokes a server procedure and awaits its result.
    ///
    /// Rejects with [`FilebaseError::CallTimeout`] when no response arrives
    /// in time and with [`FilebaseError::ChannelClosed`] when the channel
    /// goes away underneath the call. Cleanup is idempotent either way.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let rid = correlation_id();
        let (tx, rx) = oneshot::channel();
        self.state.pending.lock().unwrap().insert(rid.clone(), tx);

        let frame = ChannelMessage::call(name, args, rid.clone());
        if self.outbound.send(frame).is_err() {
            self.state.pending.lock().unwrap().remove(&rid);
            return Err(FilebaseError::ChannelClosed);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                self.state.pending.lock().unwrap().remove(&rid);
                Err(FilebaseError::ChannelClosed)
            }
            Err(_) => {
                self.state.pending.lock().unwrap().remove(&rid);
                Err(FilebaseError::CallTimeout(self.call_timeout.as_millis() as u64))
            }
        }
    }

    /// Subscribes to a server-pushed event.
    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.add_listener(event.into(), Arc::new(callback), false)
    }

    /// Subscribes for a single delivery.
    pub fn once<F>(&self, event: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.add_listener(event.into(), Arc::new(callback), true)
    }

    /// Removes one subscription. Unknown ids are ignored.
    pub fn off(&self, event: &str, id: ListenerId) {
        let mut listeners = self.state.listeners.lock().unwrap();
        if let Some(list) = listeners.get_mut(event) {
            list.retain(|l| l.id != id);
            if list.is_empty() {
                listeners.remove(event);
            }
        }
    }

    /// Number of calls currently in flight.
    pub fn pending_calls(&self) -> usize {
        self.state.pending.lock().unwrap().len()
    }

    /// Number of listeners registered for an event.
    pub fn listener_count(&self, event: &str) -> usize {
        self.state
            .listeners
            .lock()
            .unwrap()
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn add_listener(&self, event: String, callback: EventCallback, once: bool) -> ListenerId {
        let id = self.state.listener_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .listeners
            .lock()
            .unwrap()
            .entry(event)
            .or_default()
            .push(Listener { id, once, callback });
        id
    }
}

/// Routes one inbound frame: a pending correlation id resolves its call;
/// anything else is dispatched as a named event.
fn dispatch_inbound(state: &SharedState, text: &str) {
    let msg = match ChannelMessage::decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!("dropping malformed inbound frame: {}", e);
            return;
        }
    };

    if let Some(tx) = state.pending.lock().unwrap().remove(&msg.name) {
        let _ = tx.send(msg.args.into_iter().next().unwrap_or(Value::Null));
        return;
    }

    let callbacks: Vec<EventCallback> = {
        let mut listeners = state.listeners.lock().unwrap();
        let Some(list) = listeners.get_mut(&msg.name) else {
            return;
        };
        let callbacks = list.iter().map(|l| l.callback.clone()).collect();
        list.retain(|l| !l.once);
        if list.is_empty() {
            listeners.remove(&msg.name);
        }
        callbacks
    };
    for callback in callbacks {
        callback(&msg.args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn state_only_client() -> (Arc<SharedState>, ChannelClient) {
        let state = Arc::new(SharedState::new());
        let (outbound, _rx) = mpsc::unbounded_channel();
        let client = ChannelClient {
            state: state.clone(),
            outbound,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        };
        (state, client)
    }

    #[test]
    fn test_response_resolves_pending_call() {
        let (state, client) = state_only_client();
        let (tx, mut rx) = oneshot::channel();
        state.pending.lock().unwrap().insert("rid1".into(), tx);

        let frame = ChannelMessage::response("rid1", json!({"a": 1}))
            .encode()
            .unwrap();
        dispatch_inbound(&state, &frame);

        assert_eq!(rx.try_recv().unwrap(), json!({"a": 1}));
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn test_events_reach_listeners() {
        let (state, client) = state_only_client();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_on = hits.clone();
        client.on("tick", move |_args| {
            hits_on.fetch_add(1, Ordering::SeqCst);
        });

        let frame = ChannelMessage::event("tick", json!(1)).encode().unwrap();
        dispatch_inbound(&state, &frame);
        dispatch_inbound(&state, &frame);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_once_listener_fires_a_single_time() {
        let (state, client) = state_only_client();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_once = hits.clone();
        client.once("tick", move |_args| {
            hits_once.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(client.listener_count("tick"), 1);

        let frame = ChannelMessage::event("tick", json!(1)).encode().unwrap();
        dispatch_inbound(&state, &frame);
        dispatch_inbound(&state, &frame);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(client.listener_count("tick"), 0);
    }

    #[test]
    fn test_off_removes_listener() {
        let (_state, client) = state_only_client();
        let id = client.on("tick", |_args| {});
        assert_eq!(client.listener_count("tick"), 1);
        client.off("tick", id);
        assert_eq!(client.listener_count("tick"), 0);
        // unknown ids are a no-op
        client.off("tick", 999);
    }

    #[test]
    fn test_unmatched_frame_without_listeners_is_dropped() {
        let (state, client) = state_only_client();
        let frame = ChannelMessage::event("nobody-home", json!(1)).encode().unwrap();
        dispatch_inbound(&state, &frame);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_on_closed_channel_rejects() {
        let state = Arc::new(SharedState::new());
        let (outbound, rx) = mpsc::unbounded_channel();
        drop(rx); // channel task is gone
        let client = ChannelClient {
            state,
            outbound,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        };
        let err = client.call("echo", vec![]).await.unwrap_err();
        assert!(matches!(err, FilebaseError::ChannelClosed));
        assert_eq!(client.pending_calls(), 0);
    }
}
