//! Server side of the channel RPC protocol
//!
//! One task per open channel. Inbound call frames are resolved against the
//! environment's procedure table; handler failures become application-level
//! error frames and never close the channel. Only transport faults do.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use hyper_tungstenite::tungstenite::Message;
use hyper_tungstenite::HyperWebsocket;
use serde_json::json;
use tokio::sync::mpsc;

use filebase_common::{ChannelMessage, FilebaseError, Result};

use crate::capability::{CallScope, EventPusher};
use crate::environment::Environment;

/// Drives one channel to completion.
///
/// The outbound queue carries both call responses and events pushed by
/// procedure handlers through the scope's [`EventPusher`].
pub(crate) async fn serve_channel(
    websocket: HyperWebsocket,
    env: Arc<Environment>,
    scope: CallScope,
) -> Result<()> {
    let ws = websocket
        .await
        .map_err(|e| FilebaseError::Transport(e.to_string()))?;
    let (mut sink, mut stream) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ChannelMessage>();
    let scope = CallScope {
        pusher: Some(EventPusher::new(tx.clone())),
        ..scope
    };

    tracing::debug!(path = %env.source_path().display(), "channel open");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(frame) = outbound else { break };
                let text = frame.encode()?;
                if sink.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    None => break,
                    Some(Err(e)) => {
                        tracing::debug!("channel transport fault: {}", e);
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = process_frame(&env, &scope, &text).await {
                            let _ = tx.send(reply);
                        }
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {} // ping/pong/binary are transport noise
                }
            }
        }
    }

    tracing::debug!(path = %env.source_path().display(), "channel closed");
    Ok(())
}

/// Handles one inbound frame, per-message errors included.
async fn process_frame(
    env: &Environment,
    scope: &CallScope,
    text: &str,
) -> Option<ChannelMessage> {
    let msg = match ChannelMessage::decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            return Some(ChannelMessage::error(json!({ "message": e.to_string() })));
        }
    };
    let Some(rid) = msg.rid.clone() else {
        return Some(ChannelMessage::error(json!({
            "message": "call frame is missing a correlation id",
            "name": msg.name,
        })));
    };

    match env.invoke_procedure(&msg.name, scope.clone(), msg.args).await {
        Ok(result) => Some(ChannelMessage::response(rid, result)),
        Err(e) => Some(ChannelMessage::error(json!({
            "message": e.to_string(),
            "name": msg.name,
        }))),
    }
}
