//! Filebase Common Types
//!
//! This crate provides the channel protocol definitions and the shared error
//! taxonomy for the filebase web service.
//!
//! # Overview
//!
//! Filebase serves a directory tree as a combined static-file / rendered-template /
//! remote-procedure endpoint. The pieces every component agrees on live here:
//!
//! - **Protocol Layer**: the channel wire frames, correlation id generation,
//!   and error types
//!
//! # Wire Format
//!
//! Channel messages are JSON text frames. Both directions share one shape:
//!
//! - client → server call: `{ "name": "<procedure>", "args": [...], "rid": "<id>" }`
//! - server → client response: `{ "name": "<rid>", "args": [<result>] }`
//! - server → client push or error: `{ "name": "<event>" | "error", "args": [<payload>] }`
//!
//! # Example
//!
//! ```
//! use filebase_common::{ChannelMessage, correlation_id};
//! use serde_json::json;
//!
//! let rid = correlation_id();
//! let call = ChannelMessage::call("echo", vec![json!({"a": 1})], rid.clone());
//! let reply = ChannelMessage::response(rid.clone(), json!({"a": 1}));
//! assert_eq!(reply.name, rid);
//! ```

pub mod protocol;

pub use protocol::*;
