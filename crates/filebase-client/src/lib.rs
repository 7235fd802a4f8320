//! Filebase Channel Client
//!
//! Rust-side counterpart of the generated browser stub script: a persistent
//! channel over WebSocket with correlated calls and named push events.
//!
//! # Example
//!
//! ```no_run
//! use filebase_client::ChannelClient;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = ChannelClient::connect("ws://127.0.0.1:8080/index.html")
//!         .await
//!         .unwrap();
//!     let result = client.call("echo", vec![json!({"a": 1})]).await.unwrap();
//!     assert_eq!(result, json!({"a": 1}));
//! }
//! ```

pub mod client;

pub use client::{ChannelClient, ListenerId};
