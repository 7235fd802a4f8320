//! Filebase Server
//!
//! This crate serves a directory tree as a combined static-file /
//! rendered-template / remote-procedure endpoint.
//!
//! For each incoming request the dispatcher resolves a backing file, obtains
//! (or reuses) an [`Environment`] describing the callable procedures and
//! template variables available for that file, and hands the request to one
//! of three terminal handlers: a persistent channel (WebSocket RPC), a
//! one-shot procedure call, or a rendered/static file response.
//!
//! # Components
//!
//! - [`capability`] - tagged procedure/variable/hook values and classification
//! - [`runtime`] - companion-module execution (Boa JavaScript engine)
//! - [`environment`] - per-file environment construction
//! - [`bank`] - the environment cache with staleness detection
//! - [`dispatch`] - request classification and the terminal handlers
//! - [`channel`] - the server side of the channel RPC protocol
//! - [`render`] - the file-render collaborator seam
//! - [`http_server`] - hyper accept loop
//!
//! # Companion code files
//!
//! For a served file `name.ext`, a JavaScript module at `name.code.js` in the
//! same directory may export additional capabilities for that file:
//!
//! ```js
//! page.register("greeting", "hello");            // variable
//! page.register("echo", function (page, msg) {   // procedure
//!     return { msg: msg };
//! });
//! page.hook("guard", function (page) {           // request hook
//!     return null; // continue the pipeline
//! });
//! ```

pub mod bank;
pub mod capability;
pub mod channel;
pub mod dispatch;
pub mod environment;
pub mod http_server;
pub mod render;
pub mod runtime;

pub use bank::{BankConfig, EnvironmentBank, EnvironmentSource};
pub use capability::{Capability, CapabilityKind, CapabilityRegistry, CallScope};
pub use dispatch::{Dispatcher, ServeConfig};
pub use environment::{Environment, EnvironmentBuilder};
pub use http_server::HttpServer;
