//! # Filebase CLI Entry Point
//!
//! Main binary for the filebase web service. Serves a directory tree as a
//! combined static-file / template / remote-procedure endpoint, or makes a
//! single procedure call against a running server.
//!
//! ## Usage
//!
//! ```bash
//! # Serve ./public on port 8080
//! filebase serve -r ./public -b 0.0.0.0:8080
//!
//! # Call a procedure on a served page (outputs raw JSON)
//! filebase call ws://127.0.0.1:8080/index.html echo -a '["hello"]'
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;

use filebase_client::ChannelClient;
use filebase_server::bank::BankConfig;
use filebase_server::{CapabilityRegistry, Dispatcher, HttpServer, ServeConfig};

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs)]
/// Filebase - serve a directory tree with per-file server procedures
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
}

/// Arguments for serving a directory tree.
///
/// Every file under the root is reachable by its relative path. A colocated
/// `<name>.code.js` module adds procedures, variables and request hooks to
/// that file's environment.
///
/// # Example
///
/// ```bash
/// filebase serve -r ./public -b 0.0.0.0:8080
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve a directory tree
struct ServeArgs {
    /// root directory to serve
    ///
    /// Defaults to "./public".
    #[argh(option, short = 'r', default = "\"./public\".into()")]
    root: String,

    /// address to bind the HTTP server to
    ///
    /// Defaults to "0.0.0.0:8080".
    #[argh(option, short = 'b', default = "\"0.0.0.0:8080\".into()")]
    bind: String,

    /// API version accepted in one-shot call queries
    ///
    /// One-shot calls use ?api=<version>&call=<procedure>. Defaults to "v1".
    #[argh(option, long = "api-version", default = "\"v1\".into()")]
    api_version: String,

    /// companion code file suffix
    ///
    /// For a served file name.ext the companion module is name.<suffix> in
    /// the same directory. Defaults to "code.js".
    #[argh(option, long = "code-suffix", default = "\"code.js\".into()")]
    code_suffix: String,

    /// minimum milliseconds between freshness checks per cached environment
    ///
    /// Within this window requests reuse the cached environment without any
    /// filesystem stats. Defaults to 1000ms.
    #[argh(option, long = "revalidate-ms", default = "1000")]
    revalidate_ms: u64,

    /// seconds a cached environment may go unvalidated before eviction
    ///
    /// Defaults to 300 seconds.
    #[argh(option, long = "max-lifetime-secs", default = "300")]
    max_lifetime_secs: u64,

    /// minimum seconds between opportunistic cache cleanup sweeps
    ///
    /// Defaults to 60 seconds.
    #[argh(option, long = "cleanup-secs", default = "60")]
    cleanup_secs: u64,

    /// use the historical all-pairs mtime comparison for staleness
    ///
    /// Compares every current modification time against every stored one,
    /// which can rebuild environments whose files have not changed. Off by
    /// default; the per-file comparison is used instead.
    #[argh(switch, long = "all-pairs-staleness")]
    all_pairs_staleness: bool,
}

/// Arguments for making a single procedure call.
///
/// Opens a channel to the page, performs one call, and prints the raw JSON
/// result to stdout. Suitable for scripting and piping to jq.
///
/// # Example
///
/// ```bash
/// filebase call ws://127.0.0.1:8080/index.html echo -a '["hello"]'
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a procedure on a served page
struct CallArgs {
    /// channel URL of the served page (ws:// or http://, which is rewritten)
    #[argh(positional)]
    url: String,

    /// name of the procedure to call
    ///
    /// Must match a procedure exposed by the page's environment.
    #[argh(positional)]
    procedure: String,

    /// JSON arguments: an array, or a single value treated as one argument
    ///
    /// Defaults to `[]`.
    #[argh(option, short = 'a', long = "args", default = "\"[]\".into()")]
    args: String,

    /// per-call timeout in milliseconds
    ///
    /// Defaults to 15000ms.
    #[argh(option, long = "timeout-ms", default = "15000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call keeps stdout clean for unix tool usage; logs would pollute it
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Call(args) => call(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let addr: SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", args.bind))?;

    let root = std::fs::canonicalize(&args.root)
        .with_context(|| format!("root directory not found: {}", args.root))?;

    let mut config = ServeConfig::new(root.clone());
    config.api_version = args.api_version;
    config.code_suffix = args.code_suffix;

    let bank_config = BankConfig {
        revalidate_interval: Duration::from_millis(args.revalidate_ms),
        max_lifetime: Duration::from_secs(args.max_lifetime_secs),
        cleanup_interval: Duration::from_secs(args.cleanup_secs),
        all_pairs_staleness: args.all_pairs_staleness,
    };

    tracing::info!("serving {} on {}", root.display(), addr);

    let registry = Arc::new(CapabilityRegistry::new());
    let dispatcher = Arc::new(Dispatcher::new(config, registry, bank_config));
    HttpServer::new(dispatcher).run(addr).await?;
    Ok(())
}

async fn call(args: CallArgs) -> Result<()> {
    let url = rewrite_channel_url(&args.url);

    let parsed: serde_json::Value = serde_json::from_str(&args.args)
        .with_context(|| format!("arguments are not valid JSON: {}", args.args))?;
    let call_args = match parsed {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };

    let client = ChannelClient::connect(url)
        .await?
        .with_call_timeout(Duration::from_millis(args.timeout_ms));
    let result = client.call(&args.procedure, call_args).await?;

    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

/// Accepts http:// and https:// URLs as channel targets.
fn rewrite_channel_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else {
        url.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_channel_url() {
        assert_eq!(
            rewrite_channel_url("http://127.0.0.1:8080/index.html"),
            "ws://127.0.0.1:8080/index.html"
        );
        assert_eq!(
            rewrite_channel_url("https://example.com/a.html"),
            "wss://example.com/a.html"
        );
        assert_eq!(
            rewrite_channel_url("ws://127.0.0.1:8080/index.html"),
            "ws://127.0.0.1:8080/index.html"
        );
    }
}
