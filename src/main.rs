//! rpc-relay
//!
//! Relays HTTP POST calls to a JSON-RPC backend.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌────────────────────────────────────────────────┐
//!                      │                    RELAY                        │
//!   Client Request     │  ┌──────────┐   ┌──────────┐   ┌───────────┐   │
//!   ───────────────────┼─▶│   net    │──▶│  reader  │──▶│ forwarder │───┼──▶ Backend
//!                      │  │ listener │   │ (bounded)│   │  (framed) │   │    (JSON-RPC)
//!                      │  └──────────┘   └──────────┘   └─────┬─────┘   │
//!   Client Response    │                 ┌──────────┐         │         │
//!   ◀──────────────────┼─────────────────│responder │◀────────┘         │
//!                      │                 └──────────┘                   │
//!                      │  config · observability · resilience · lifecycle│
//!                      └────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `rpc-relay [OPTIONS] <METHOD> <HOST> <PORT> <PATH> [BODY] [HEADERS]...`

use clap::{CommandFactory, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use rpc_relay::config::LogFormat;
use rpc_relay::http::BuildError;
use rpc_relay::lifecycle::{prepare, wait_for_signal, Invocation, Prepared, Shutdown};
use rpc_relay::observability::{init_logging, init_metrics};
use rpc_relay::relay::{RelayError, RelayResult, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "rpc-relay", version)]
#[command(about = "Relay HTTP POST calls to a JSON-RPC backend", long_about = None)]
struct Cli {
    /// HTTP method of the relayed calls (only POST is supported)
    method: String,

    /// Host to listen on; also used in the template's Host header
    host: String,

    /// Port to listen on (invalid values fall back to 80)
    port: String,

    /// Request path sent to the backend
    path: String,

    /// Body sent when a client call has none
    body: Option<String>,

    /// Extra header lines, e.g. "Authorization: Basic ..."
    headers: Vec<String>,

    /// Backend URL, e.g. http://127.0.0.1:8332
    #[arg(long, env = "RELAY_BACKEND")]
    backend: Option<String>,

    /// TOML configuration file
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Relay a single connection, then exit
    #[arg(long)]
    once: bool,

    /// Print the request template and exit without touching the network
    #[arg(long)]
    dry_run: bool,

    /// Log output format
    #[arg(long, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn invocation(&self) -> Invocation {
        Invocation {
            method: self.method.clone(),
            host: self.host.clone(),
            port: self.port.clone(),
            path: self.path.clone(),
            body: self.body.clone(),
            headers: self.headers.clone(),
            backend: self.backend.clone(),
            config_path: self.config.clone(),
            log_format: self.log_format,
        }
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat, String> {
    match raw.to_ascii_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("unknown log format '{}' (expected pretty or json)", other)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are not failures.
            let code = if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
            let _ = e.print();
            return code;
        }
    };

    let prepared = match prepare(&cli.invocation()) {
        Ok(prepared) => prepared,
        Err(RelayError::Build(BuildError::UnsupportedMethod(method))) => {
            eprintln!("rpc-relay: unsupported method '{}': only POST is supported", method);
            eprintln!("{}", Cli::command().render_usage());
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("rpc-relay: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if cli.dry_run {
        print!("{}", String::from_utf8_lossy(&prepared.template.to_bytes()));
        return ExitCode::SUCCESS;
    }

    init_logging(&prepared.config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rpc-relay starting");

    if let Some(address) = &prepared.config.observability.metrics_address {
        match address.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => {
                tracing::error!(metrics_address = %address, "Failed to parse metrics address");
            }
        }
    }

    match run(cli.once, prepared).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, kind = ?e.kind(), "Relay stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(once: bool, prepared: Prepared) -> RelayResult<()> {
    tracing::info!(
        host = %prepared.config.listener.host,
        port = prepared.config.listener.port,
        backend = %prepared.config.backend.url,
        inbound_capacity = prepared.config.limits.inbound_capacity,
        "Configuration loaded"
    );

    let server = RelayServer::new(prepared.config, prepared.template)?;
    let listener = server.bind().await?;

    if once {
        let status = server.serve_once(&listener).await?;
        tracing::info!(status, "Single exchange complete");
        return Ok(());
    }

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.trigger();
    });

    server.run(listener, receiver).await
}
