mod broker;
mod config;
mod protocol;
mod sandbox;
mod shell;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::Broker;
use crate::config::Config;
use crate::protocol::{decode_request, encode_event};

fn print_help() {
    println!(
        "\
wasibox v{}

A sandboxed command-execution broker. Reads JSON requests one per line on
stdin, runs them in a WASI sandbox (wasmtime) or a builtin fallback
interpreter, and streams JSON events one per line on stdout.

USAGE:
    wasibox [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/wasibox.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing (stderr)
                (e.g. debug, wasibox=debug,warn)

EXAMPLES:
    wasibox                               # uses config/wasibox.toml if present
    wasibox /etc/wasibox/broker.toml      # custom config path
    echo '{{\"type\":\"Init\"}}' | wasibox    # one-shot init handshake",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("wasibox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Logging goes to stderr: stdout is the event channel.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wasibox=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // An explicitly given config path must load; the default path is
    // optional and falls back to built-in defaults.
    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(&path)?
        }
        None => {
            let default_path = "config/wasibox.toml";
            if std::path::Path::new(default_path).exists() {
                info!("Loading configuration from {default_path}");
                Config::load(default_path)?
            } else {
                Config::default()
            }
        }
    };

    info!("wasibox v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Shell image: {}", config.sandbox.shell_image.display());
    info!("Registry: {}", config.registry.url_template);

    let (requests, mut events) = Broker::spawn(config);

    // Outbound: one JSON line per event.
    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", encode_event(&event));
        }
    });

    // Inbound: one JSON line per request. Malformed lines are logged and
    // skipped, never fatal.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match decode_request(trimmed) {
                            Ok(request) => {
                                if requests.send(request).await.is_err() {
                                    warn!("broker stopped, exiting");
                                    break;
                                }
                            }
                            Err(e) => warn!("ignoring malformed request: {e}"),
                        }
                    }
                    None => {
                        info!("stdin closed, exiting");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                break;
            }
        }
    }

    // Dropping the request sender stops the dispatcher; let the writer
    // flush whatever events are already in flight.
    drop(requests);
    let _ = writer.await;
    Ok(())
}
